use std::fmt;

/// Crate-wide error type. Domain errors (`JobQueueError`, `KeyRotationError`)
/// convert into this at service boundaries.
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Validation errors
    Validation(String),

    /// Not found errors
    NotFound(String),

    /// Job queue errors
    Queue(crate::jobs::JobQueueError),

    /// Key storage / rotation errors
    KeyRotation(crate::keys::KeyRotationError),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Queue(e) => write!(f, "Job queue error: {}", e),
            Error::KeyRotation(e) => write!(f, "Key rotation error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Queue(e) => Some(e),
            Error::KeyRotation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<crate::jobs::JobQueueError> for Error {
    fn from(error: crate::jobs::JobQueueError) -> Self {
        Error::Queue(error)
    }
}

impl From<crate::keys::KeyRotationError> for Error {
    fn from(error: crate::keys::KeyRotationError) -> Self {
        Error::KeyRotation(error)
    }
}

impl Error {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Classification used for operational dashboards / logging fields.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Queue(_) => "queue",
            Error::KeyRotation(_) => "key_rotation",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("bad input");
        assert_eq!(err.to_string(), "Validation error: bad input");
        assert_eq!(err.category(), "validation");
    }
}
