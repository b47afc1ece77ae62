pub mod config;
pub mod error;
pub mod events;
pub mod instance;
pub mod jobs;
pub mod keys;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, SubscriptionId};
pub use instance::instance_id;
pub use jobs::{
    CancellationStatus, CancellationToken, ExecutionMode, Job, JobCancellationSignal, JobCounts,
    JobFilter, JobHandler, JobId, JobProcessorService, JobQueueError, JobQueueService, JobStatus,
    NewJob,
};
pub use keys::{AuxiliarySecrets, EncryptionProvider, KeyRecord, KeyRotationError, KeyRotationService, KeyStore};
pub use store::{EncryptedRow, Migration, PgMigrator, PgStore, SqliteMigrator, SqliteStore, Store};

/// Current crate version, surfaced for diagnostics (`--version`, startup logs).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_creation() {
        let err = Error::validation("Test validation error");
        assert_eq!(err.category(), "validation");
    }
}
