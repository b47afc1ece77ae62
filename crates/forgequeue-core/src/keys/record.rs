//! §3.2 persistent key record.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::KeyRotationError;

/// Secrets that ride along with the main encryption key but are consumed
/// by other subsystems (session auth, password hashing). `auth_secret`
/// rotates in lockstep with the main key; `hash_key` never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxiliarySecrets {
    pub auth_secret: String,
    pub hash_key: String,
}

/// §3.2 key record, persisted as a single JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub current_key: String,
    pub current_version: char,
    pub phased_out_key: Option<String>,
    pub phased_out_version: Option<char>,
    pub last_rotation_finished_at: DateTime<Utc>,
    pub auxiliary_secrets: AuxiliarySecrets,
}

impl KeyRecord {
    /// K1 ∧ K4: presence of a phased-out key means an unfinished rotation.
    pub fn is_rotation_in_progress(&self) -> bool {
        self.phased_out_key.is_some()
    }

    /// K3: 'A'..'Y' advance by one letter; 'Z' wraps to 'A'.
    pub fn next_version(v: char) -> char {
        if v == 'Z' {
            'A'
        } else {
            ((v as u8) + 1) as char
        }
    }

    /// Structural validation run on both load and save (§4.6).
    pub fn validate(&self) -> Result<(), String> {
        fn is_version_letter(c: char) -> bool {
            c.is_ascii_uppercase()
        }

        if !is_version_letter(self.current_version) {
            return Err(format!("current_version '{}' is not a single letter A-Z", self.current_version));
        }
        if STANDARD.decode(&self.current_key).is_err() {
            return Err("current_key is not valid base64".to_string());
        }

        match (&self.phased_out_key, self.phased_out_version) {
            (Some(key), Some(version)) => {
                // K1: both present.
                if !is_version_letter(version) {
                    return Err(format!("phased_out_version '{}' is not a single letter A-Z", version));
                }
                if STANDARD.decode(key).is_err() {
                    return Err("phased_out_key is not valid base64".to_string());
                }
                // K2: current_version must differ from phased_out_version.
                if version == self.current_version {
                    return Err("current_version and phased_out_version must differ".to_string());
                }
            }
            (None, None) => {}
            // K1: both present or both absent.
            _ => return Err("phased_out_key and phased_out_version must be both present or both absent".to_string()),
        }

        if STANDARD.decode(&self.auxiliary_secrets.auth_secret).is_err() {
            return Err("auth_secret is not valid base64".to_string());
        }
        if STANDARD.decode(&self.auxiliary_secrets.hash_key).is_err() {
            return Err("hash_key is not valid base64".to_string());
        }

        Ok(())
    }

    pub(crate) fn validate_or_corrupt(&self) -> Result<(), KeyRotationError> {
        self.validate().map_err(KeyRotationError::KeyStorageCorruption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> KeyRecord {
        KeyRecord {
            current_key: STANDARD.encode([1u8; 32]),
            current_version: 'A',
            phased_out_key: None,
            phased_out_version: None,
            last_rotation_finished_at: Utc::now(),
            auxiliary_secrets: AuxiliarySecrets {
                auth_secret: STANDARD.encode([2u8; 32]),
                hash_key: STANDARD.encode([3u8; 32]),
            },
        }
    }

    #[test]
    fn test_next_version_wraps() {
        assert_eq!(KeyRecord::next_version('A'), 'B');
        assert_eq!(KeyRecord::next_version('Y'), 'Z');
        assert_eq!(KeyRecord::next_version('Z'), 'A');
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(valid_record().validate().is_ok());
    }

    #[test]
    fn test_mismatched_phased_out_presence_rejected() {
        let mut record = valid_record();
        record.phased_out_version = Some('B');
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_equal_versions_rejected() {
        let mut record = valid_record();
        record.phased_out_key = Some(STANDARD.encode([4u8; 32]));
        record.phased_out_version = Some('A');
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_rotation_in_progress_detection() {
        let mut record = valid_record();
        assert!(!record.is_rotation_in_progress());
        record.phased_out_key = Some(STANDARD.encode([4u8; 32]));
        record.phased_out_version = Some('Z');
        assert!(record.is_rotation_in_progress());
    }
}
