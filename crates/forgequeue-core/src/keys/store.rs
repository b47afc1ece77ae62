//! §4.6 `KeyStore`: atomic on-disk persistence of the key record.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;

use super::record::{AuxiliarySecrets, KeyRecord};
use super::KeyRotationError;

type KeyGenerator = Box<dyn Fn() -> [u8; 32] + Send + Sync>;

/// Owns the on-disk key file. Reads/writes go through `validate()` so a
/// corrupt or half-written record is never silently accepted.
pub struct KeyStore {
    path: PathBuf,
    generator: KeyGenerator,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generator: Box::new(default_generator),
        }
    }

    /// Swap in a deterministic generator for tests.
    pub fn with_generator(path: impl Into<PathBuf>, generator: impl Fn() -> [u8; 32] + Send + Sync + 'static) -> Self {
        Self {
            path: path.into(),
            generator: Box::new(generator),
        }
    }

    pub fn generate_key(&self) -> String {
        STANDARD.encode((self.generator)())
    }

    pub fn get_next_version(&self, v: char) -> char {
        KeyRecord::next_version(v)
    }

    pub fn is_rotation_in_progress(&self, record: &KeyRecord) -> bool {
        record.is_rotation_in_progress()
    }

    /// `None` if the file does not exist. `KeyStorageCorruption` if it
    /// exists but fails to parse or validate.
    pub fn load_keys(&self) -> Result<Option<KeyRecord>, KeyRotationError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeyRotationError::Io(e)),
        };

        let record: KeyRecord = serde_json::from_str(&contents)
            .map_err(|e| KeyRotationError::KeyStorageCorruption(format!("malformed key file: {}", e)))?;
        record.validate_or_corrupt()?;
        Ok(Some(record))
    }

    /// Write-to-temp-in-same-directory → fsync → rename, so readers never
    /// observe a partially written file.
    pub fn save_keys(&self, record: &KeyRecord) -> Result<(), KeyRotationError> {
        record.validate_or_corrupt()?;

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp_path = dir.join(format!(".{}.tmp-{}", file_stem(&self.path), Uuid::new_v4()));

        let json = serde_json::to_string_pretty(record)?;
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// Returns the existing record, or creates and persists an initial one
    /// with three fresh keys and `current_version = 'A'`.
    pub fn ensure_initialized(&self) -> Result<KeyRecord, KeyRotationError> {
        if let Some(record) = self.load_keys()? {
            return Ok(record);
        }

        info!(path = %self.path.display(), "initializing new key record");
        let record = KeyRecord {
            current_key: self.generate_key(),
            current_version: 'A',
            phased_out_key: None,
            phased_out_version: None,
            last_rotation_finished_at: Utc::now(),
            auxiliary_secrets: AuxiliarySecrets {
                auth_secret: self.generate_key(),
                hash_key: self.generate_key(),
            },
        };
        self.save_keys(&record)?;
        Ok(record)
    }
}

fn default_generator() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn file_stem(path: &std::path::Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "keys".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.json"));

        let created = store.ensure_initialized().unwrap();
        let loaded = store.load_keys().unwrap().unwrap();
        assert_eq!(created.current_key, loaded.current_key);
        assert_eq!(loaded.current_version, 'A');
    }

    #[test]
    fn test_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("missing.json"));
        assert!(store.load_keys().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "not json").unwrap();

        let store = KeyStore::new(path);
        assert!(matches!(store.load_keys(), Err(KeyRotationError::KeyStorageCorruption(_))));
    }

    #[test]
    fn test_injectable_generator_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::with_generator(dir.path().join("keys.json"), || [7u8; 32]);
        assert_eq!(store.generate_key(), store.generate_key());
    }
}
