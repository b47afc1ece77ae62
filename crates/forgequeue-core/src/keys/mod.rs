//! Encryption key material, rotation, and the AEAD provider that guards
//! job payloads and any application tables enrolled in rotation.

pub mod provider;
pub mod record;
pub mod rotation;
pub mod store;

pub use provider::EncryptionProvider;
pub use record::{AuxiliarySecrets, KeyRecord};
pub use rotation::KeyRotationService;
pub use store::KeyStore;

/// §6.5-equivalent error taxonomy for the key/rotation subsystem.
#[derive(Debug, thiserror::Error)]
pub enum KeyRotationError {
    /// The on-disk key file failed structural validation. Non-recoverable;
    /// an operator must restore from backup.
    #[error("key storage corrupted, manual recovery required: {0}")]
    KeyStorageCorruption(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("decrypt failed: {0}")]
    DecryptError(String),
    #[error("a rotation is already in progress")]
    RotationAlreadyInProgress,
    #[error("key file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
