//! §4.7 `EncryptionProvider`: AES-256-GCM, hot-swappable keys, and the
//! rotation lock that keeps re-encryption self-consistent with live traffic.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::record::KeyRecord;
use super::KeyRotationError;

struct Keys {
    current_key: [u8; 32],
    current_version: char,
    phased_out_key: Option<[u8; 32]>,
    phased_out_version: Option<char>,
}

fn decode_key(b64: &str) -> Result<[u8; 32], KeyRotationError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| KeyRotationError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| KeyRotationError::InvalidKey("key is not 32 bytes".to_string()))
}

impl Keys {
    fn from_record(record: &KeyRecord) -> Result<Self, KeyRotationError> {
        let phased_out_key = record.phased_out_key.as_deref().map(decode_key).transpose()?;
        Ok(Self {
            current_key: decode_key(&record.current_key)?,
            current_version: record.current_version,
            phased_out_key,
            phased_out_version: record.phased_out_version,
        })
    }
}

/// Versioned AEAD envelope over the key record. Cheap to clone via `Arc`;
/// internal state is behind a lock so key rotation can hot-swap it.
pub struct EncryptionProvider {
    keys: RwLock<Keys>,
    rotation_lock: Mutex<()>,
}

impl EncryptionProvider {
    pub fn new(record: &KeyRecord) -> Result<Self, KeyRotationError> {
        Ok(Self {
            keys: RwLock::new(Keys::from_record(record)?),
            rotation_lock: Mutex::new(()),
        })
    }

    /// Hot-swap the active key material. Atomic from callers' perspective:
    /// a reader either sees the whole old set or the whole new one.
    pub async fn update_keys(&self, record: &KeyRecord) -> Result<(), KeyRotationError> {
        let updated = Keys::from_record(record)?;
        *self.keys.write().await = updated;
        Ok(())
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<String, KeyRotationError> {
        let _permit = self.rotation_lock.lock().await;
        self.encrypt_unlocked(plaintext).await
    }

    pub async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, KeyRotationError> {
        let _permit = self.rotation_lock.lock().await;
        self.decrypt_unlocked(ciphertext).await
    }

    /// For callers already holding the rotation lock (the re-encryption
    /// batch loop). Does not itself acquire the lock.
    pub async fn encrypt_unlocked(&self, plaintext: &[u8]) -> Result<String, KeyRotationError> {
        let keys = self.keys.read().await;
        let cipher = Aes256Gcm::new_from_slice(&keys.current_key)
            .map_err(|e| KeyRotationError::InvalidKey(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyRotationError::InvalidKey(e.to_string()))?;

        let mut body = nonce.to_vec();
        body.extend(ciphertext);
        Ok(format!("{}{}", keys.current_version, STANDARD.encode(body)))
    }

    pub async fn decrypt_unlocked(&self, ciphertext: &str) -> Result<Vec<u8>, KeyRotationError> {
        let mut chars = ciphertext.chars();
        let version = chars
            .next()
            .ok_or_else(|| KeyRotationError::DecryptError("empty ciphertext".to_string()))?;
        let body = chars.as_str();

        let keys = self.keys.read().await;
        let key_bytes = if version == keys.current_version {
            &keys.current_key
        } else if keys.phased_out_version == Some(version) {
            keys.phased_out_key
                .as_ref()
                .ok_or_else(|| KeyRotationError::DecryptError(format!("no phased-out key for prefix '{}'", version)))?
        } else {
            return Err(KeyRotationError::DecryptError(format!("unknown key version prefix '{}'", version)));
        };

        let raw = STANDARD
            .decode(body)
            .map_err(|e| KeyRotationError::DecryptError(e.to_string()))?;
        if raw.len() < 12 {
            return Err(KeyRotationError::DecryptError("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, sealed) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(key_bytes).map_err(|e| KeyRotationError::InvalidKey(e.to_string()))?;
        cipher
            .decrypt(nonce, sealed)
            .map_err(|e| KeyRotationError::DecryptError(e.to_string()))
    }

    /// Blocks other `encrypt`/`decrypt` callers until dropped. Grounded on
    /// §4.9: the re-encryption loop must hold this across every batch so
    /// no request observes a half-migrated row it just wrote.
    pub async fn acquire_rotation_lock(&self) -> RotationLockGuard<'_> {
        let guard = self.rotation_lock.lock().await;
        RotationLockGuard {
            provider: self,
            _guard: guard,
        }
    }
}

pub struct RotationLockGuard<'a> {
    provider: &'a EncryptionProvider,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> RotationLockGuard<'a> {
    pub async fn encrypt_unlocked(&self, plaintext: &[u8]) -> Result<String, KeyRotationError> {
        self.provider.encrypt_unlocked(plaintext).await
    }

    pub async fn decrypt_unlocked(&self, ciphertext: &str) -> Result<Vec<u8>, KeyRotationError> {
        self.provider.decrypt_unlocked(ciphertext).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::record::AuxiliarySecrets;
    use chrono::Utc;

    fn record_with(version: char, phased_out: Option<char>) -> KeyRecord {
        KeyRecord {
            current_key: STANDARD.encode([1u8; 32]),
            current_version: version,
            phased_out_key: phased_out.map(|_| STANDARD.encode([2u8; 32])),
            phased_out_version: phased_out,
            last_rotation_finished_at: Utc::now(),
            auxiliary_secrets: AuxiliarySecrets {
                auth_secret: STANDARD.encode([3u8; 32]),
                hash_key: STANDARD.encode([4u8; 32]),
            },
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let provider = EncryptionProvider::new(&record_with('A', None)).unwrap();
        let ciphertext = provider.encrypt(b"super secret").await.unwrap();
        assert!(ciphertext.starts_with('A'));
        let plaintext = provider.decrypt(&ciphertext).await.unwrap();
        assert_eq!(plaintext, b"super secret");
    }

    #[tokio::test]
    async fn test_decrypts_with_phased_out_key_after_rotation() {
        let provider = EncryptionProvider::new(&record_with('A', None)).unwrap();
        let old_ciphertext = provider.encrypt(b"legacy payload").await.unwrap();

        provider.update_keys(&record_with('B', Some('A'))).await.unwrap();

        let new_ciphertext = provider.encrypt(b"fresh payload").await.unwrap();
        assert!(new_ciphertext.starts_with('B'));

        assert_eq!(provider.decrypt(&old_ciphertext).await.unwrap(), b"legacy payload");
        assert_eq!(provider.decrypt(&new_ciphertext).await.unwrap(), b"fresh payload");
    }

    #[tokio::test]
    async fn test_unknown_prefix_rejected() {
        let provider = EncryptionProvider::new(&record_with('A', None)).unwrap();
        let err = provider.decrypt("Zgarbage").await.unwrap_err();
        assert!(matches!(err, KeyRotationError::DecryptError(_)));
    }

    #[tokio::test]
    async fn test_rotation_lock_exposes_unlocked_calls() {
        let provider = EncryptionProvider::new(&record_with('A', None)).unwrap();
        let guard = provider.acquire_rotation_lock().await;
        let ciphertext = guard.encrypt_unlocked(b"batch row").await.unwrap();
        let plaintext = guard.decrypt_unlocked(&ciphertext).await.unwrap();
        assert_eq!(plaintext, b"batch row");
    }
}
