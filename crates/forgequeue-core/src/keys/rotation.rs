//! §4.8/§4.9 `KeyRotationService`: drives the key record from
//! `(current=X, phased_out=None)` through `(current=Y, phased_out=X)` back
//! to `(current=Y, phased_out=None)`, re-encrypting every ciphertext
//! bearing prefix `X` in the interim.
//!
//! Per the Open Question resolution in SPEC_FULL.md §9, this runs
//! job-driven: it is registered under job type `"key_rotation"` and the
//! worker binary enqueues a cheap periodic check job rather than the
//! service running its own timer, so a single `JobProcessorService`
//! drives both the job queue and key rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::provider::RotationLockGuard;
use super::record::{AuxiliarySecrets, KeyRecord};
use super::{EncryptionProvider, KeyRotationError, KeyStore};
use crate::config::{KeyRotationConfig, RotationTableConfig};
use crate::jobs::{CancellationToken, HandlerResult, Job, JobHandler, JobQueueError};
use crate::store::{EncryptedRow, Store};
use crate::{Error, Result};

/// Outcome of a single check-and-rotate cycle (§4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Another rotation is already in flight in this process; no-op.
    AlreadyRotating,
    /// No rotation in progress and the interval hasn't elapsed yet.
    NotDue { next_due_at: DateTime<Utc> },
    /// A rotation ran to completion (freshly started, not resumed).
    Completed,
    /// A rotation that was already mid-flight on disk ran to completion.
    ResumedAndCompleted,
    /// Cooperative cancellation observed between tables/batches; progress
    /// up to that point is durable and the next cycle resumes it.
    Cancelled,
}

/// Guaranteed-run finalizer for the in-memory `is_rotating` flag (§4.8
/// step 8), so a mid-cycle error or early return never wedges the lock.
struct RotatingGuard<'a>(&'a AtomicBool);

impl Drop for RotatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates rotation end to end: resuming an interrupted rotation,
/// starting a new one when due, re-encrypting configured tables under the
/// provider's rotation lock, and committing completion.
pub struct KeyRotationService {
    key_store: Arc<KeyStore>,
    provider: Arc<EncryptionProvider>,
    store: Arc<dyn Store>,
    config: KeyRotationConfig,
    /// Serializes rotation attempts within this process (§4.8 step 1);
    /// the lock is serial, not parallel.
    is_rotating: AtomicBool,
    /// Observed between tables and between batches (§4.9); distinct from
    /// the per-job `CancellationToken` so a directly-invoked rotation
    /// (not running as a job) can still be asked to stop.
    stop_requested: AtomicBool,
}

impl KeyRotationService {
    pub fn new(key_store: Arc<KeyStore>, provider: Arc<EncryptionProvider>, store: Arc<dyn Store>, config: KeyRotationConfig) -> Arc<Self> {
        Arc::new(Self {
            key_store,
            provider,
            store,
            config,
            is_rotating: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn is_rotating(&self) -> bool {
        self.is_rotating.load(Ordering::SeqCst)
    }

    /// Observed at the same points as a job's `CancellationToken`; lets a
    /// directly-invoked (non-job) rotation be asked to stop cooperatively.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// One check cycle (§4.8): resumes an in-progress rotation, or starts
    /// a new one if due, or returns `NotDue`/`AlreadyRotating` otherwise.
    pub async fn check_and_rotate(&self) -> Result<RotationOutcome> {
        self.run_guarded(None, false).await
    }

    /// Bypasses the interval check but still refuses (rather than
    /// clobbers) if a rotation is already mid-flight in-memory or on disk
    /// — a mid-flight state resumes instead of starting a new one.
    pub async fn trigger_manual_rotation(&self) -> Result<RotationOutcome> {
        self.run_guarded(None, true).await
    }

    async fn run_guarded(&self, token: Option<&CancellationToken>, manual: bool) -> Result<RotationOutcome> {
        if self.is_rotating.swap(true, Ordering::SeqCst) {
            return Ok(RotationOutcome::AlreadyRotating);
        }
        let _guard = RotatingGuard(&self.is_rotating);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.run_cycle(token, manual).await
    }

    async fn run_cycle(&self, token: Option<&CancellationToken>, manual: bool) -> Result<RotationOutcome> {
        let record = self
            .key_store
            .load_keys()?
            .ok_or_else(|| Error::KeyRotation(KeyRotationError::KeyStorageCorruption("no key record on disk; call ensure_initialized first".to_string())))?;

        let (phased_out_version, resuming) = if record.is_rotation_in_progress() {
            info!(version = ?record.phased_out_version, "resuming in-progress rotation");
            (record.phased_out_version.expect("checked by is_rotation_in_progress"), true)
        } else {
            if !manual {
                let interval = chrono::Duration::from_std(self.config.rotation_interval()).unwrap_or_else(|_| chrono::Duration::zero());
                let next_due_at = record.last_rotation_finished_at + interval;
                if Utc::now() < next_due_at {
                    return Ok(RotationOutcome::NotDue { next_due_at });
                }
            }
            (self.start_new_rotation(&record).await?, false)
        };

        let cancelled = self.reencrypt_all_tables(phased_out_version, token).await?;
        if cancelled {
            warn!(version = %phased_out_version, "rotation cycle cancelled mid-flight; phased-out key persists for the next resume");
            return Ok(RotationOutcome::Cancelled);
        }

        self.finish_rotation().await?;
        info!(retired_version = %phased_out_version, "key rotation complete");
        Ok(if resuming {
            RotationOutcome::ResumedAndCompleted
        } else {
            RotationOutcome::Completed
        })
    }

    /// §4.8 step 5: swap current -> phased_out, mint a new current key and
    /// auth secret, persist, then hot-swap the provider. Returns the
    /// version being phased out (the selector prefix for re-encryption).
    async fn start_new_rotation(&self, record: &KeyRecord) -> Result<char> {
        let new_key = self.key_store.generate_key();
        let new_auth_secret = self.key_store.generate_key();
        let new_version = self.key_store.get_next_version(record.current_version);
        let retired_version = record.current_version;

        let updated = KeyRecord {
            current_key: new_key,
            current_version: new_version,
            phased_out_key: Some(record.current_key.clone()),
            phased_out_version: Some(retired_version),
            last_rotation_finished_at: record.last_rotation_finished_at,
            auxiliary_secrets: AuxiliarySecrets {
                auth_secret: new_auth_secret,
                hash_key: record.auxiliary_secrets.hash_key.clone(),
            },
        };

        self.key_store.save_keys(&updated).map_err(|e| {
            error!(error = %e, "failed to persist new rotation, aborting before any re-encryption");
            e
        })?;
        self.provider.update_keys(&updated).await?;

        info!(new_version = %new_version, retired_version = %retired_version, "started new key rotation");
        Ok(retired_version)
    }

    /// §4.8 step 7: clear phased-out material, stamp completion, and
    /// hot-swap the provider down to a single active key.
    async fn finish_rotation(&self) -> Result<()> {
        let record = self
            .key_store
            .load_keys()?
            .ok_or_else(|| Error::KeyRotation(KeyRotationError::KeyStorageCorruption("key record vanished mid-rotation".to_string())))?;

        let completed = KeyRecord {
            current_key: record.current_key.clone(),
            current_version: record.current_version,
            phased_out_key: None,
            phased_out_version: None,
            last_rotation_finished_at: Utc::now(),
            auxiliary_secrets: record.auxiliary_secrets.clone(),
        };

        if let Err(e) = self.key_store.save_keys(&completed) {
            error!(error = %e, "failed to persist completed rotation bookkeeping; re-encryption already finished, the next resume will correct it");
            return Err(e.into());
        }
        self.provider.update_keys(&completed).await?;
        Ok(())
    }

    /// §4.9: walks every configured table, checking for cancellation
    /// between each. Returns `true` if cancellation was observed.
    async fn reencrypt_all_tables(&self, phased_out_version: char, token: Option<&CancellationToken>) -> Result<bool> {
        for table in &self.config.tables {
            if self.cancelled(token) {
                return Ok(true);
            }
            if self.reencrypt_table(table, phased_out_version, token).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn cancelled(&self, token: Option<&CancellationToken>) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || token.map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// §4.9 batch loop for one table. Returns `true` if cancellation was
    /// observed before the table fully drained.
    async fn reencrypt_table(&self, table: &RotationTableConfig, phased_out_version: char, token: Option<&CancellationToken>) -> Result<bool> {
        let prefix = phased_out_version.to_string();

        loop {
            if self.cancelled(token) {
                return Ok(true);
            }

            let guard = self.provider.acquire_rotation_lock().await;
            let rows = self
                .store
                .select_encrypted_batch(
                    &table.table,
                    "id",
                    &table.value_column,
                    "updated_at",
                    table.encrypted_flag_column.as_deref(),
                    &prefix,
                    self.config.batch_size,
                )
                .await?;

            if rows.is_empty() {
                break;
            }

            let mut table_cancelled = false;
            for row in &rows {
                if self.cancelled(token) {
                    table_cancelled = true;
                    break;
                }
                if let Err(e) = self.reencrypt_row(&guard, table, row).await {
                    warn!(table = %table.table, row_id = %row.id, error = %e, "failed to re-encrypt row, leaving for a later batch");
                }
            }
            drop(guard);

            if table_cancelled {
                return Ok(true);
            }

            tokio::time::sleep(self.config.batch_sleep()).await;
        }

        Ok(false)
    }

    async fn reencrypt_row(&self, guard: &RotationLockGuard<'_>, table: &RotationTableConfig, row: &EncryptedRow) -> Result<()> {
        let plaintext = guard.decrypt_unlocked(&row.value).await?;
        let ciphertext = guard.encrypt_unlocked(&plaintext).await?;
        let new_updated_at = Utc::now();

        let changed = self
            .store
            .update_encrypted_value(&table.table, "id", &table.value_column, "updated_at", &row.id, &ciphertext, &row.updated_at, new_updated_at)
            .await?;

        if !changed {
            warn!(table = %table.table, row_id = %row.id, "optimistic concurrency conflict, row changed since selection; will retry next batch");
        }
        Ok(())
    }
}

/// Registers `KeyRotationService` as a handler for job type
/// `"key_rotation"`. The worker binary enqueues a cheap check job on
/// `check_interval_secs`; most invocations find nothing due and return
/// immediately.
#[async_trait]
impl JobHandler for KeyRotationService {
    async fn handle(&self, _job: Job, token: CancellationToken) -> std::result::Result<HandlerResult, JobQueueError> {
        let outcome = self
            .run_guarded(Some(&token), false)
            .await
            .map_err(|e| JobQueueError::HandlerFailed(e.to_string()))?;
        Ok(format!("{:?}", outcome).into_bytes())
    }
}

pub const KEY_ROTATION_JOB_TYPE: &str = "key_rotation";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobCounts, JobFilter, JobStatus, NewJob};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    /// In-memory `Store` test double that also models one generic table
    /// with a `value`/`updated_at` pair, for exercising §4.9 without a
    /// live database.
    #[derive(Default)]
    struct FakeRow {
        value: String,
        updated_at: DateTime<Utc>,
    }

    #[derive(Default)]
    struct FakeStore {
        tables: StdMutex<HashMap<String, HashMap<String, FakeRow>>>,
    }

    impl FakeStore {
        fn seed(&self, table: &str, id: &str, value: &str, updated_at: DateTime<Utc>) {
            self.tables.lock().unwrap().entry(table.to_string()).or_default().insert(
                id.to_string(),
                FakeRow {
                    value: value.to_string(),
                    updated_at,
                },
            );
        }

        fn value_of(&self, table: &str, id: &str) -> String {
            self.tables.lock().unwrap().get(table).unwrap().get(id).unwrap().value.clone()
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn insert_job(&self, _new_job: &NewJob, _payload: Option<Vec<u8>>) -> Result<Job> {
            unimplemented!("not exercised by rotation tests")
        }
        async fn has_active_sequential_job(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get_job(&self, _: Uuid) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn get_next_pending_job(&self, _: Option<&str>) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn claim_job(&self, _: Uuid, _: Uuid) -> Result<bool> {
            Ok(false)
        }
        async fn mark_terminal(&self, _: Uuid, _: JobStatus, _: Option<Vec<u8>>, _: Option<String>) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn request_cancellation(&self, _: Uuid, _: Option<String>) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn delete_job(&self, _: Uuid) -> Result<()> {
            Ok(())
        }
        async fn get_orphaned_jobs(&self, _: Uuid) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
        async fn reset_orphaned_job(&self, _: Uuid) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn get_jobs_by_filter(&self, _: &JobFilter) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
        async fn get_job_counts(&self) -> Result<JobCounts> {
            Ok(JobCounts::default())
        }
        async fn select_encrypted_batch(
            &self,
            table: &str,
            _id_column: &str,
            _value_column: &str,
            _updated_at_column: &str,
            _encrypted_flag_column: Option<&str>,
            prefix: &str,
            limit: u32,
        ) -> Result<Vec<EncryptedRow>> {
            let tables = self.tables.lock().unwrap();
            let Some(rows) = tables.get(table) else {
                return Ok(Vec::new());
            };
            Ok(rows
                .iter()
                .filter(|(_, row)| row.value.starts_with(prefix))
                .take(limit as usize)
                .map(|(id, row)| EncryptedRow {
                    id: id.clone(),
                    value: row.value.clone(),
                    updated_at: row.updated_at.to_rfc3339(),
                })
                .collect())
        }

        async fn update_encrypted_value(
            &self,
            table: &str,
            _id_column: &str,
            _value_column: &str,
            _updated_at_column: &str,
            id: &str,
            new_value: &str,
            expected_updated_at: &str,
            new_updated_at: DateTime<Utc>,
        ) -> Result<bool> {
            let mut tables = self.tables.lock().unwrap();
            let Some(row) = tables.get_mut(table).and_then(|t| t.get_mut(id)) else {
                return Ok(false);
            };
            if row.updated_at.to_rfc3339() != expected_updated_at {
                return Ok(false);
            }
            row.value = new_value.to_string();
            row.updated_at = new_updated_at;
            Ok(true)
        }
    }

    fn harness(config: KeyRotationConfig) -> (Arc<KeyRotationService>, Arc<KeyStore>, Arc<FakeStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let key_store = Arc::new(KeyStore::new(dir.path().join("keys.json")));
        let record = key_store.ensure_initialized().unwrap();
        let provider = Arc::new(EncryptionProvider::new(&record).unwrap());
        let store = Arc::new(FakeStore::default());
        let config = KeyRotationConfig {
            tables: vec![RotationTableConfig {
                table: "widgets".to_string(),
                value_column: "value".to_string(),
                encrypted_flag_column: None,
            }],
            ..config
        };
        let service = KeyRotationService::new(key_store.clone(), provider, store.clone(), config);
        (service, key_store, store, dir)
    }

    #[tokio::test]
    async fn test_not_due_returns_without_mutating_keys() {
        let (service, key_store, _store, _dir) = harness(KeyRotationConfig::default());
        let outcome = service.check_and_rotate().await.unwrap();
        assert!(matches!(outcome, RotationOutcome::NotDue { .. }));
        assert!(!key_store.load_keys().unwrap().unwrap().is_rotation_in_progress());
    }

    #[tokio::test]
    async fn test_manual_trigger_rotates_immediately_and_reencrypts() {
        let (service, key_store, store, _dir) = harness(KeyRotationConfig::default());

        let record = key_store.load_keys().unwrap().unwrap();
        let provider = EncryptionProvider::new(&record).unwrap();
        let c1 = provider.encrypt(b"row one").await.unwrap();
        let c2 = provider.encrypt(b"row two").await.unwrap();
        store.seed("widgets", "1", &c1, Utc::now());
        store.seed("widgets", "2", &c2, Utc::now());

        let outcome = service.trigger_manual_rotation().await.unwrap();
        assert_eq!(outcome, RotationOutcome::Completed);

        let final_record = key_store.load_keys().unwrap().unwrap();
        assert!(!final_record.is_rotation_in_progress());
        assert_eq!(final_record.current_version, 'B');

        assert!(store.value_of("widgets", "1").starts_with('B'));
        assert!(store.value_of("widgets", "2").starts_with('B'));
    }

    #[tokio::test]
    async fn test_resumes_in_progress_rotation_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key_store = Arc::new(KeyStore::new(dir.path().join("keys.json")));

        // Start from a freshly-initialized single-key record and encrypt a
        // row under it, so the ciphertext's key material is known.
        let initial = key_store.ensure_initialized().unwrap();
        let provider_before = EncryptionProvider::new(&initial).unwrap();
        let legacy_ciphertext = provider_before.encrypt(b"legacy row").await.unwrap();
        assert!(legacy_ciphertext.starts_with(initial.current_version));

        // Simulate a rotation that started (new current key minted,
        // phased-out key retained as the pre-rotation key) but crashed
        // before any re-encryption ran: the key file is on disk, no rows
        // have been touched yet.
        let interrupted = KeyRecord {
            current_key: key_store.generate_key(),
            current_version: key_store.get_next_version(initial.current_version),
            phased_out_key: Some(initial.current_key.clone()),
            phased_out_version: Some(initial.current_version),
            last_rotation_finished_at: initial.last_rotation_finished_at,
            auxiliary_secrets: initial.auxiliary_secrets.clone(),
        };
        key_store.save_keys(&interrupted).unwrap();
        let provider = Arc::new(EncryptionProvider::new(&interrupted).unwrap());

        let store = Arc::new(FakeStore::default());
        store.seed("widgets", "1", &legacy_ciphertext, Utc::now());

        let config = KeyRotationConfig {
            tables: vec![RotationTableConfig {
                table: "widgets".to_string(),
                value_column: "value".to_string(),
                encrypted_flag_column: None,
            }],
            ..KeyRotationConfig::default()
        };
        let service = KeyRotationService::new(key_store.clone(), provider, store.clone(), config);

        let outcome = service.check_and_rotate().await.unwrap();
        assert_eq!(outcome, RotationOutcome::ResumedAndCompleted);

        let final_record = key_store.load_keys().unwrap().unwrap();
        assert!(!final_record.is_rotation_in_progress());
        assert_eq!(final_record.current_version, interrupted.current_version);
        assert!(store.value_of("widgets", "1").starts_with(interrupted.current_version));
    }

    #[tokio::test]
    async fn test_concurrent_access_is_serialized_in_process() {
        let (service, _key_store, _store, _dir) = harness(KeyRotationConfig::default());
        service.is_rotating.store(true, Ordering::SeqCst);
        let outcome = service.check_and_rotate().await.unwrap();
        assert_eq!(outcome, RotationOutcome::AlreadyRotating);
    }

    #[tokio::test]
    async fn test_update_encrypted_value_rejects_stale_expected_timestamp() {
        let store = FakeStore::default();
        let seeded_at = Utc::now();
        store.seed("widgets", "1", "Acontested", seeded_at);

        // A concurrent writer advances updated_at between our select and
        // our update; our CAS must see the mismatch and refuse.
        {
            let mut tables = store.tables.lock().unwrap();
            tables.get_mut("widgets").unwrap().get_mut("1").unwrap().updated_at = Utc::now() + chrono::Duration::seconds(1);
        }

        let changed = store
            .update_encrypted_value("widgets", "id", "value", "updated_at", "1", "Bfresh", &seeded_at.to_rfc3339(), Utc::now())
            .await
            .unwrap();

        assert!(!changed, "CAS must refuse when expected_updated_at is stale");
        assert_eq!(store.value_of("widgets", "1"), "Acontested");
    }
}
