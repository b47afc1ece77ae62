//! §6.1 persistence interface and its two sqlx-backed implementations.
//!
//! `Store` is deliberately scoped to the operations the job queue and key
//! rotation engine actually issue (row-level CAS updates, ordered reads,
//! the rotation batch selector) rather than a fully generic SQL executor,
//! mirroring how the host's own `repository` layer exposes domain-shaped
//! methods rather than a bare query interface.

pub mod migrate;
pub mod postgres;
pub mod sqlite;

pub use migrate::{Migration, PgMigrator, SqliteMigrator};
pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use crate::jobs::{ExecutionMode, Job, JobCounts, JobFilter, JobStatus, NewJob};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A batch row candidate for re-encryption (§4.9): primary key, current
/// ciphertext, and the optimistic-concurrency timestamp.
#[derive(Debug, Clone)]
pub struct EncryptedRow {
    pub id: String,
    pub value: String,
    pub updated_at: String,
}

/// Abstract persistence required by §4.1 `JobQueueService` and §4.9's
/// re-encryption batch loop. Implemented once per backend (§4.10).
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, new_job: &NewJob, payload: Option<Vec<u8>>) -> Result<Job>;

    /// True if an active (pending/running) sequential job exists for the
    /// given reference pair. Used by `enqueue`'s admission check.
    async fn has_active_sequential_job(&self, reference_type: &str, reference_id: &str) -> Result<bool>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn get_next_pending_job(&self, type_filter: Option<&str>) -> Result<Option<Job>>;

    /// Atomic CAS: `UPDATE ... SET status='running' WHERE id=? AND status='pending'`.
    /// Returns true iff the row was claimed by this call.
    async fn claim_job(&self, id: Uuid, instance_id: Uuid) -> Result<bool>;

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Vec<u8>>,
        cancel_reason: Option<String>,
    ) -> Result<Option<Job>>;

    /// Sets `cancelledAt`/`cancelReason` on a running job without
    /// otherwise disturbing it. No-op (returns existing job) if already set.
    async fn request_cancellation(&self, id: Uuid, reason: Option<String>) -> Result<Option<Job>>;

    async fn delete_job(&self, id: Uuid) -> Result<()>;

    async fn get_orphaned_jobs(&self, instance_id: Uuid) -> Result<Vec<Job>>;

    /// Atomically resets an orphan to pending and bumps retry_count, but
    /// only if `retry_count < max_retries`. Returns `None` if the budget
    /// is already exhausted (caller fails the job instead).
    async fn reset_orphaned_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn get_jobs_by_filter(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn get_job_counts(&self) -> Result<JobCounts>;

    /// §4.9 batch selector: rows in `table` whose `value_column` begins
    /// with `prefix`, optionally gated by `encrypted_flag_column`.
    async fn select_encrypted_batch(
        &self,
        table: &str,
        id_column: &str,
        value_column: &str,
        updated_at_column: &str,
        encrypted_flag_column: Option<&str>,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<EncryptedRow>>;

    /// §4.9 optimistic update: succeeds only if `updated_at_column` still
    /// matches `expected_updated_at`.
    async fn update_encrypted_value(
        &self,
        table: &str,
        id_column: &str,
        value_column: &str,
        updated_at_column: &str,
        id: &str,
        new_value: &str,
        expected_updated_at: &str,
        new_updated_at: DateTime<Utc>,
    ) -> Result<bool>;
}

pub(crate) fn execution_mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Sequential => "sequential",
        ExecutionMode::Concurrent => "concurrent",
    }
}

pub(crate) fn status_str(status: JobStatus) -> &'static str {
    status.as_str()
}
