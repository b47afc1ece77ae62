//! §4.1 `JobQueueService`: sole owner of the jobs table.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Job, JobCounts, JobFilter, JobId, JobQueueError, JobStatus, NewJob};
use crate::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::keys::EncryptionProvider;
use crate::store::Store;
use crate::{instance, Result};

/// Timestamps and reason describing a job's cancellation.
#[derive(Debug, Clone)]
pub struct CancellationStatus {
    pub cancelled_at: chrono::DateTime<chrono::Utc>,
    pub reason: Option<String>,
}

/// All CRUD/state-transition logic for jobs. Enforces uniqueness, claim
/// atomicity, and orphan detection; publishes job events.
pub struct JobQueueService {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    encryption: Option<Arc<EncryptionProvider>>,
    /// Serializes enqueue/claim/complete/fail/cancel/reset. Reads skip it.
    write_lock: Mutex<()>,
}

impl JobQueueService {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            encryption: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_encryption(mut self, provider: Arc<EncryptionProvider>) -> Self {
        self.encryption = Some(provider);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn encrypt_payload(&self, payload: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let payload = payload?;
        match &self.encryption {
            Some(provider) => match provider.encrypt(&payload).await {
                Ok(ciphertext) => Some(ciphertext.into_bytes()),
                Err(e) => {
                    warn!(error = %e, "failed to encrypt job payload, storing as-is");
                    Some(payload)
                }
            },
            None => Some(payload),
        }
    }

    async fn decrypt_job(&self, mut job: Job) -> Job {
        if let (Some(provider), Some(payload)) = (&self.encryption, job.payload.take()) {
            match std::str::from_utf8(&payload) {
                Ok(ciphertext) => match provider.decrypt(ciphertext).await {
                    Ok(plaintext) => job.payload = Some(plaintext),
                    Err(e) => {
                        warn!(error = %e, job_id = %job.id, "failed to decrypt job payload");
                        job.payload = None;
                    }
                },
                Err(_) => job.payload = Some(payload),
            }
        }
        job
    }

    /// §4.1 enqueue.
    pub async fn enqueue(&self, new_job: NewJob) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;

        if let (Some(rt), Some(rid)) = (&new_job.reference_type, &new_job.reference_id) {
            if new_job.execution_mode == super::ExecutionMode::Sequential {
                let active = self
                    .store
                    .has_active_sequential_job(rt, rid)
                    .await
                    .map_err(|e| JobQueueError::Store(e.to_string()))?;
                if active {
                    return Err(JobQueueError::DuplicateActiveJob {
                        reference_type: rt.clone(),
                        reference_id: rid.clone(),
                    });
                }
            }
        }

        let encrypted = self.encrypt_payload(new_job.payload.clone()).await;
        let job = self
            .store
            .insert_job(&new_job, encrypted)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?;

        info!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        self.events.publish(Event::new(EventKind::JobEnqueued, job.id));
        Ok(job)
    }

    /// Same as `enqueue` but returns `None` on `DuplicateActiveJob` instead
    /// of an error.
    pub async fn enqueue_if_not_exists(
        &self,
        new_job: NewJob,
    ) -> std::result::Result<Option<Job>, JobQueueError> {
        match self.enqueue(new_job).await {
            Ok(job) => Ok(Some(job)),
            Err(JobQueueError::DuplicateActiveJob { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_next_pending_job(&self, type_filter: Option<&str>) -> Result<Option<Job>> {
        let job = self.store.get_next_pending_job(type_filter).await?;
        match job {
            Some(job) => Ok(Some(self.decrypt_job(job).await)),
            None => Ok(None),
        }
    }

    /// §4.1 claimJob. Atomic CAS; this is the only admission gate against
    /// double execution (P2).
    pub async fn claim_job(&self, id: JobId) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;

        let claimed = self
            .store
            .claim_job(id, instance::instance_id())
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?;

        if !claimed {
            return match self.get_job(id).await {
                Ok(Some(_)) => Err(JobQueueError::JobAlreadyClaimed(id)),
                _ => Err(JobQueueError::JobNotFound(id)),
            };
        }

        self.get_job(id)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?
            .ok_or(JobQueueError::JobNotFound(id))
    }

    /// §4.1 completeJob: update → publish → delete.
    pub async fn complete_job(&self, id: JobId, result: Option<Vec<u8>>) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;
        self.finish_job(id, JobStatus::Completed, result, None, EventKind::JobCompleted)
            .await
    }

    pub async fn fail_job(&self, id: JobId, error_detail: Vec<u8>) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;
        self.finish_job(id, JobStatus::Failed, Some(error_detail), None, EventKind::JobFailed)
            .await
    }

    pub async fn mark_job_cancelled(&self, id: JobId, reason: Option<String>) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;
        self.finish_job(id, JobStatus::Cancelled, None, reason, EventKind::JobCancelled)
            .await
    }

    async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        result: Option<Vec<u8>>,
        cancel_reason: Option<String>,
        event_kind: EventKind,
    ) -> std::result::Result<Job, JobQueueError> {
        let job = self
            .store
            .mark_terminal(id, status, result, cancel_reason)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?
            .ok_or(JobQueueError::JobNotFound(id))?;

        self.events.publish(Event::terminal(event_kind, job.clone()));
        self.store
            .delete_job(id)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?;

        debug!(job_id = %id, status = ?status, "job reached terminal state");
        Ok(job)
    }

    /// §4.1 cancelJob.
    pub async fn cancel_job(&self, id: JobId, reason: Option<String>) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;

        let existing = self
            .store
            .get_job(id)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?
            .ok_or(JobQueueError::JobNotFound(id))?;

        self.cancel_existing(existing, reason).await
    }

    /// Per-job cancel semantics shared by `cancel_job` and `cancel_jobs`.
    /// Caller must already hold `write_lock`.
    async fn cancel_existing(&self, existing: Job, reason: Option<String>) -> std::result::Result<Job, JobQueueError> {
        let id = existing.id;
        match existing.status {
            JobStatus::Pending => {
                let job = self
                    .store
                    .mark_terminal(id, JobStatus::Cancelled, None, reason)
                    .await
                    .map_err(|e| JobQueueError::Store(e.to_string()))?
                    .ok_or(JobQueueError::JobNotFound(id))?;
                self.events.publish(Event::terminal(EventKind::JobCancelled, job.clone()));
                self.store
                    .delete_job(id)
                    .await
                    .map_err(|e| JobQueueError::Store(e.to_string()))?;
                Ok(job)
            }
            JobStatus::Running => {
                // Idempotent: if already cancel-requested, the store layer
                // preserves the original reason and returns the existing row.
                let job = self
                    .store
                    .request_cancellation(id, reason.clone())
                    .await
                    .map_err(|e| JobQueueError::Store(e.to_string()))?
                    .unwrap_or(existing);
                self.events
                    .publish(Event::with_reason(EventKind::JobCancellationRequested, id, reason.unwrap_or_default()));
                Ok(job)
            }
            _ => Err(JobQueueError::JobNotFound(id)),
        }
    }

    /// §4.1 cancelJobs: same per-job semantics as `cancel_job`, applied to
    /// every job matching `filter`. Routes each match through
    /// `cancel_existing` so every cancelled job publishes the same event
    /// `cancel_job` would, instead of silently delegating to the store.
    pub async fn cancel_jobs(&self, filter: JobFilter) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let candidates = self.store.get_jobs_by_filter(&filter).await?;
        let mut count = 0;
        for job in candidates {
            if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
                continue;
            }
            if self.cancel_existing(job, None).await.is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn get_cancellation_status(&self, id: JobId) -> Result<Option<CancellationStatus>> {
        let job = self.store.get_job(id).await?;
        Ok(job.and_then(|j| {
            j.cancelled_at.map(|cancelled_at| CancellationStatus {
                cancelled_at,
                reason: j.cancel_reason,
            })
        }))
    }

    /// §4.4: only called at processor startup.
    pub async fn get_orphaned_jobs(&self) -> Result<Vec<Job>> {
        self.store.get_orphaned_jobs(instance::instance_id()).await
    }

    pub async fn reset_orphaned_job(&self, id: JobId) -> std::result::Result<Job, JobQueueError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .reset_orphaned_job(id)
            .await
            .map_err(|e| JobQueueError::Store(e.to_string()))?
            .ok_or(JobQueueError::MaxRetriesExceeded(id))
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let job = self.store.get_job(id).await?;
        match job {
            Some(job) => Ok(Some(self.decrypt_job(job).await)),
            None => Ok(None),
        }
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.store
            .get_jobs_by_filter(&JobFilter {
                status: Some(status),
                ..Default::default()
            })
            .await
    }

    pub async fn get_jobs_by_type(&self, job_type: &str) -> Result<Vec<Job>> {
        self.store
            .get_jobs_by_filter(&JobFilter {
                job_type: Some(job_type.to_string()),
                ..Default::default()
            })
            .await
    }

    pub async fn get_active_job_for_reference(&self, reference_type: &str, reference_id: &str) -> Result<Option<Job>> {
        let jobs = self
            .store
            .get_jobs_by_filter(&JobFilter {
                reference_type: Some(reference_type.to_string()),
                reference_id: Some(reference_id.to_string()),
                ..Default::default()
            })
            .await?;

        Ok(jobs
            .into_iter()
            .find(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running)))
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts> {
        self.store.get_job_counts().await
    }

    pub fn subscribe_to_completion<F>(&self, id: JobId, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let target = id;
        self.events.subscribe(EventKind::JobCompleted, move |event| {
            if event.job_id == target {
                callback(event);
            }
        })
    }

    pub fn subscribe_to_cancellation<F>(&self, id: JobId, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe_to_job_cancellation(id, callback)
    }
}
