//! §4.3 `JobProcessorService`: the long-running dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cancellation::CancellationToken;
use super::{Job, JobHandler, JobId, JobQueueError, JobStatus};
use crate::config::JobProcessorConfig;
use crate::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::jobs::queue::JobQueueService;

/// Drives jobs to terminal states, one at a time per instance.
pub struct JobProcessorService {
    queue: Arc<JobQueueService>,
    events: Arc<EventBus>,
    config: JobProcessorConfig,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    tokens: Arc<DashMap<JobId, CancellationToken>>,
    wakeup: Arc<Notify>,
    started: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    consecutive_failures: AtomicU32,
    subscriptions: Mutex<Vec<(EventKind, SubscriptionId)>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobProcessorService {
    pub fn new(queue: Arc<JobQueueService>, events: Arc<EventBus>, config: JobProcessorConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            events,
            config,
            handlers: DashMap::new(),
            tokens: Arc::new(DashMap::new()),
            wakeup: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            consecutive_failures: AtomicU32::new(0),
            subscriptions: Mutex::new(Vec::new()),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn unregister_handler(&self, job_type: &str) {
        self.handlers.remove(job_type);
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Exactly-once until `stop`. A second call while already started is a
    /// logged no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("processor start() called while already running, ignoring");
            return;
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.run_orphan_recovery().await;

        {
            let mut subs = self.subscriptions.lock().await;
            let wakeup = self.wakeup.clone();
            let id1 = self.events.subscribe(EventKind::JobEnqueued, move |_| {
                wakeup.notify_one();
            });
            let wakeup = self.wakeup.clone();
            let id2 = self.events.subscribe(EventKind::JobCompleted, move |_| {
                wakeup.notify_one();
            });
            subs.push((EventKind::JobEnqueued, id1));
            subs.push((EventKind::JobCompleted, id2));
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.process_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);

        info!("job processor started");
    }

    async fn process_loop(self: Arc<Self>) {
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            loop {
                if self.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match self.queue.get_next_pending_job(None).await {
                    Ok(Some(job)) => {
                        self.process_job(job).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "failed to poll for next pending job");
                        break;
                    }
                }
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.polling_interval()) => {}
            }
        }

        debug!("job processor loop exited");
    }

    /// §4.3 processJob. Returns the job's terminal status, or `None` if it
    /// never reached one (handler not found, claim lost to another
    /// processor, or a store error on the way in).
    async fn process_job(self: &Arc<Self>, job: Job) -> Option<JobStatus> {
        let handler = match self.handlers.get(&job.job_type).map(|h| h.clone()) {
            Some(h) => h,
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                let terminal = self
                    .queue
                    .fail_job(job.id, format!("no handler registered for type '{}'", job.job_type).into_bytes())
                    .await
                    .ok();
                self.record_outcome(false);
                return terminal.map(|j| j.status);
            }
        };

        match self.queue.get_cancellation_status(job.id).await {
            Ok(Some(status)) => {
                return self
                    .queue
                    .mark_job_cancelled(job.id, status.reason)
                    .await
                    .ok()
                    .map(|j| j.status);
            }
            Ok(None) => {}
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to check cancellation status");
            }
        }

        let claimed = match self.queue.claim_job(job.id).await {
            Ok(job) => job,
            Err(JobQueueError::JobAlreadyClaimed(id)) => {
                debug!(job_id = %id, "lost claim race to another processor");
                return None;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to claim job");
                return None;
            }
        };

        let token = CancellationToken::new();
        self.tokens.insert(claimed.id, token.clone());

        let token_for_sub = token.clone();
        let sub_id = self
            .events
            .subscribe_to_job_cancellation(claimed.id, move |event: &Event| {
                token_for_sub.cancel(event.reason.clone());
            });

        let outcome = handler.handle(claimed.clone(), token.clone()).await;

        let terminal = match outcome {
            Ok(result) => {
                if token.is_cancelled() {
                    let terminal = self.queue.mark_job_cancelled(claimed.id, token.reason()).await.ok();
                    self.record_outcome(true);
                    terminal
                } else {
                    let terminal = self.queue.complete_job(claimed.id, Some(result)).await.ok();
                    self.record_outcome(true);
                    terminal
                }
            }
            Err(JobQueueError::JobCancellationSignal(sig)) => {
                let terminal = self.queue.mark_job_cancelled(claimed.id, sig.reason).await.ok();
                self.record_outcome(true);
                terminal
            }
            Err(e) => {
                error!(job_id = %claimed.id, error = %e, "job handler failed");
                let terminal = self.queue.fail_job(claimed.id, e.to_string().into_bytes()).await.ok();
                self.record_outcome(false);
                terminal
            }
        };

        self.events.unsubscribe(EventKind::JobCancellationRequested, sub_id);
        self.tokens.remove(&claimed.id);
        terminal.map(|j| j.status)
    }

    /// Consecutive-failure guard: trips an auto-stop after `max_consecutive_failures`.
    fn record_outcome(self: &Arc<Self>, succeeded: bool) {
        if succeeded {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.max_consecutive_failures {
            error!(
                failures,
                "consecutive processing failures exceeded threshold, stopping processor; \
                 if a rotation was in progress it will resume automatically on next start"
            );
            self.stop_requested.store(true, Ordering::SeqCst);
            self.wakeup.notify_one();
        }
    }

    /// §4.4: at-most-once-per-start; not retried during steady-state operation.
    async fn run_orphan_recovery(&self) {
        let orphans = match self.queue.get_orphaned_jobs().await {
            Ok(orphans) => orphans,
            Err(e) => {
                error!(error = %e, "failed to list orphaned jobs");
                return;
            }
        };

        for job in orphans {
            match self.queue.reset_orphaned_job(job.id).await {
                Ok(reset) => info!(job_id = %reset.id, retry_count = reset.retry_count, "orphan reset to pending"),
                Err(JobQueueError::MaxRetriesExceeded(id)) => {
                    warn!(job_id = %id, "orphan exceeded retry budget, failing");
                    let _ = self
                        .queue
                        .fail_job(id, b"orphaned job exceeded max retries on recovery".to_vec())
                        .await;
                }
                Err(e) => error!(job_id = %job.id, error = %e, "failed to reset orphaned job"),
            }
        }
    }

    /// Marks stopRequested, cancels wakeups, unsubscribes event handlers,
    /// waits up to `shutdownTimeoutMs` for an in-flight handler to return.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();

        {
            let mut subs = self.subscriptions.lock().await;
            for (kind, id) in subs.drain(..) {
                self.events.unsubscribe(kind, id);
            }
        }

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(_) => info!("job processor stopped"),
                Err(_) => warn!("job processor shutdown timed out, abandoning in-flight handler"),
            }
        }

        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst)
    }

    /// Synchronous single-step: pull one job, process it, return its
    /// terminal status. `None` if the queue was empty.
    pub async fn process_one(self: &Arc<Self>) -> Option<JobStatus> {
        let job = self.queue.get_next_pending_job(None).await.ok().flatten()?;
        self.process_job(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::jobs::{JobQueueError as QErr, NewJob};
    use crate::store::{EncryptedRow, Store};
    use crate::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeStore {
        jobs: StdMutex<HashMap<Uuid, Job>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn insert_job(&self, new_job: &NewJob, payload: Option<Vec<u8>>) -> Result<Job> {
            let job = Job {
                id: Uuid::new_v4(),
                job_type: new_job.job_type.clone(),
                status: JobStatus::Pending,
                execution_mode: new_job.execution_mode,
                payload,
                result: None,
                process_instance_id: None,
                retry_count: 0,
                max_retries: new_job.max_retries,
                priority: new_job.priority,
                reference_type: new_job.reference_type.clone(),
                reference_id: new_job.reference_id.clone(),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                cancelled_at: None,
                cancel_reason: None,
            };
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(job)
        }
        async fn has_active_sequential_job(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn get_next_pending_job(&self, _: Option<&str>) -> Result<Option<Job>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .find(|j| j.status == JobStatus::Pending)
                .cloned())
        }
        async fn claim_job(&self, id: Uuid, instance_id: Uuid) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&id) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Running;
                    job.process_instance_id = Some(instance_id);
                    job.started_at = Some(Utc::now());
                    return Ok(true);
                }
            }
            Ok(false)
        }
        async fn mark_terminal(
            &self,
            id: Uuid,
            status: JobStatus,
            result: Option<Vec<u8>>,
            cancel_reason: Option<String>,
        ) -> Result<Option<Job>> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&id) {
                job.status = status;
                job.result = result;
                if cancel_reason.is_some() {
                    job.cancel_reason = cancel_reason;
                }
                job.completed_at = Some(Utc::now());
                return Ok(Some(job.clone()));
            }
            Ok(None)
        }
        async fn request_cancellation(&self, _: Uuid, _: Option<String>) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn delete_job(&self, id: Uuid) -> Result<()> {
            self.jobs.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn get_orphaned_jobs(&self, _: Uuid) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
        async fn reset_orphaned_job(&self, _: Uuid) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn get_jobs_by_filter(&self, _: &crate::jobs::JobFilter) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
        async fn get_job_counts(&self) -> Result<crate::jobs::JobCounts> {
            Ok(Default::default())
        }
        async fn select_encrypted_batch(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: u32,
        ) -> Result<Vec<EncryptedRow>> {
            Ok(Vec::new())
        }
        async fn update_encrypted_value(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: chrono::DateTime<Utc>,
        ) -> Result<bool> {
            Ok(true)
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl JobHandler for AlwaysSucceeds {
        async fn handle(&self, _job: Job, _token: CancellationToken) -> std::result::Result<Vec<u8>, QErr> {
            Ok(b"ok".to_vec())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: Job, _token: CancellationToken) -> std::result::Result<Vec<u8>, QErr> {
            Err(QErr::NoHandler("boom".to_string()))
        }
    }

    fn harness() -> (Arc<JobProcessorService>, Arc<JobQueueService>) {
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(JobQueueService::new(Arc::new(FakeStore::default()), events.clone()));
        let processor = JobProcessorService::new(queue.clone(), events, JobProcessorConfig::default());
        (processor, queue)
    }

    #[tokio::test]
    async fn test_no_handler_fails_job() {
        let (processor, queue) = harness();
        let job = queue.enqueue(NewJob::new("unregistered")).await.unwrap();
        let status = processor.process_one().await;
        assert_eq!(status, Some(JobStatus::Failed));
        assert!(queue.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registered_handler_completes_job() {
        let (processor, queue) = harness();
        processor.register_handler("send", Arc::new(AlwaysSucceeds));
        let job = queue.enqueue(NewJob::new("send")).await.unwrap();
        let status = processor.process_one().await;
        assert_eq!(status, Some(JobStatus::Completed));
        assert!(queue.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_one_returns_none_when_queue_empty() {
        let (processor, _queue) = harness();
        assert_eq!(processor.process_one().await, None);
    }

    #[tokio::test]
    async fn test_consecutive_failure_guard_trips() {
        let (processor, queue) = harness();
        processor.register_handler("doomed", Arc::new(AlwaysFails));

        let mut config = JobProcessorConfig::default();
        config.max_consecutive_failures = 2;
        let processor = JobProcessorService::new(queue.clone(), processor.events.clone(), config);
        processor.register_handler("doomed", Arc::new(AlwaysFails));

        queue.enqueue(NewJob::new("doomed")).await.unwrap();
        processor.process_one().await;
        queue.enqueue(NewJob::new("doomed")).await.unwrap();
        processor.process_one().await;

        assert_eq!(processor.consecutive_failures.load(Ordering::SeqCst), 2);
        assert!(processor.stop_requested.load(Ordering::SeqCst));
    }
}
