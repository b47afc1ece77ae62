//! The persistent `Job` row and its supporting enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// §3.1 status enum. `completed`/`failed`/`cancelled` are never observed
/// via a read after the fact — the row is deleted on reaching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Governs reference-uniqueness admission (§3.1, invariant I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Concurrent,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Concurrent
    }
}

/// A request to create a new job, before server-assigned fields are filled in.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub execution_mode: ExecutionMode,
    pub payload: Option<Vec<u8>>,
    pub priority: i64,
    pub max_retries: i32,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            execution_mode: ExecutionMode::Concurrent,
            payload: None,
            priority: 0,
            max_retries: 3,
            reference_type: None,
            reference_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn sequential_for(mut self, reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        self.execution_mode = ExecutionMode::Sequential;
        self.reference_type = Some(reference_type.into());
        self.reference_id = Some(reference_id.into());
        self
    }
}

/// §3.1 persistent job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub execution_mode: ExecutionMode,
    pub payload: Option<Vec<u8>>,
    pub result: Option<Vec<u8>>,
    pub process_instance_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i64,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Job {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancelled_at.is_some() && self.status == JobStatus::Running
    }
}

/// Read-only aggregate used by `getJobCounts`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
}

/// Filter used by `getJobsByStatus`/`getJobsByType`/`cancelJobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new("send_email");
        assert_eq!(job.execution_mode, ExecutionMode::Concurrent);
        assert_eq!(job.priority, 0);
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn test_sequential_for_sets_mode_and_reference() {
        let job = NewJob::new("provision_tenant").sequential_for("tenant", "42");
        assert_eq!(job.execution_mode, ExecutionMode::Sequential);
        assert_eq!(job.reference_type.as_deref(), Some("tenant"));
        assert_eq!(job.reference_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
