//! SQLite-backed `Store` (§4.10): used by the test suite and single-node
//! deployments, where the process-wide write-mutex in §5 is load-bearing
//! because SQLite serializes writers at the engine level.

use super::{execution_mode_str, status_str, EncryptedRow, Store};
use crate::jobs::{ExecutionMode, Job, JobCounts, JobFilter, JobStatus, NewJob};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn connect(connection_string: &str, pool_size: u32) -> Result<Self> {
        tracing::info!("opening SQLite store");

        let url = if connection_string.starts_with("sqlite:") {
            connection_string.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", connection_string)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect(&url)
            .await
            .map_err(Error::Database)?;

        tracing::info!("SQLite store opened successfully");
        Ok(Self::new(pool))
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id_str: String = row.try_get("id").map_err(Error::Database)?;
    let process_instance_id: Option<String> =
        row.try_get("process_instance_id").map_err(Error::Database)?;

    Ok(Job {
        id: Uuid::from_str(&id_str).map_err(|e| Error::Other(e.to_string()))?,
        job_type: row.try_get("type").map_err(Error::Database)?,
        status: parse_status(row.try_get("status").map_err(Error::Database)?)?,
        execution_mode: parse_mode(row.try_get("execution_mode").map_err(Error::Database)?)?,
        payload: row.try_get("payload").map_err(Error::Database)?,
        result: row.try_get("result").map_err(Error::Database)?,
        process_instance_id: process_instance_id
            .map(|s| Uuid::from_str(&s))
            .transpose()
            .map_err(|e| Error::Other(e.to_string()))?,
        retry_count: row.try_get("retry_count").map_err(Error::Database)?,
        max_retries: row.try_get("max_retries").map_err(Error::Database)?,
        priority: row.try_get("priority").map_err(Error::Database)?,
        reference_type: row.try_get("reference_type").map_err(Error::Database)?,
        reference_id: row.try_get("reference_id").map_err(Error::Database)?,
        created_at: row.try_get("created_at").map_err(Error::Database)?,
        started_at: row.try_get("started_at").map_err(Error::Database)?,
        completed_at: row.try_get("completed_at").map_err(Error::Database)?,
        cancelled_at: row.try_get("cancelled_at").map_err(Error::Database)?,
        cancel_reason: row.try_get("cancel_reason").map_err(Error::Database)?,
    })
}

fn parse_status(s: String) -> Result<JobStatus> {
    match s.as_str() {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(Error::Other(format!("unknown job status in row: {}", other))),
    }
}

fn parse_mode(s: String) -> Result<ExecutionMode> {
    match s.as_str() {
        "sequential" => Ok(ExecutionMode::Sequential),
        "concurrent" => Ok(ExecutionMode::Concurrent),
        other => Err(Error::Other(format!("unknown execution mode in row: {}", other))),
    }
}

const JOB_COLUMNS: &str = "id, type, status, execution_mode, payload, result, process_instance_id, \
    retry_count, max_retries, priority, reference_type, reference_id, \
    created_at, started_at, completed_at, cancelled_at, cancel_reason";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_job(&self, new_job: &NewJob, payload: Option<Vec<u8>>) -> Result<Job> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO jobs (id, type, status, execution_mode, payload, retry_count, \
             max_retries, priority, reference_type, reference_id, created_at) \
             VALUES (?, ?, 'pending', ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new_job.job_type)
        .bind(execution_mode_str(new_job.execution_mode))
        .bind(payload)
        .bind(new_job.max_retries)
        .bind(new_job.priority)
        .bind(&new_job.reference_type)
        .bind(&new_job.reference_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.get_job(id).await?.ok_or_else(|| Error::Other("insert did not produce a row".into()))
    }

    async fn has_active_sequential_job(&self, reference_type: &str, reference_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE reference_type = ? AND reference_id = ? \
             AND execution_mode = 'sequential' AND status IN ('pending', 'running')",
        )
        .bind(reference_type)
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(count > 0)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(row_to_job).transpose()
    }

    async fn get_next_pending_job(&self, type_filter: Option<&str>) -> Result<Option<Job>> {
        let row = match type_filter {
            Some(job_type) => {
                let query = format!(
                    "SELECT {} FROM jobs WHERE status = 'pending' AND type = ? \
                     ORDER BY priority DESC, created_at ASC LIMIT 1",
                    JOB_COLUMNS
                );
                sqlx::query(&query)
                    .bind(job_type)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM jobs WHERE status = 'pending' \
                     ORDER BY priority DESC, created_at ASC LIMIT 1",
                    JOB_COLUMNS
                );
                sqlx::query(&query)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?
            }
        };

        row.map(row_to_job).transpose()
    }

    async fn claim_job(&self, id: Uuid, instance_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', process_instance_id = ?, started_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(instance_id.to_string())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Vec<u8>>,
        cancel_reason: Option<String>,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let is_cancelled = status == JobStatus::Cancelled;

        sqlx::query(
            "UPDATE jobs SET status = ?, result = ?, \
             cancel_reason = COALESCE(?, cancel_reason), \
             completed_at = ?, \
             cancelled_at = CASE WHEN ? THEN ? ELSE cancelled_at END \
             WHERE id = ?",
        )
        .bind(status_str(status))
        .bind(result)
        .bind(cancel_reason)
        .bind(now)
        .bind(is_cancelled)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.get_job(id).await
    }

    async fn request_cancellation(&self, id: Uuid, reason: Option<String>) -> Result<Option<Job>> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET cancelled_at = COALESCE(cancelled_at, ?), \
             cancel_reason = COALESCE(cancel_reason, ?) \
             WHERE id = ? AND status = 'running'",
        )
        .bind(now)
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_orphaned_jobs(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {} FROM jobs WHERE status = 'running' AND process_instance_id IS NOT NULL \
             AND process_instance_id != ? ORDER BY priority DESC, created_at ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(instance_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn reset_orphaned_job(&self, id: Uuid) -> Result<Option<Job>> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', process_instance_id = NULL, started_at = NULL, \
             retry_count = retry_count + 1 WHERE id = ? AND retry_count < max_retries",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    async fn get_jobs_by_filter(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query = format!("SELECT {} FROM jobs WHERE 1=1", JOB_COLUMNS);
        let mut binds: Vec<String> = Vec::new();

        if let Some(job_type) = &filter.job_type {
            query.push_str(" AND type = ?");
            binds.push(job_type.clone());
        }
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            binds.push(status_str(status).to_string());
        }
        if let Some(reference_type) = &filter.reference_type {
            query.push_str(" AND reference_type = ?");
            binds.push(reference_type.clone());
        }
        if let Some(reference_id) = &filter.reference_id {
            query.push_str(" AND reference_id = ?");
            binds.push(reference_id.clone());
        }
        query.push_str(" ORDER BY priority DESC, created_at ASC");

        let mut q = sqlx::query(&query);
        for bind in &binds {
            q = q.bind(bind);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn get_job_counts(&self) -> Result<JobCounts> {
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(JobCounts { pending, running })
    }

    async fn select_encrypted_batch(
        &self,
        table: &str,
        id_column: &str,
        value_column: &str,
        updated_at_column: &str,
        encrypted_flag_column: Option<&str>,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<EncryptedRow>> {
        let mut query = format!(
            "SELECT {id} AS id, {value} AS value, {updated} AS updated_at FROM {table} WHERE {value} LIKE ?",
            id = id_column,
            value = value_column,
            updated = updated_at_column,
            table = table,
        );
        if let Some(flag) = encrypted_flag_column {
            query.push_str(&format!(" AND {} = 1", flag));
        }
        query.push_str(" LIMIT ?");

        let like_pattern = format!("{}%", prefix);
        let rows = sqlx::query(&query)
            .bind(like_pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                Ok(EncryptedRow {
                    id: row.try_get::<String, _>("id").map_err(Error::Database)?,
                    value: row.try_get("value").map_err(Error::Database)?,
                    updated_at: row.try_get::<String, _>("updated_at").map_err(Error::Database)?,
                })
            })
            .collect()
    }

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
    ) -> Result<bool> {
        let query = format!(
            "UPDATE {table} SET {value} = ?, {updated} = ? WHERE {id_col} = ? AND {updated} = ?",
            table = table,
            value = value_column,
            updated = updated_at_column,
            id_col = id_column,
        );

        let result = sqlx::query(&query)
            .bind(new_value)
            .bind(new_updated_at.to_rfc3339())
            .bind(id)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
