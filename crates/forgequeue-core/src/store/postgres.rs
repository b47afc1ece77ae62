//! PostgreSQL-backed `Store`, the primary target (§4.10).

use super::{execution_mode_str, status_str, EncryptedRow, Store};
use crate::jobs::{ExecutionMode, Job, JobCounts, JobFilter, JobStatus, NewJob};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

/// PostgreSQL database handle.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Mirrors the host's `create_pool` connection parameters.
    pub async fn connect(connection_string: &str, pool_size: u32) -> Result<Self> {
        tracing::info!("connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(connection_string)
            .await
            .map_err(Error::Database)?;

        tracing::info!("PostgreSQL connected successfully");
        Ok(Self::new(pool))
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id").map_err(Error::Database)?,
        job_type: row.try_get("type").map_err(Error::Database)?,
        status: parse_status(row.try_get("status").map_err(Error::Database)?)?,
        execution_mode: parse_mode(row.try_get("execution_mode").map_err(Error::Database)?)?,
        payload: row.try_get("payload").map_err(Error::Database)?,
        result: row.try_get("result").map_err(Error::Database)?,
        process_instance_id: row.try_get("process_instance_id").map_err(Error::Database)?,
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

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, new_job: &NewJob, payload: Option<Vec<u8>>) -> Result<Job> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, type, status, execution_mode, payload, retry_count,
                               max_retries, priority, reference_type, reference_id, created_at)
            VALUES ($1, $2, 'pending', $3, $4, 0, $5, $6, $7, $8, now())
            RETURNING id, type, status, execution_mode, payload, result, process_instance_id,
                      retry_count, max_retries, priority, reference_type, reference_id,
                      created_at, started_at, completed_at, cancelled_at, cancel_reason
            "#,
        )
        .bind(id)
        .bind(&new_job.job_type)
        .bind(execution_mode_str(new_job.execution_mode))
        .bind(payload)
        .bind(new_job.max_retries)
        .bind(new_job.priority)
        .bind(&new_job.reference_type)
        .bind(&new_job.reference_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        row_to_job(row)
    }

    async fn has_active_sequential_job(&self, reference_type: &str, reference_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE reference_type = $1 AND reference_id = $2
              AND execution_mode = 'sequential'
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(reference_type)
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(count > 0)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"SELECT id, type, status, execution_mode, payload, result, process_instance_id,
                      retry_count, max_retries, priority, reference_type, reference_id,
                      created_at, started_at, completed_at, cancelled_at, cancel_reason
               FROM jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(row_to_job).transpose()
    }

    async fn get_next_pending_job(&self, type_filter: Option<&str>) -> Result<Option<Job>> {
        let row = match type_filter {
            Some(job_type) => sqlx::query(
                r#"SELECT id, type, status, execution_mode, payload, result, process_instance_id,
                          retry_count, max_retries, priority, reference_type, reference_id,
                          created_at, started_at, completed_at, cancelled_at, cancel_reason
                   FROM jobs WHERE status = 'pending' AND type = $1
                   ORDER BY priority DESC, created_at ASC LIMIT 1"#,
            )
            .bind(job_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?,
            None => sqlx::query(
                r#"SELECT id, type, status, execution_mode, payload, result, process_instance_id,
                          retry_count, max_retries, priority, reference_type, reference_id,
                          created_at, started_at, completed_at, cancelled_at, cancel_reason
                   FROM jobs WHERE status = 'pending'
                   ORDER BY priority DESC, created_at ASC LIMIT 1"#,
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?,
        };

        row.map(row_to_job).transpose()
    }

    async fn claim_job(&self, id: Uuid, instance_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'running', process_instance_id = $2, started_at = now()
               WHERE id = $1 AND status = 'pending'"#,
        )
        .bind(id)
        .bind(instance_id)
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
        let row = sqlx::query(
            r#"UPDATE jobs SET status = $2, result = $3, cancel_reason = COALESCE($4, cancel_reason),
                               completed_at = now(), cancelled_at = CASE WHEN $2 = 'cancelled' THEN now() ELSE cancelled_at END
               WHERE id = $1
               RETURNING id, type, status, execution_mode, payload, result, process_instance_id,
                         retry_count, max_retries, priority, reference_type, reference_id,
                         created_at, started_at, completed_at, cancelled_at, cancel_reason"#,
        )
        .bind(id)
        .bind(status_str(status))
        .bind(result)
        .bind(cancel_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(row_to_job).transpose()
    }

    async fn request_cancellation(&self, id: Uuid, reason: Option<String>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"UPDATE jobs SET cancelled_at = COALESCE(cancelled_at, now()),
                               cancel_reason = COALESCE(cancel_reason, $2)
               WHERE id = $1 AND status = 'running'
               RETURNING id, type, status, execution_mode, payload, result, process_instance_id,
                         retry_count, max_retries, priority, reference_type, reference_id,
                         created_at, started_at, completed_at, cancelled_at, cancel_reason"#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(row_to_job).transpose()
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_orphaned_jobs(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"SELECT id, type, status, execution_mode, payload, result, process_instance_id,
                      retry_count, max_retries, priority, reference_type, reference_id,
                      created_at, started_at, completed_at, cancelled_at, cancel_reason
               FROM jobs
               WHERE status = 'running' AND process_instance_id IS NOT NULL AND process_instance_id != $1
               ORDER BY priority DESC, created_at ASC"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn reset_orphaned_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"UPDATE jobs SET status = 'pending', process_instance_id = NULL, started_at = NULL,
                               retry_count = retry_count + 1
               WHERE id = $1 AND retry_count < max_retries
               RETURNING id, type, status, execution_mode, payload, result, process_instance_id,
                         retry_count, max_retries, priority, reference_type, reference_id,
                         created_at, started_at, completed_at, cancelled_at, cancel_reason"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(row_to_job).transpose()
    }

    async fn get_jobs_by_filter(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query = String::from(
            r#"SELECT id, type, status, execution_mode, payload, result, process_instance_id,
                      retry_count, max_retries, priority, reference_type, reference_id,
                      created_at, started_at, completed_at, cancelled_at, cancel_reason
               FROM jobs WHERE 1=1"#,
        );
        let mut binds: Vec<String> = Vec::new();
        let mut idx = 1;

        if let Some(job_type) = &filter.job_type {
            query.push_str(&format!(" AND type = ${}", idx));
            binds.push(job_type.clone());
            idx += 1;
        }
        if let Some(status) = filter.status {
            query.push_str(&format!(" AND status = ${}", idx));
            binds.push(status_str(status).to_string());
            idx += 1;
        }
        if let Some(reference_type) = &filter.reference_type {
            query.push_str(&format!(" AND reference_type = ${}", idx));
            binds.push(reference_type.clone());
            idx += 1;
        }
        if let Some(reference_id) = &filter.reference_id {
            query.push_str(&format!(" AND reference_id = ${}", idx));
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
            "SELECT {id}::text AS id, {value}::text AS value, {updated}::text AS updated_at FROM {table} WHERE {value} LIKE $1",
            id = id_column,
            value = value_column,
            updated = updated_at_column,
            table = table,
        );
        if let Some(flag) = encrypted_flag_column {
            query.push_str(&format!(" AND {} = true", flag));
        }
        query.push_str(" LIMIT $2");

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
                    id: row.try_get("id").map_err(Error::Database)?,
                    value: row.try_get("value").map_err(Error::Database)?,
                    updated_at: row.try_get("updated_at").map_err(Error::Database)?,
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
            "UPDATE {table} SET {value} = $1, {updated} = $2 WHERE {id_col}::text = $3 AND {updated}::text = $4",
            table = table,
            value = value_column,
            updated = updated_at_column,
            id_col = id_column,
        );

        let result = sqlx::query(&query)
            .bind(new_value)
            .bind(new_updated_at)
            .bind(id)
            .bind(expected_updated_at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
