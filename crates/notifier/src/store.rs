//! Durable mirror of job state.
//!
//! The in-memory queues drive dispatch; the store is written on create and on
//! every status change so that jobs can be polled, audited and recovered.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;

use beacon_common::error::AppError;
use beacon_common::types::{BulkJob, Channel, DeliveryLogEntry, JobStatus};

/// Persistence collaborator for job rows and delivery logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &BulkJob) -> Result<(), AppError>;

    async fn update_job(&self, job: &BulkJob) -> Result<(), AppError>;

    /// Recipients are not persisted; the returned job has none.
    async fn get_job(&self, job_id: &str) -> Result<Option<BulkJob>, AppError>;

    async fn insert_delivery_log(&self, entry: &DeliveryLogEntry) -> Result<(), AppError>;

    /// Delete terminal jobs created strictly before `cutoff`, with their logs.
    /// Returns the number of jobs deleted.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;

    /// Jobs left `pending` or `processing`, oldest first.
    async fn load_unfinished(&self) -> Result<Vec<BulkJob>, AppError>;
}

fn terminal_status_names() -> Vec<String> {
    JobStatus::TERMINAL.iter().map(|s| s.to_string()).collect()
}

/// Row shape of `bulk_jobs`.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    #[sqlx(rename = "type")]
    channel: Channel,
    status: JobStatus,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    attempts: i32,
    results: serde_json::Value,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl TryFrom<JobRow> for BulkJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(BulkJob {
            id: row.id,
            channel: row.channel,
            status: row.status,
            data: serde_json::from_value(row.data)?,
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            recipients: Vec::new(),
            results: serde_json::from_value(row.results)?,
            error: row.error,
        })
    }
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: &BulkJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO bulk_jobs (
                id, type, status, data, recipients_count, created_at,
                attempts, results, started_at, completed_at, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.id)
        .bind(job.channel.to_string())
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&job.data)?)
        .bind(job.results.total as i32)
        .bind(job.created_at)
        .bind(job.attempts as i32)
        .bind(serde_json::to_value(&job.results)?)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_job(&self, job: &BulkJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET status = $2, attempts = $3, results = $4,
                started_at = $5, completed_at = $6, error = $7
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(job.status.to_string())
        .bind(job.attempts as i32)
        .bind(serde_json::to_value(&job.results)?)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BulkJob>, AppError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM bulk_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BulkJob::try_from).transpose()
    }

    async fn insert_delivery_log(&self, entry: &DeliveryLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_delivery_logs
                (job_id, recipient_id, channel, contact, status, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.job_id)
        .bind(entry.recipient_id)
        .bind(entry.channel.to_string())
        .bind(&entry.contact)
        .bind(entry.status.to_string())
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let statuses = terminal_status_names();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM notification_delivery_logs l
            USING bulk_jobs j
            WHERE l.job_id = j.id
              AND j.status = ANY($1)
              AND j.created_at < $2
            "#,
        )
        .bind(&statuses)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted =
            sqlx::query("DELETE FROM bulk_jobs WHERE status = ANY($1) AND created_at < $2")
                .bind(&statuses)
                .bind(cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    async fn load_unfinished(&self) -> Result<Vec<BulkJob>, AppError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM bulk_jobs WHERE status IN ('pending', 'processing') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BulkJob::try_from).collect()
    }
}

/// In-process job store, for embedding without a database and for tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, BulkJob>>,
    logs: Mutex<Vec<DeliveryLogEntry>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all delivery log entries written so far.
    pub fn delivery_logs(&self) -> Vec<DeliveryLogEntry> {
        self.logs.lock().clone()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    fn stored(job: &BulkJob) -> BulkJob {
        BulkJob {
            recipients: Vec::new(),
            ..job.clone()
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &BulkJob) -> Result<(), AppError> {
        self.jobs.lock().insert(job.id.clone(), Self::stored(job));
        Ok(())
    }

    async fn update_job(&self, job: &BulkJob) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get_mut(&job.id) {
            *existing = Self::stored(job);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BulkJob>, AppError> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }

    async fn insert_delivery_log(&self, entry: &DeliveryLogEntry) -> Result<(), AppError> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut jobs = self.jobs.lock();
        let expired: Vec<String> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.created_at < cutoff)
            .map(|j| j.id.clone())
            .collect();

        for id in &expired {
            jobs.remove(id);
        }
        drop(jobs);

        self.logs
            .lock()
            .retain(|entry| !expired.contains(&entry.job_id));

        Ok(expired.len() as u64)
    }

    async fn load_unfinished(&self) -> Result<Vec<BulkJob>, AppError> {
        let mut unfinished: Vec<BulkJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|j| j.created_at);
        Ok(unfinished)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use beacon_common::types::{JobData, Recipient, RecipientFilters, RecipientType};

    use super::*;

    fn job(status: JobStatus, age: Duration) -> BulkJob {
        let data = JobData {
            recipient_type: RecipientType::AllStudents,
            filters: RecipientFilters::default(),
            message: "Reminder".to_string(),
            template_variables: Default::default(),
            subject: Some("Reminder".to_string()),
            is_html: false,
        };
        let recipient = Recipient {
            id: 1,
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: Some("ada@school.test".to_string()),
            phone: None,
            variables: Default::default(),
        };
        let mut job = BulkJob::new(Channel::Email, data, vec![recipient]);
        job.status = status;
        job.created_at = Utc::now() - age;
        job
    }

    #[tokio::test]
    async fn test_memory_store_drops_recipients() {
        let store = MemoryJobStore::new();
        let job = job(JobStatus::Pending, Duration::zero());
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(loaded.recipients.is_empty());
        assert_eq!(loaded.results.total, 1);
    }

    #[tokio::test]
    async fn test_memory_store_load_unfinished() {
        let store = MemoryJobStore::new();
        let older = job(JobStatus::Processing, Duration::minutes(5));
        let newer = job(JobStatus::Pending, Duration::minutes(1));
        let done = job(JobStatus::Completed, Duration::minutes(3));
        for j in [&newer, &done, &older] {
            store.insert_job(j).await.unwrap();
        }

        let ids: Vec<String> = store
            .load_unfinished()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_memory_store_delete_keeps_non_terminal() {
        let store = MemoryJobStore::new();
        let old_pending = job(JobStatus::Pending, Duration::days(40));
        let old_failed = job(JobStatus::Failed, Duration::days(40));
        store.insert_job(&old_pending).await.unwrap();
        store.insert_job(&old_failed).await.unwrap();

        let deleted = store
            .delete_terminal_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_job(&old_pending.id).await.unwrap().is_some());
        assert!(store.get_job(&old_failed.id).await.unwrap().is_none());
    }
}
