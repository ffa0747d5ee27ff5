//! Periodic purge of old terminal job rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use beacon_common::error::AppError;

use crate::store::JobStore;

pub struct CleanupSweeper {
    store: Arc<dyn JobStore>,
    retention: chrono::Duration,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(store: Arc<dyn JobStore>, retention: chrono::Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Rows created strictly before this instant are eligible for deletion.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    /// Delete terminal jobs older than the retention window as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let cutoff = self.cutoff(now);
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Purged old bulk jobs");
        }
        Ok(deleted)
    }

    /// Sweep every `interval` until cancelled. Failures are logged and the
    /// loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        tracing::error!(error = %e, "Bulk job cleanup failed");
                    }
                }
            }
        }

        tracing::debug!("Cleanup sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use beacon_common::types::{
        BulkJob, Channel, JobData, JobStatus, RecipientFilters, RecipientType,
    };

    use super::*;
    use crate::store::MemoryJobStore;

    fn job_created_at(status: JobStatus, created_at: DateTime<Utc>) -> BulkJob {
        let data = JobData {
            recipient_type: RecipientType::AllStudents,
            filters: RecipientFilters::default(),
            message: "Term report available".to_string(),
            template_variables: Default::default(),
            subject: None,
            is_html: false,
        };
        let mut job = BulkJob::new(Channel::Email, data, Vec::new());
        job.status = status;
        job.created_at = created_at;
        job
    }

    #[tokio::test]
    async fn test_retention_boundary() {
        let store = Arc::new(MemoryJobStore::new());
        let sweeper = CleanupSweeper::new(
            store.clone(),
            ChronoDuration::days(30),
            Duration::from_secs(3600),
        );
        let now = Utc::now();

        let just_past = job_created_at(
            JobStatus::Completed,
            now - ChronoDuration::days(30) - ChronoDuration::seconds(1),
        );
        let almost = job_created_at(
            JobStatus::Completed,
            now - ChronoDuration::days(29) - ChronoDuration::hours(23),
        );
        let exactly = job_created_at(JobStatus::Failed, now - ChronoDuration::days(30));
        for job in [&just_past, &almost, &exactly] {
            store.insert_job(job).await.unwrap();
        }

        let deleted = sweeper.sweep_at(now).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_job(&just_past.id).await.unwrap().is_none());
        assert!(store.get_job(&almost.id).await.unwrap().is_some());
        assert!(store.get_job(&exactly.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryJobStore::new());
        let sweeper = Arc::new(CleanupSweeper::new(
            store,
            ChronoDuration::days(30),
            Duration::from_secs(3600),
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let sweeper = sweeper.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sweeper.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(7200)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
