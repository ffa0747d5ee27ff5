//! Job processor: one processing pass over a job's recipients.
//!
//! Steps:
//! 1. Mark the job processing, count the attempt, persist
//! 2. Partition recipients into channel-sized batches
//! 3. Dispatch batches with at most `max_concurrent_batches` in flight
//! 4. Aggregate sent/failed counts and failure details
//! 5. Mark completed (or completed with errors) and persist
//!
//! Every batch of the partition is processed; the concurrency bound only
//! limits how many run at once. Errors returned from `process` are job-level
//! (missing provider, persistence failure) and belong to the retry manager.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;

use beacon_common::types::{BulkJob, Channel, JobResults, JobStatus};

use crate::batch::{BatchContext, BatchOutcome, dispatch_batch};
use crate::channel::ChannelSettings;
use crate::error::NotifierError;
use crate::provider::DeliveryProvider;
use crate::store::JobStore;

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    settings: HashMap<Channel, ChannelSettings>,
    max_concurrent_batches: usize,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
        settings: HashMap<Channel, ChannelSettings>,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            store,
            providers,
            settings,
            max_concurrent_batches: max_concurrent_batches.max(1),
        }
    }

    /// Number of batches a job with `recipients` recipients is split into.
    pub fn batch_count(&self, channel: Channel, recipients: usize) -> usize {
        recipients.div_ceil(self.batch_size(channel))
    }

    fn batch_size(&self, channel: Channel) -> usize {
        self.settings
            .get(&channel)
            .map(|s| s.batch_size)
            .unwrap_or(1)
            .max(1)
    }

    /// Run one processing pass, mutating `job` in place.
    pub async fn process(&self, job: &mut BulkJob) -> Result<(), NotifierError> {
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        job.error = None;
        job.results = JobResults {
            total: job.results.total,
            ..JobResults::default()
        };
        self.store.update_job(job).await?;

        let provider = self.providers.get(&job.channel).cloned().ok_or_else(|| {
            NotifierError::JobProcessing(format!("no delivery provider for {}", job.channel))
        })?;

        let batch_size = self.batch_size(job.channel);
        let batch_count = self.batch_count(job.channel, job.recipients.len());

        tracing::info!(
            job_id = %job.id,
            channel = %job.channel,
            attempt = job.attempts,
            recipients = job.recipients.len(),
            batches = batch_count,
            "Processing bulk job"
        );

        let outcome = {
            let ctx = BatchContext {
                job_id: &job.id,
                channel: job.channel,
                data: &job.data,
                provider: provider.as_ref(),
                store: self.store.as_ref(),
            };

            let batches: Vec<_> = job
                .recipients
                .chunks(batch_size)
                .map(|batch| dispatch_batch(&ctx, batch))
                .collect();

            stream::iter(batches)
                .buffer_unordered(self.max_concurrent_batches)
                .fold(BatchOutcome::default(), |mut acc, outcome| async move {
                    acc.merge(outcome);
                    acc
                })
                .await
        };

        job.results.sent = outcome.sent;
        job.results.failed = outcome.failed;
        job.results.errors = outcome.errors;
        job.status = if job.results.failed == 0 {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        job.completed_at = Some(Utc::now());
        self.store.update_job(job).await?;

        tracing::info!(
            job_id = %job.id,
            channel = %job.channel,
            status = %job.status,
            sent = job.results.sent,
            failed = job.results.failed,
            "Bulk job processed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use beacon_common::types::{JobData, Recipient, RecipientFilters, RecipientType};

    use super::*;
    use crate::provider::OutboundMessage;
    use crate::store::MemoryJobStore;

    /// Tracks the highest number of sends observed in flight at once.
    #[derive(Default)]
    struct SlowProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryProvider for SlowProvider {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), NotifierError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(recipients: usize) -> BulkJob {
        let data = JobData {
            recipient_type: RecipientType::AllStudents,
            filters: RecipientFilters::default(),
            message: "Hi {{first_name}}".to_string(),
            template_variables: Default::default(),
            subject: None,
            is_html: false,
        };
        let recipients = (0..recipients as i64)
            .map(|id| Recipient {
                id,
                first_name: format!("S{}", id),
                last_name: "Test".to_string(),
                email: None,
                phone: Some(format!("+1555{:04}", id)),
                variables: Default::default(),
            })
            .collect();
        BulkJob::new(Channel::Sms, data, recipients)
    }

    fn processor(
        store: Arc<MemoryJobStore>,
        provider: Arc<SlowProvider>,
        batch_size: usize,
        max_concurrent_batches: usize,
    ) -> JobProcessor {
        let providers: HashMap<Channel, Arc<dyn DeliveryProvider>> =
            HashMap::from([(Channel::Sms, provider as Arc<dyn DeliveryProvider>)]);
        let settings = HashMap::from([(
            Channel::Sms,
            ChannelSettings {
                batch_size,
                tick_interval: Duration::from_secs(15),
            },
        )]);
        JobProcessor::new(store, providers, settings, max_concurrent_batches)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_batch_processed_within_concurrency_cap() {
        let store = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(SlowProvider::default());
        let processor = processor(store.clone(), provider.clone(), 1, 2);

        let mut job = job(7);
        store.insert_job(&job).await.unwrap();
        assert_eq!(processor.batch_count(Channel::Sms, 7), 7);

        processor.process(&mut job).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 7);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.sent, 7);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_provider_is_a_job_error() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = JobProcessor::new(store, HashMap::new(), HashMap::new(), 5);

        let mut job = job(1);
        let err = processor.process(&mut job).await.unwrap_err();
        assert!(matches!(err, NotifierError::JobProcessing(_)));
        // The failed pass still counts as an attempt
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_pass_resets_counts() {
        let store = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(SlowProvider::default());
        let processor = processor(store.clone(), provider, 100, 5);

        let mut job = job(3);
        store.insert_job(&job).await.unwrap();
        processor.process(&mut job).await.unwrap();
        processor.process(&mut job).await.unwrap();

        assert_eq!(job.attempts, 2);
        assert_eq!(job.results.total, 3);
        assert_eq!(job.results.sent + job.results.failed, job.results.total);
    }
}
