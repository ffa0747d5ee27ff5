//! Bulk dispatcher: the service tying queues, scheduler, processor, retries
//! and cleanup together.
//!
//! Lifecycle:
//! 1. `BulkDispatcher::new` wires collaborators; nothing runs yet
//! 2. `recover` re-enqueues jobs left unfinished by a previous run
//! 3. `start` spawns one ticker per channel, the retry driver and the sweeper
//! 4. `shutdown` cancels the background tasks and waits for in-flight jobs
//!
//! Queue and statistics state lives behind one `parking_lot::Mutex`. The lock
//! is only taken in short synchronous sections; jobs are moved out of the
//! queue by value before any `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use beacon_common::config::DispatchConfig;
use beacon_common::types::{BulkJob, Channel, JobData, JobRequest, JobStatus, RecipientType};

use crate::channel::ChannelSettings;
use crate::cleanup::CleanupSweeper;
use crate::error::NotifierError;
use crate::events::{JobEvent, JobObserver};
use crate::processor::JobProcessor;
use crate::provider::DeliveryProvider;
use crate::queue::ChannelQueue;
use crate::resolver::{RecipientResolver, reachable, validate_filters};
use crate::retry::{RetryDecision, RetryPolicy, RetryQueue};
use crate::stats::{ChannelSnapshot, QueueStats};
use crate::store::JobStore;

/// Handle to the dispatch engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BulkDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<Channel, ChannelQueue>>,
    settings: HashMap<Channel, ChannelSettings>,
    processor: JobProcessor,
    resolver: Arc<dyn RecipientResolver>,
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    retries: RetryQueue,
    sweeper: CleanupSweeper,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears a channel's processing flag when dropped, so the flag is released
/// even if the processing future is cancelled mid-flight.
struct InFlight<'a> {
    inner: &'a Inner,
    channel: Channel,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(queue) = self.inner.queues.lock().get_mut(&self.channel) {
            queue.finish();
        }
    }
}

impl BulkDispatcher {
    pub fn new(
        config: &DispatchConfig,
        resolver: Arc<dyn RecipientResolver>,
        store: Arc<dyn JobStore>,
        providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    ) -> Self {
        let settings: HashMap<Channel, ChannelSettings> = Channel::ALL
            .iter()
            .map(|&channel| (channel, ChannelSettings::for_channel(channel, config)))
            .collect();
        let queues = Channel::ALL
            .iter()
            .map(|&channel| (channel, ChannelQueue::new()))
            .collect();

        let processor = JobProcessor::new(
            store.clone(),
            providers,
            settings.clone(),
            config.max_concurrent_batches,
        );
        let sweeper = CleanupSweeper::new(
            store.clone(),
            config.retention(),
            config.cleanup_interval(),
        );

        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(queues),
                settings,
                processor,
                resolver,
                store,
                policy: RetryPolicy::from_config(config),
                retries: RetryQueue::new(),
                sweeper,
                observers: RwLock::new(Vec::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an observer for job lifecycle events.
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Validate, resolve and enqueue a bulk job. Returns the new job id.
    ///
    /// A job whose resolution yields no reachable recipient is stored as
    /// `Completed` with `total = 0` and never enters the queue.
    pub async fn add_bulk_job(
        &self,
        channel: Channel,
        request: JobRequest,
    ) -> Result<String, NotifierError> {
        let recipient_type: RecipientType = request
            .recipient_type
            .parse()
            .map_err(NotifierError::Validation)?;
        validate_filters(recipient_type, &request.filters)?;

        let resolved = self
            .inner
            .resolver
            .resolve(recipient_type, &request.filters, channel)
            .await?;
        let resolved_count = resolved.len();
        let recipients = reachable(resolved, channel);

        let data = JobData {
            recipient_type,
            filters: request.filters,
            message: request.message,
            template_variables: request.template_variables,
            subject: request.subject,
            is_html: request.is_html,
        };
        let mut job = BulkJob::new(channel, data, recipients);
        let job_id = job.id.clone();
        let total = job.results.total;

        if total == 0 {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            self.inner.store.insert_job(&job).await?;

            tracing::info!(
                job_id = %job_id,
                channel = %channel,
                resolved = resolved_count,
                "Bulk job has no reachable recipients, completed immediately"
            );
            self.inner.emit(&JobEvent::Added {
                job_id: job_id.clone(),
                channel,
                total,
            });
            self.inner.emit(&JobEvent::Completed {
                job_id: job_id.clone(),
                channel,
                status: JobStatus::Completed,
                sent: 0,
                failed: 0,
            });
            return Ok(job_id);
        }

        self.inner.store.insert_job(&job).await?;
        self.inner.emit(&JobEvent::Added {
            job_id: job_id.clone(),
            channel,
            total,
        });
        self.inner.enqueue(job);

        tracing::info!(
            job_id = %job_id,
            channel = %channel,
            recipients = total,
            skipped = resolved_count - total as usize,
            "Bulk job queued"
        );

        Ok(job_id)
    }

    /// Current persisted state of a job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<BulkJob>, NotifierError> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        let channels = self
            .inner
            .queues
            .lock()
            .iter()
            .map(|(&channel, queue)| {
                let snapshot = ChannelSnapshot {
                    stats: queue.stats,
                    queue_length: queue.len(),
                    processing: queue.is_processing(),
                    paused: queue.is_paused(),
                };
                (channel, snapshot)
            })
            .collect();

        QueueStats {
            channels,
            scheduled_retries: self.inner.retries.len(),
        }
    }

    /// Stop dequeuing on `channel`. A job already in flight runs to completion.
    pub fn pause_queue(&self, channel: Channel) {
        if let Some(queue) = self.inner.queues.lock().get_mut(&channel) {
            queue.pause();
        }
        tracing::info!(channel = %channel, "Queue paused");
    }

    pub fn resume_queue(&self, channel: Channel) {
        if let Some(queue) = self.inner.queues.lock().get_mut(&channel) {
            queue.resume();
        }
        tracing::info!(channel = %channel, "Queue resumed");
    }

    /// Discard every job still waiting in `channel`'s queue and return how
    /// many were dropped.
    ///
    /// The in-flight job and jobs waiting out a retry delay are untouched.
    /// Discarded jobs are persisted as `Failed` with every recipient counted
    /// as failed, in the job results and in the channel stats.
    pub async fn clear_queue(&self, channel: Channel) -> usize {
        let discarded = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(&channel) {
                Some(queue) => {
                    let jobs = queue.drain_pending();
                    for job in &jobs {
                        queue.stats.record_exhausted(job.results.total);
                    }
                    jobs
                }
                None => Vec::new(),
            }
        };

        let count = discarded.len();
        for mut job in discarded {
            job.mark_failed("Discarded by queue clear");
            if let Err(e) = self.inner.store.update_job(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to persist cleared job");
            }
        }

        tracing::info!(channel = %channel, discarded = count, "Queue cleared");
        count
    }

    /// Advance `channel` by at most one job.
    ///
    /// Returns the id of the job that was processed, or `None` when the
    /// channel was paused, busy or empty. This is the body of the scheduler
    /// tick; it is public so embedders can drive dispatch by hand.
    pub async fn run_tick(&self, channel: Channel) -> Option<String> {
        let job = self.inner.queues.lock().get_mut(&channel)?.try_begin()?;
        let _in_flight = InFlight {
            inner: &self.inner,
            channel,
        };

        let job_id = job.id.clone();
        self.inner.run_job(job).await;
        Some(job_id)
    }

    /// Re-enqueue jobs a previous run left `Pending` or `Processing`.
    ///
    /// Recipients are re-resolved from the persisted targeting data. This is
    /// the one place `results.total` may change after submission: it is reset
    /// to the re-resolved count, with a warning when it differs. A job
    /// interrupted during its final attempt is marked failed instead. Returns
    /// the number of jobs re-enqueued.
    pub async fn recover(&self) -> Result<usize, NotifierError> {
        let unfinished = self.inner.store.load_unfinished().await?;
        if unfinished.is_empty() {
            return Ok(0);
        }

        let mut recovered = 0;
        for mut job in unfinished {
            if job.attempts >= self.inner.policy.max_attempts {
                self.inner
                    .give_up(job, "Interrupted during final attempt".to_string())
                    .await;
                continue;
            }

            let resolved = match self
                .inner
                .resolver
                .resolve(job.data.recipient_type, &job.data.filters, job.channel)
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        error = %e,
                        "Failed to re-resolve recipients, job left for next start"
                    );
                    continue;
                }
            };

            job.recipients = reachable(resolved, job.channel);
            let total = job.recipients.len() as u32;
            if total != job.results.total {
                tracing::warn!(
                    job_id = %job.id,
                    persisted = job.results.total,
                    resolved = total,
                    "Recipient set changed since submission"
                );
            }
            job.results.total = total;
            job.status = JobStatus::Pending;
            if let Err(e) = self.inner.store.update_job(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to persist recovered job");
            }

            self.inner.enqueue(job);
            recovered += 1;
        }

        tracing::info!(recovered, "Recovered unfinished bulk jobs");
        Ok(recovered)
    }

    /// Spawn the channel tickers, the retry driver and the cleanup sweeper.
    ///
    /// A dispatcher that has been shut down cannot be restarted.
    pub fn start(&self) {
        if self.inner.cancel.is_cancelled() {
            tracing::warn!("Bulk dispatcher was shut down, not restarting");
            return;
        }

        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("Bulk dispatcher already started");
            return;
        }

        for channel in Channel::ALL {
            let dispatcher = self.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.tick_loop(channel).await;
            }));
        }

        let dispatcher = self.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.retry_loop().await;
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            inner.sweeper.run(inner.cancel.clone()).await;
        }));

        tracing::info!(tasks = tasks.len(), "Bulk dispatcher started");
    }

    /// Stop background tasks and wait for in-flight jobs to finish.
    ///
    /// Jobs still waiting out a retry delay are dropped from memory; they stay
    /// `Pending` in the store and are picked up by `recover` on next start.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        let abandoned = self.inner.retries.drain();
        if !abandoned.is_empty() {
            let ids: Vec<&str> = abandoned.iter().map(|j| j.id.as_str()).collect();
            tracing::warn!(
                count = abandoned.len(),
                job_ids = ?ids,
                "Pending retries left for recovery"
            );
        }

        tracing::info!("Bulk dispatcher stopped");
    }

    async fn tick_loop(&self, channel: Channel) {
        let period = self.inner.settings[&channel].tick_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_tick(channel).await;
                }
            }
        }

        tracing::debug!(channel = %channel, "Channel ticker stopped");
    }

    async fn retry_loop(&self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                job = self.inner.retries.next_due() => {
                    tracing::info!(
                        job_id = %job.id,
                        channel = %job.channel,
                        attempts = job.attempts,
                        "Re-enqueueing job after retry delay"
                    );
                    if let Some(queue) = self.inner.queues.lock().get_mut(&job.channel) {
                        queue.push(job);
                    }
                }
            }
        }

        tracing::debug!("Retry driver stopped");
    }
}

impl Inner {
    fn emit(&self, event: &JobEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    /// Count `job` in its channel stats and append it to the queue tail.
    fn enqueue(&self, job: BulkJob) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(&job.channel) {
            queue.stats.record_enqueued(job.results.total);
            queue.push(job);
        }
    }

    async fn run_job(&self, mut job: BulkJob) {
        match self.processor.process(&mut job).await {
            Ok(()) => {
                if let Some(queue) = self.queues.lock().get_mut(&job.channel) {
                    queue.stats.record_completed(
                        job.results.sent,
                        job.results.failed,
                        job.results.total,
                    );
                }
                self.emit(&JobEvent::Completed {
                    job_id: job.id.clone(),
                    channel: job.channel,
                    status: job.status,
                    sent: job.results.sent,
                    failed: job.results.failed,
                });
            }
            Err(e) => self.handle_failure(job, e).await,
        }
    }

    async fn handle_failure(&self, mut job: BulkJob, error: NotifierError) {
        match self.policy.decide(job.attempts) {
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    job_id = %job.id,
                    channel = %job.channel,
                    attempts = job.attempts,
                    max_attempts = self.policy.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Bulk job failed, scheduling retry"
                );

                job.status = JobStatus::Pending;
                job.error = Some(error.to_string());
                if let Err(e) = self.store.update_job(&job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to persist retry state");
                }

                self.emit(&JobEvent::RetryScheduled {
                    job_id: job.id.clone(),
                    channel: job.channel,
                    attempts: job.attempts,
                    delay,
                });
                self.retries.schedule(job, delay);
            }
            RetryDecision::GiveUp => {
                if let Some(queue) = self.queues.lock().get_mut(&job.channel) {
                    queue.stats.record_exhausted(job.results.total);
                }
                self.give_up(job, error.to_string()).await;
            }
        }
    }

    /// Mark `job` terminally failed, persist it and notify observers.
    async fn give_up(&self, mut job: BulkJob, error: String) {
        tracing::error!(
            job_id = %job.id,
            channel = %job.channel,
            attempts = job.attempts,
            error = %error,
            "Bulk job failed permanently"
        );

        job.mark_failed(error.clone());
        if let Err(e) = self.store.update_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist failed job");
        }

        self.emit(&JobEvent::Failed {
            job_id: job.id,
            channel: job.channel,
            error,
        });
    }
}
