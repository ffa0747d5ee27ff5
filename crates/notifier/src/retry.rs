//! Retry/backoff for failed processing passes.
//!
//! A job whose processing pass raised an error is either re-enqueued after a
//! fixed delay or, once its attempts are exhausted, marked failed. Delayed jobs
//! wait in a `RetryQueue`: a time-ordered heap drained by a single driver
//! task, so pending retries can be counted and drained on shutdown
//! instead of living in detached timers.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use beacon_common::config::DispatchConfig;
use beacon_common::types::BulkJob;

/// What to do with a job after a failed processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after the given delay.
    Retry(Duration),
    /// Attempts exhausted; the job becomes terminal.
    GiveUp,
}

/// Fixed-delay, bounded-attempt retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }

    /// `attempts` is the number of processing passes already started.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts < self.max_attempts {
            RetryDecision::Retry(self.delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

struct DelayedJob {
    due: Instant,
    seq: u64,
    job: BulkJob,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Time-ordered queue of jobs waiting to be re-enqueued.
///
/// Jobs with equal due times come out in scheduling order.
#[derive(Default)]
pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Reverse<DelayedJob>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` to become due after `delay`.
    pub fn schedule(&self, job: BulkJob, delay: Duration) {
        let entry = DelayedJob {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            job,
        };
        self.heap.lock().push(Reverse(entry));
        // Wake the driver in case this entry is now the earliest.
        self.notify.notify_one();
    }

    /// Wait until the earliest scheduled job is due and return it.
    ///
    /// Cancel-safe: dropping the future never loses a job.
    pub async fn next_due(&self) -> BulkJob {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut heap = self.heap.lock();
                match heap.peek().map(|Reverse(entry)| entry.due) {
                    Some(due) if due <= Instant::now() => {
                        if let Some(Reverse(entry)) = heap.pop() {
                            return entry.job;
                        }
                        None
                    }
                    other => other,
                }
            };

            match deadline {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove and return every scheduled job, earliest first.
    pub fn drain(&self) -> Vec<BulkJob> {
        let heap = std::mem::take(&mut *self.heap.lock());
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|Reverse(entry)| entry.job)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use beacon_common::types::{Channel, JobData, RecipientFilters, RecipientType};

    use super::*;

    fn job(tag: &str) -> BulkJob {
        let data = JobData {
            recipient_type: RecipientType::AllStudents,
            filters: RecipientFilters::default(),
            message: tag.to_string(),
            template_variables: HashMap::new(),
            subject: None,
            is_html: false,
        };
        let mut job = BulkJob::new(Channel::Email, data, Vec::new());
        job.id = tag.to_string();
        job
    }

    #[test]
    fn test_policy_bounds_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1), RetryDecision::Retry(Duration::from_secs(30)));
        assert_eq!(policy.decide(2), RetryDecision::Retry(Duration::from_secs(30)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_due_waits_for_delay() {
        let queue = RetryQueue::new();
        queue.schedule(job("a"), Duration::from_secs(30));

        let started = Instant::now();
        let due = queue.next_due().await;
        assert_eq!(due.id, "a");
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_schedule_preempts_waiting_driver() {
        let queue = std::sync::Arc::new(RetryQueue::new());
        queue.schedule(job("late"), Duration::from_secs(60));

        let driver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_due().await.id })
        };
        tokio::task::yield_now().await;

        queue.schedule(job("early"), Duration::from_secs(5));
        assert_eq!(driver.await.unwrap(), "early");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_due_times_keep_order() {
        let queue = RetryQueue::new();
        queue.schedule(job("first"), Duration::from_secs(10));
        queue.schedule(job("second"), Duration::from_secs(10));

        assert_eq!(queue.next_due().await.id, "first");
        assert_eq!(queue.next_due().await.id, "second");
    }

    #[test]
    fn test_drain_returns_earliest_first() {
        let queue = RetryQueue::new();
        queue.schedule(job("c"), Duration::from_secs(30));
        queue.schedule(job("a"), Duration::from_secs(10));
        queue.schedule(job("b"), Duration::from_secs(20));

        let drained: Vec<String> = queue.drain().into_iter().map(|j| j.id).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }
}
