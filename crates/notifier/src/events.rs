//! Job lifecycle notifications.
//!
//! Observers registered with `BulkDispatcher::subscribe` are called
//! synchronously, at most once per transition, on the task that performed the
//! transition. They must return quickly and must not block; anything slow
//! should be handed off to a channel or spawned task.

use std::time::Duration;

use beacon_common::types::{Channel, JobStatus};

/// A job lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Job accepted and counted; `total` recipients will be attempted.
    Added {
        job_id: String,
        channel: Channel,
        total: u32,
    },
    /// A processing pass finished: `Completed` or `CompletedWithErrors`.
    Completed {
        job_id: String,
        channel: Channel,
        status: JobStatus,
        sent: u32,
        failed: u32,
    },
    /// A processing pass failed and the job will be re-enqueued after `delay`.
    RetryScheduled {
        job_id: String,
        channel: Channel,
        attempts: u32,
        delay: Duration,
    },
    /// Retries exhausted; the job is terminal.
    Failed {
        job_id: String,
        channel: Channel,
        error: String,
    },
}

/// Receives job lifecycle events.
pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}
