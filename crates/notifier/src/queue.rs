//! In-memory FIFO of pending jobs for one channel.
//!
//! The queue is the primary dispatch path; the job store only mirrors it.
//! State is ephemeral: jobs still waiting here when the process stops are
//! picked up again by `BulkDispatcher::recover` from their persisted rows.

use std::collections::VecDeque;

use beacon_common::types::BulkJob;

use crate::stats::ChannelStats;

/// Queue, flags and counters of one channel.
#[derive(Debug, Default)]
pub struct ChannelQueue {
    jobs: VecDeque<BulkJob>,
    /// Set while a job popped from this queue is being processed.
    processing: bool,
    /// Set by `pause`; stops new dequeues only.
    paused: bool,
    pub stats: ChannelStats,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail.
    pub fn push(&mut self, job: BulkJob) {
        self.jobs.push_back(job);
    }

    /// Claim the head job if the channel is idle, unpaused and non-empty.
    ///
    /// On success the processing flag is set; the caller must call `finish`
    /// once the processing step returns.
    pub fn try_begin(&mut self) -> Option<BulkJob> {
        if self.paused || self.processing {
            return None;
        }
        let job = self.jobs.pop_front()?;
        self.processing = true;
        Some(job)
    }

    /// Clear the processing flag.
    pub fn finish(&mut self) {
        self.processing = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Remove every job still waiting. The in-flight job is not affected.
    pub fn drain_pending(&mut self) -> Vec<BulkJob> {
        self.jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use beacon_common::types::{Channel, JobData, RecipientFilters, RecipientType};

    use super::*;

    fn job() -> BulkJob {
        let data = JobData {
            recipient_type: RecipientType::AllStudents,
            filters: RecipientFilters::default(),
            message: "Hello".to_string(),
            template_variables: HashMap::new(),
            subject: None,
            is_html: false,
        };
        BulkJob::new(Channel::Sms, data, Vec::new())
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = ChannelQueue::new();
        let first = job();
        let second = job();
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.try_begin().map(|j| j.id), Some(first_id));
        queue.finish();
        assert_eq!(queue.try_begin().map(|j| j.id), Some(second_id));
    }

    #[test]
    fn test_one_job_in_flight() {
        let mut queue = ChannelQueue::new();
        queue.push(job());
        queue.push(job());

        assert!(queue.try_begin().is_some());
        assert!(queue.is_processing());
        // Second claim blocked until the first finishes
        assert!(queue.try_begin().is_none());
        assert_eq!(queue.len(), 1);

        queue.finish();
        assert!(queue.try_begin().is_some());
    }

    #[test]
    fn test_pause_blocks_dequeue() {
        let mut queue = ChannelQueue::new();
        queue.push(job());
        queue.pause();
        assert!(queue.try_begin().is_none());
        assert_eq!(queue.len(), 1);

        queue.resume();
        assert!(queue.try_begin().is_some());
    }

    #[test]
    fn test_drain_leaves_in_flight_alone() {
        let mut queue = ChannelQueue::new();
        queue.push(job());
        queue.push(job());
        queue.push(job());

        let in_flight = queue.try_begin();
        assert!(in_flight.is_some());

        let drained = queue.drain_pending();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.is_processing());
    }
}
