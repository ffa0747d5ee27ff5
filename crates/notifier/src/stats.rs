use std::collections::BTreeMap;

use serde::Serialize;

use beacon_common::types::Channel;

/// Per-channel delivery counters.
///
/// `total` and `pending` grow when a job is enqueued; `sent`/`failed` grow and
/// `pending` shrinks when the job reaches a terminal outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub pending: u64,
}

impl ChannelStats {
    pub fn record_enqueued(&mut self, recipients: u32) {
        self.total += u64::from(recipients);
        self.pending += u64::from(recipients);
    }

    /// A processing pass finished (with or without per-recipient errors).
    pub fn record_completed(&mut self, sent: u32, failed: u32, total: u32) {
        self.sent += u64::from(sent);
        self.failed += u64::from(failed);
        self.release_pending(total);
    }

    /// Job failed without a completed pass (retries exhausted or cleared from
    /// the queue): every recipient counts as failed.
    pub fn record_exhausted(&mut self, total: u32) {
        self.failed += u64::from(total);
        self.release_pending(total);
    }

    fn release_pending(&mut self, total: u32) {
        self.pending = self.pending.saturating_sub(u64::from(total));
    }
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub stats: ChannelStats,
    pub queue_length: usize,
    pub processing: bool,
    pub paused: bool,
}

/// Snapshot returned by `BulkDispatcher::get_queue_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub channels: BTreeMap<Channel, ChannelSnapshot>,
    /// Jobs waiting out a retry delay, across all channels.
    pub scheduled_retries: usize,
}

impl QueueStats {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelSnapshot> {
        self.channels.get(&channel)
    }

    pub fn email(&self) -> Option<&ChannelSnapshot> {
        self.channel(Channel::Email)
    }

    pub fn sms(&self) -> Option<&ChannelSnapshot> {
        self.channel(Channel::Sms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_then_complete() {
        let mut stats = ChannelStats::default();
        stats.record_enqueued(120);
        assert_eq!(stats.pending, 120);

        stats.record_completed(119, 1, 120);
        assert_eq!(
            stats,
            ChannelStats {
                total: 120,
                sent: 119,
                failed: 1,
                pending: 0,
            }
        );
    }

    #[test]
    fn test_exhausted_counts_all_as_failed() {
        let mut stats = ChannelStats::default();
        stats.record_enqueued(10);
        stats.record_exhausted(10);
        assert_eq!(stats.failed, 10);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total, 10);
    }

    #[test]
    fn test_pending_never_underflows() {
        let mut stats = ChannelStats::default();
        stats.record_enqueued(3);
        stats.record_exhausted(5);
        assert_eq!(stats.pending, 0);
    }
}
