//! Per-channel dispatch settings.
//!
//! Email and SMS run through the same scheduler and processor; they differ
//! only in batch size, tick period and the provider that performs the send.

use std::time::Duration;

use beacon_common::config::DispatchConfig;
use beacon_common::types::Channel;

/// Cadence and batching of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Recipients per batch
    pub batch_size: usize,
    /// Scheduler period
    pub tick_interval: Duration,
}

impl ChannelSettings {
    pub fn for_channel(channel: Channel, config: &DispatchConfig) -> Self {
        let (batch_size, tick_ms) = match channel {
            Channel::Email => (config.email_batch_size, config.email_tick_ms),
            Channel::Sms => (config.sms_batch_size, config.sms_tick_ms),
        };
        Self {
            batch_size: batch_size.max(1),
            tick_interval: Duration::from_millis(tick_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channel_settings() {
        let cfg = DispatchConfig::default();

        let email = ChannelSettings::for_channel(Channel::Email, &cfg);
        assert_eq!(email.batch_size, 50);
        assert_eq!(email.tick_interval, Duration::from_secs(30));

        let sms = ChannelSettings::for_channel(Channel::Sms, &cfg);
        assert_eq!(sms.batch_size, 100);
        assert_eq!(sms.tick_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let cfg = DispatchConfig {
            email_batch_size: 0,
            ..DispatchConfig::default()
        };
        assert_eq!(ChannelSettings::for_channel(Channel::Email, &cfg).batch_size, 1);
    }
}
