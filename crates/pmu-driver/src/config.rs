//! Channel configuration
//!
//! Timeouts and thresholds used by the channel. Defaults match what the
//! firmware handshake expects on real silicon; tests shrink them.

use std::time::Duration;

/// Timing and power-gating parameters for a [`PmuChannel`](crate::PmuChannel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on every power-gating acknowledgement wait
    pub ack_timeout: Duration,

    /// Back-off between `QueueFull` retries while posting
    pub queue_poll_interval: Duration,

    /// Default bound on the enqueue retry loop of a post
    pub command_timeout: Duration,

    /// Bound on one hardware mutex acquisition
    pub mutex_timeout: Duration,

    /// Back-off between mutex acquisition attempts
    pub mutex_poll_interval: Duration,

    /// Debounce before power gating may be re-enabled after a disable
    pub enable_allow_delay: Duration,

    /// Graphics engine idle filter threshold (cycles)
    pub idle_threshold: u32,

    /// Post-power-up idle filter threshold (cycles)
    pub ppu_idle_threshold: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            queue_poll_interval: Duration::from_millis(1),
            command_timeout: Duration::from_secs(2),
            mutex_timeout: Duration::from_millis(100),
            mutex_poll_interval: Duration::from_micros(10),
            enable_allow_delay: Duration::from_millis(500),
            idle_threshold: 15_000,
            ppu_idle_threshold: 1_000_000,
        }
    }
}

impl ChannelConfig {
    /// Set the acknowledgement timeout.
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the post timeout.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the mutex acquisition timeout.
    #[must_use]
    pub const fn with_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.mutex_timeout = timeout;
        self
    }

    /// Set the enable-allow debounce.
    #[must_use]
    pub const fn with_enable_allow_delay(mut self, delay: Duration) -> Self {
        self.enable_allow_delay = delay;
        self
    }

    /// Set both idle filter thresholds.
    #[must_use]
    pub const fn with_idle_thresholds(mut self, idle: u32, ppu_idle: u32) -> Self {
        self.idle_threshold = idle;
        self.ppu_idle_threshold = ppu_idle;
        self
    }

    /// Short timeouts for tests.
    #[cfg(test)]
    pub const fn minimal() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            queue_poll_interval: Duration::from_millis(1),
            command_timeout: Duration::from_millis(50),
            mutex_timeout: Duration::from_millis(5),
            mutex_poll_interval: Duration::from_millis(1),
            enable_allow_delay: Duration::from_millis(20),
            idle_threshold: 15_000,
            ppu_idle_threshold: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware_expectations() {
        let c = ChannelConfig::default();
        assert_eq!(c.ack_timeout, Duration::from_secs(2));
        assert_eq!(c.enable_allow_delay, Duration::from_millis(500));
        assert_eq!(c.idle_threshold, 15_000);
        assert_eq!(c.ppu_idle_threshold, 1_000_000);
    }

    #[test]
    fn builders_override() {
        let c = ChannelConfig::default()
            .with_ack_timeout(Duration::from_millis(7))
            .with_idle_thresholds(1, 2);
        assert_eq!(c.ack_timeout, Duration::from_millis(7));
        assert_eq!((c.idle_threshold, c.ppu_idle_threshold), (1, 2));
    }
}
