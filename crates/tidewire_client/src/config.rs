//! Configuration for the sync client.

use std::time::Duration;
use tidewire_protocol::WireFormat;

/// How timers are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStrategy {
    /// One periodic sweep fires every expired timer.
    Interval {
        /// Time between sweeps.
        resolution: Duration,
    },
    /// Every timer fires at its own deadline.
    Native,
}

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Liveness check period. The connection is dropped after twice this long without traffic.
    pub heartbeat_interval: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// How long operations are buffered after the connection is lost.
    pub offline_buffer_timeout: Duration,
    /// Batching window for bulk subscriptions. Zero sends immediately.
    pub subscription_interval: Duration,
    /// Default deadline for acknowledgements.
    pub subscription_timeout: Duration,
    /// Deadline for record subscribe acknowledgements.
    pub record_read_ack_timeout: Duration,
    /// Deadline for record read and head responses.
    pub record_read_timeout: Duration,
    /// Grace period between the last reference going away and unsubscribing.
    pub record_discard_timeout: Duration,
    /// Deadline for record deletion.
    pub record_delete_timeout: Duration,
    /// Version given to records first created offline.
    pub initial_record_version: i64,
    /// Records cannot be written unless whitelisted.
    pub record_read_only_mode: bool,
    /// Name prefixes that stay writable in read-only mode.
    pub record_prefix_write_whitelist: Vec<String>,
    /// Use the supplied offline store.
    pub offline_enabled: bool,
    /// Persist every applied change.
    pub save_updates_offline: bool,
    /// Storage key of the dirty index.
    pub dirty_storage_key: String,
    /// Debounce for persisting the dirty index.
    pub dirty_flush_interval: Duration,
    /// Open the transport on login instead of on construction.
    pub lazy_connect: bool,
    /// Timer scheduling strategy.
    pub timer_strategy: TimerStrategy,
    /// Encoding for transports built on the protocol codec.
    pub wire_format: WireFormat,
    /// Path appended to bare host urls.
    pub path: String,
    /// Protocol version announced in the challenge.
    pub protocol_version: String,
    /// SDK version announced in the challenge.
    pub sdk_version: String,
    /// SDK type announced in the challenge.
    pub sdk_type: String,
}

impl ClientConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            offline_buffer_timeout: Duration::from_secs(2),
            subscription_interval: Duration::ZERO,
            subscription_timeout: Duration::from_secs(2),
            record_read_ack_timeout: Duration::from_secs(1),
            record_read_timeout: Duration::from_secs(3),
            record_discard_timeout: Duration::from_secs(5),
            record_delete_timeout: Duration::from_secs(3),
            initial_record_version: 1,
            record_read_only_mode: false,
            record_prefix_write_whitelist: Vec::new(),
            offline_enabled: false,
            save_updates_offline: true,
            dirty_storage_key: "__tidewire_dirty_records".to_string(),
            dirty_flush_interval: Duration::from_secs(1),
            lazy_connect: false,
            timer_strategy: TimerStrategy::Native,
            wire_format: WireFormat::Cbor,
            path: "/tidewire".to_string(),
            protocol_version: "0.1".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            sdk_type: "rust".to_string(),
        }
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the reconnection backoff.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the limbo duration.
    pub fn with_offline_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.offline_buffer_timeout = timeout;
        self
    }

    /// Sets the bulk subscription batching window.
    pub fn with_subscription_interval(mut self, interval: Duration) -> Self {
        self.subscription_interval = interval;
        self
    }

    /// Sets the default acknowledgement deadline.
    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    /// Sets the record read and head deadline.
    pub fn with_record_read_timeout(mut self, timeout: Duration) -> Self {
        self.record_read_timeout = timeout;
        self
    }

    /// Sets the discard grace period.
    pub fn with_record_discard_timeout(mut self, timeout: Duration) -> Self {
        self.record_discard_timeout = timeout;
        self
    }

    /// Sets the deletion deadline.
    pub fn with_record_delete_timeout(mut self, timeout: Duration) -> Self {
        self.record_delete_timeout = timeout;
        self
    }

    /// Sets the version of records first created offline.
    pub fn with_initial_record_version(mut self, version: i64) -> Self {
        self.initial_record_version = version;
        self
    }

    /// Enables read-only mode with a whitelist of writable prefixes.
    pub fn with_read_only_mode(mut self, whitelist: Vec<String>) -> Self {
        self.record_read_only_mode = true;
        self.record_prefix_write_whitelist = whitelist;
        self
    }

    /// Enables or disables offline storage.
    pub fn with_offline_enabled(mut self, enabled: bool) -> Self {
        self.offline_enabled = enabled;
        self
    }

    /// Enables or disables persisting every applied change.
    pub fn with_save_updates_offline(mut self, enabled: bool) -> Self {
        self.save_updates_offline = enabled;
        self
    }

    /// Sets the dirty index debounce.
    pub fn with_dirty_flush_interval(mut self, interval: Duration) -> Self {
        self.dirty_flush_interval = interval;
        self
    }

    /// Defers opening the transport until login.
    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Sets the timer strategy.
    pub fn with_timer_strategy(mut self, strategy: TimerStrategy) -> Self {
        self.timer_strategy = strategy;
        self
    }

    /// Sets the wire format.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Returns true if writes to `name` are refused.
    pub fn is_read_only(&self, name: &str) -> bool {
        self.record_read_only_mode
            && !self
                .record_prefix_write_whitelist
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay added per attempt.
    pub interval_increment: Duration,
    /// Upper bound on the delay.
    pub max_interval: Duration,
    /// Attempts before giving up and closing the client.
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Creates a reconnection configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            interval_increment: Duration::from_secs(4),
            max_interval: Duration::from_secs(180),
            max_attempts,
        }
    }

    /// Sets the delay added per attempt.
    pub fn with_interval_increment(mut self, increment: Duration) -> Self {
        self.interval_increment = increment;
        self
    }

    /// Sets the upper bound on the delay.
    pub fn with_max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.interval_increment
            .saturating_mul(attempt)
            .min(self.max_interval)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new()
            .with_heartbeat_interval(Duration::from_millis(500))
            .with_offline_buffer_timeout(Duration::from_secs(10))
            .with_initial_record_version(3)
            .with_offline_enabled(true)
            .with_lazy_connect(true);

        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.offline_buffer_timeout, Duration::from_secs(10));
        assert_eq!(config.initial_record_version, 3);
        assert!(config.offline_enabled);
        assert!(config.lazy_connect);
    }

    #[test]
    fn reconnect_delay_grows_linearly() {
        let config = ReconnectConfig::new(5).with_interval_increment(Duration::from_millis(100));

        // First attempt has no delay
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn reconnect_delay_respects_max() {
        let config = ReconnectConfig::new(10)
            .with_interval_increment(Duration::from_secs(4))
            .with_max_interval(Duration::from_secs(5));

        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn read_only_respects_whitelist() {
        let config = ClientConfig::new().with_read_only_mode(vec!["drafts/".into()]);
        assert!(config.is_read_only("users/1"));
        assert!(!config.is_read_only("drafts/1"));

        let config = ClientConfig::new();
        assert!(!config.is_read_only("users/1"));
    }
}
