#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.0;

/// Configuration for WebSocket client behavior.
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .connect_timeout(Duration::from_secs(5))
///     .reconnect(ReconnectConfig::builder().max_attempts(10).build())
///     .build();
///
/// assert_eq!(config.reconnect.max_attempts, Some(10));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Maximum time between starting a connection attempt and the socket opening
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    pub connect_timeout: Duration,
    /// Interval for sending heartbeat payloads while the connection is open
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Deliver every inbound frame as [`Payload::Binary`](super::Payload::Binary)
    #[builder(default)]
    pub binary_mode: bool,
    /// Let `send` start a connection when none is open instead of dropping the payload
    #[builder(default)]
    pub auto_connect_on_send: bool,
    /// Emit lifecycle events at `debug` level
    #[builder(default)]
    pub debug_logging: bool,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Delay before each reconnection attempt
    #[builder(default = DEFAULT_RECONNECT_INTERVAL_DURATION)]
    pub interval: Duration,
    /// Maximum number of reconnection attempts between two successful opens.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Maximum time spent reconnecting, measured from the first attempt after the
    /// connection was lost. `None` means no limit.
    pub max_elapsed: Option<Duration>,
    /// Growth factor applied to `interval` after each attempt; `1.0` keeps it fixed
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
    /// Upper bound for the delay when `backoff_multiplier` grows it
    #[builder(default = DEFAULT_MAX_RECONNECT_INTERVAL_DURATION)]
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.interval)
            .with_max_interval(config.max_interval.max(config.interval))
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle the time budget separately
            .build()
    }
}
