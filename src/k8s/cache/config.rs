/**
 * Configuration constants for watch caches, the coalescer and the broker
 */
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Initial backoff between list-watch restarts in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff between list-watch restarts in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Failed re-lists after a resource version expiry tolerated before the entry reports Broken
pub const MAX_QUIET_RELIST_FAILURES: u32 = 3;

/// Capacity of the worker → coalescer change notice queue
pub const CHANGE_QUEUE_CAPACITY: usize = 64;

/// Capacity of the broker's released-topic feed; a lagging reader re-scans
pub const RELEASE_QUEUE_CAPACITY: usize = 256;

/// Frames buffered per subscriber before the oldest are dropped
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// Overflow episodes without catching up before a subscriber is disconnected
pub const DEFAULT_MAX_LAG_EVENTS: u32 = 8;

/// Default budget for callers waiting on a cache to sync
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

/// Flush period for kinds without an explicit policy
pub const DEFAULT_FLUSH_PERIOD_MS: u64 = 1_000;

/// Flush period for high-churn kinds (events, heartbeats)
pub const HIGH_CHURN_FLUSH_PERIOD_MS: u64 = 250;

/// Flush period for pods, which churn heavily during rollouts
pub const POD_FLUSH_PERIOD_MS: u64 = 500;

/// Runtime configuration shared by every cache and stream
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Budget for `list` calls waiting on a cache to sync
    pub sync_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub subscriber_buffer: usize,
    pub max_lag_events: u32,
    pub default_flush_period: Duration,
    /// Per-kind flush periods; zero means flush on every change
    pub flush_periods: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut flush_periods = HashMap::new();
        flush_periods.insert(
            "Event".to_string(),
            Duration::from_millis(HIGH_CHURN_FLUSH_PERIOD_MS),
        );
        flush_periods.insert(
            "Lease".to_string(),
            Duration::from_millis(HIGH_CHURN_FLUSH_PERIOD_MS),
        );
        flush_periods.insert("Pod".to_string(), Duration::from_millis(POD_FLUSH_PERIOD_MS));
        flush_periods.insert("Namespace".to_string(), Duration::ZERO);

        Self {
            sync_timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            max_lag_events: DEFAULT_MAX_LAG_EVENTS,
            default_flush_period: Duration::from_millis(DEFAULT_FLUSH_PERIOD_MS),
            flush_periods,
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `KUBECAST_SYNC_TIMEOUT_SECS`,
    /// `KUBECAST_SUBSCRIBER_BUFFER` and `KUBECAST_MAX_LAG_EVENTS`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_number::<u64>("KUBECAST_SYNC_TIMEOUT_SECS") {
            config.sync_timeout = Duration::from_secs(secs);
        }
        if let Some(buffer) = env_number::<usize>("KUBECAST_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = buffer.max(1);
        }
        if let Some(lags) = env_number::<u32>("KUBECAST_MAX_LAG_EVENTS") {
            config.max_lag_events = lags;
        }
        config
    }

    #[must_use]
    pub fn flush_period(&self, kind: &str) -> Duration {
        self.flush_periods
            .get(kind)
            .copied()
            .unwrap_or(self.default_flush_period)
    }

    #[must_use]
    pub fn with_flush_period(mut self, kind: &str, period: Duration) -> Self {
        self.flush_periods.insert(kind.to_string(), period);
        self
    }

    #[must_use]
    pub const fn with_default_flush_period(mut self, period: Duration) -> Self {
        self.default_flush_period = period;
        self
    }

    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }

    #[must_use]
    pub const fn with_max_lag_events(mut self, lags: u32) -> Self {
        self.max_lag_events = lags;
        self
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", name, value);
            None
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_MS > 0, "INITIAL_BACKOFF_MS must be greater than 0");
    assert!(MAX_BACKOFF_MS >= INITIAL_BACKOFF_MS, "MAX_BACKOFF_MS must not be below INITIAL_BACKOFF_MS");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(CHANGE_QUEUE_CAPACITY > 0, "CHANGE_QUEUE_CAPACITY must be greater than 0");
    assert!(RELEASE_QUEUE_CAPACITY > 0, "RELEASE_QUEUE_CAPACITY must be greater than 0");
    assert!(DEFAULT_SUBSCRIBER_BUFFER > 0, "DEFAULT_SUBSCRIBER_BUFFER must be greater than 0");
    assert!(DEFAULT_SYNC_TIMEOUT_SECS > 0, "DEFAULT_SYNC_TIMEOUT_SECS must be greater than 0");
};
