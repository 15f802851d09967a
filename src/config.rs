//! Listener configuration.

use std::time::Duration;

/// Configuration for a [`Listener`](crate::Listener).
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Postgres connection string for the notification connection and the
    /// sideband store (`host=… user=… dbname=…` or a `postgres://` URL).
    pub dsn: String,

    /// Initial delay before a reconnect attempt after connection loss.
    pub min_reconnect_interval: Duration,

    /// Upper bound for the exponential reconnect backoff.
    pub max_reconnect_interval: Duration,

    /// Capacity of each watcher's staging buffer. When a watcher's buffer
    /// fills, that watcher is aborted rather than stalling the delivery
    /// loop, so this bounds both memory per watcher and how far behind a
    /// consumer may fall.
    pub staging_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            min_reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            staging_capacity: 1000,
        }
    }
}

impl ListenerConfig {
    /// Creates a config for the given DSN with default tuning.
    #[must_use]
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = ListenerConfig::new("host=localhost user=postgres");
        assert_eq!(cfg.dsn, "host=localhost user=postgres");
        assert_eq!(cfg.min_reconnect_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_reconnect_interval, Duration::from_secs(30));
        assert_eq!(cfg.staging_capacity, 1000);
    }
}
