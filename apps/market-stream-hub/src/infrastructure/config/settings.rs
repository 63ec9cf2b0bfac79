//! Hub Configuration Settings
//!
//! Configuration types for the stream hub, loaded from environment variables.
//! Loading goes through a lookup function so tests can supply variables
//! without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Fan-out engine settings.
///
/// The engine receives this object at construction and never reads the
/// environment itself.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Capacity of each session's outbound queue.
    pub queue_capacity: usize,
    /// Capacity of the upstream → engine hand-off channel.
    pub handoff_capacity: usize,
    /// Resubscribe guard period.
    pub guard_interval: Duration,
    /// Heartbeat emission period.
    pub heartbeat_interval: Duration,
    /// Stale session reaper period.
    pub cleanup_interval: Duration,
    /// Idle time after which a session is considered stale.
    pub stale_after: Duration,
    /// Minute bar polling period.
    pub kline_poll_interval: Duration,
    /// Number of minute bars pulled per poll.
    pub kline_poll_limit: usize,
    /// Minute bars kept per instrument by the write-through prune.
    pub kline_retention: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            handoff_capacity: 4096,
            guard_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            kline_poll_interval: Duration::from_secs(30),
            kline_poll_limit: 240,
            kline_retention: 1440,
        }
    }
}

/// Market gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// WebSocket push endpoint.
    pub push_url: String,
    /// REST base URL for subscribe/unsubscribe/kline requests.
    pub rest_url: String,
    /// Timeout applied to every REST request.
    pub request_timeout: Duration,
    /// Ping interval on the push connection.
    pub ping_interval: Duration,
    /// Silence after which the push connection is considered dead.
    pub pong_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            push_url: "ws://127.0.0.1:11112/push".to_string(),
            rest_url: "http://127.0.0.1:11112".to_string(),
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(40),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Minute bar storage settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// SQLite database path; `None` keeps bars in memory.
    pub db_path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("data/minute_kline.db")),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// SSE/HTTP API port.
    pub http_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8000,
            health_port: 8082,
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Fan-out engine settings.
    pub engine: EngineSettings,
    /// Market gateway settings.
    pub gateway: GatewaySettings,
    /// Minute bar storage settings.
    pub storage: StorageSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a capacity or interval is zero, or a URL is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`HubConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource(lookup);
        let engine_defaults = EngineSettings::default();
        let gateway_defaults = GatewaySettings::default();
        let server_defaults = ServerSettings::default();

        let engine = EngineSettings {
            queue_capacity: env.usize("STREAM_QUEUE_CAPACITY", engine_defaults.queue_capacity),
            handoff_capacity: env.usize(
                "STREAM_HANDOFF_CAPACITY",
                engine_defaults.handoff_capacity,
            ),
            guard_interval: env.secs("STREAM_GUARD_INTERVAL_SECS", engine_defaults.guard_interval),
            heartbeat_interval: env.secs(
                "STREAM_HEARTBEAT_INTERVAL_SECS",
                engine_defaults.heartbeat_interval,
            ),
            cleanup_interval: env.secs(
                "STREAM_CLEANUP_INTERVAL_SECS",
                engine_defaults.cleanup_interval,
            ),
            stale_after: env.secs("STREAM_STALE_AFTER_SECS", engine_defaults.stale_after),
            kline_poll_interval: env.secs(
                "STREAM_KLINE_POLL_INTERVAL_SECS",
                engine_defaults.kline_poll_interval,
            ),
            kline_poll_limit: env.usize("STREAM_KLINE_POLL_LIMIT", engine_defaults.kline_poll_limit),
            kline_retention: env.usize("MINUTE_BAR_RETENTION", engine_defaults.kline_retention),
        };

        let gateway = GatewaySettings {
            push_url: env.string("MARKET_GATEWAY_PUSH_URL", &gateway_defaults.push_url),
            rest_url: env.string("MARKET_GATEWAY_REST_URL", &gateway_defaults.rest_url),
            request_timeout: env.secs(
                "MARKET_GATEWAY_TIMEOUT_SECS",
                gateway_defaults.request_timeout,
            ),
            ping_interval: env.secs(
                "MARKET_GATEWAY_PING_INTERVAL_SECS",
                gateway_defaults.ping_interval,
            ),
            pong_timeout: env.secs(
                "MARKET_GATEWAY_PONG_TIMEOUT_SECS",
                gateway_defaults.pong_timeout,
            ),
            reconnect_delay_initial: env.millis(
                "MARKET_GATEWAY_RECONNECT_INITIAL_MS",
                gateway_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "MARKET_GATEWAY_RECONNECT_MAX_SECS",
                gateway_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.f64(
                "MARKET_GATEWAY_RECONNECT_MULTIPLIER",
                gateway_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.u32(
                "MARKET_GATEWAY_MAX_RECONNECT_ATTEMPTS",
                gateway_defaults.max_reconnect_attempts,
            ),
        };

        // An explicitly empty path selects the in-memory store
        let storage = StorageSettings {
            db_path: match env.get("MINUTE_BAR_DB_PATH") {
                Some(path) if path.trim().is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => StorageSettings::default().db_path,
            },
        };

        let server = ServerSettings {
            http_port: env.u16("STREAM_HTTP_PORT", server_defaults.http_port),
            health_port: env.u16("STREAM_HEALTH_PORT", server_defaults.health_port),
        };

        let config = Self {
            engine,
            gateway,
            storage,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        let counts = [
            ("STREAM_QUEUE_CAPACITY", engine.queue_capacity),
            ("STREAM_HANDOFF_CAPACITY", engine.handoff_capacity),
            ("STREAM_KLINE_POLL_LIMIT", engine.kline_poll_limit),
            ("MINUTE_BAR_RETENTION", engine.kline_retention),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let periods = [
            ("STREAM_GUARD_INTERVAL_SECS", engine.guard_interval),
            ("STREAM_HEARTBEAT_INTERVAL_SECS", engine.heartbeat_interval),
            ("STREAM_CLEANUP_INTERVAL_SECS", engine.cleanup_interval),
            ("STREAM_STALE_AFTER_SECS", engine.stale_after),
            ("STREAM_KLINE_POLL_INTERVAL_SECS", engine.kline_poll_interval),
            ("MARKET_GATEWAY_PING_INTERVAL_SECS", self.gateway.ping_interval),
        ];
        for (key, value) in periods {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "interval must be greater than zero".to_string(),
                });
            }
        }

        if self.gateway.push_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_GATEWAY_PUSH_URL".to_string()));
        }
        if self.gateway.rest_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_GATEWAY_REST_URL".to_string()));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds an unusable value.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct EnvSource<F>(F);

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed(key).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<HubConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        HubConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();

        assert_eq!(config.engine.queue_capacity, 200);
        assert_eq!(config.engine.guard_interval, Duration::from_secs(60));
        assert_eq!(config.engine.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.engine.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.engine.stale_after, Duration::from_secs(60));
        assert_eq!(config.engine.kline_poll_interval, Duration::from_secs(30));
        assert_eq!(config.engine.kline_poll_limit, 240);
        assert_eq!(config.engine.kline_retention, 1440);
        assert_eq!(config.server.http_port, 8000);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(
            config.storage.db_path,
            Some(PathBuf::from("data/minute_kline.db"))
        );
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("STREAM_QUEUE_CAPACITY", "50"),
            ("STREAM_STALE_AFTER_SECS", "120"),
            ("MARKET_GATEWAY_RECONNECT_INITIAL_MS", "250"),
            ("MARKET_GATEWAY_PUSH_URL", "ws://gateway:9000/push"),
            ("STREAM_HTTP_PORT", "9001"),
        ])
        .unwrap();

        assert_eq!(config.engine.queue_capacity, 50);
        assert_eq!(config.engine.stale_after, Duration::from_secs(120));
        assert_eq!(
            config.gateway.reconnect_delay_initial,
            Duration::from_millis(250)
        );
        assert_eq!(config.gateway.push_url, "ws://gateway:9000/push");
        assert_eq!(config.server.http_port, 9001);
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let config = load(&[("STREAM_QUEUE_CAPACITY", "lots")]).unwrap();
        assert_eq!(config.engine.queue_capacity, 200);
    }

    #[test]
    fn empty_db_path_selects_memory_store() {
        let config = load(&[("MINUTE_BAR_DB_PATH", "")]).unwrap();
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = load(&[("STREAM_QUEUE_CAPACITY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "STREAM_QUEUE_CAPACITY"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = load(&[("STREAM_HEARTBEAT_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("STREAM_HEARTBEAT_INTERVAL_SECS"));
    }

    #[test]
    fn empty_gateway_url_is_rejected() {
        let err = load(&[("MARKET_GATEWAY_REST_URL", " ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn gateway_settings_defaults() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.reconnect_delay_initial, Duration::from_millis(500));
        assert_eq!(settings.reconnect_delay_max, Duration::from_secs(30));
        assert!((settings.reconnect_delay_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(settings.max_reconnect_attempts, 0);
    }
}
