use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// WebSocket stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between liveness probes (ping frames)
    pub ping_period_seconds: u64,
    /// Grace period on top of the ping period before a silent peer is dropped
    pub pong_timeout_seconds: u64,
    /// Deadline for a single frame write
    pub write_timeout_seconds: u64,
    /// Regexes matched against the `Origin` header of cross-origin upgrades
    pub allowed_origins: Vec<String>,
    /// Maximum connections per user (0 = unlimited)
    pub max_per_user: usize,
    /// Maximum connections per instance (0 = unlimited)
    pub max_total: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_period_seconds: 45,
            pong_timeout_seconds: 15,
            write_timeout_seconds: 2,
            allowed_origins: Vec::new(),
            max_per_user: 0,
            max_total: 0,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub const fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_seconds)
    }

    #[must_use]
    pub const fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_seconds)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}

/// Redis pub/sub settings for multi-instance fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When false, the instance runs with the no-op broker
    pub enabled: bool,
    pub url: String,
    /// Namespace prepended to the channel so deployments can share one Redis
    pub channel_prefix: String,
    pub channel: String,
    pub timeout_seconds: u64,
    pub reconnect_initial_backoff_seconds: u64,
    pub reconnect_max_backoff_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            channel_prefix: "pushhub:".to_string(),
            channel: "messages".to_string(),
            timeout_seconds: 5,
            reconnect_initial_backoff_seconds: 1,
            reconnect_max_backoff_seconds: 30,
        }
    }
}

impl RedisConfig {
    /// Fully qualified channel name
    #[must_use]
    pub fn channel_name(&self) -> String {
        format!("{}{}", self.channel_prefix, self.channel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Static client credentials
///
/// Stand-in for the external client store: each entry maps a client token
/// to the user it authenticates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub clients: Vec<ClientCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredential {
    pub token: String,
    pub user_id: u64,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PUSHHUB_STREAM__PING_PERIOD_SECONDS, PUSHHUB_REDIS__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("PUSHHUB")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("stream.allowed_origins")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values that would break the server at runtime.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stream.ping_period_seconds == 0 {
            errors.push("stream.ping_period_seconds must be greater than 0".to_string());
        }
        if self.stream.pong_timeout_seconds == 0 {
            errors.push("stream.pong_timeout_seconds must be greater than 0".to_string());
        }
        if self.stream.write_timeout_seconds == 0 {
            errors.push("stream.write_timeout_seconds must be greater than 0".to_string());
        }
        for pattern in &self.stream.allowed_origins {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("stream.allowed_origins: invalid pattern '{pattern}': {e}"));
            }
        }

        if self.redis.enabled {
            if self.redis.url.is_empty() {
                errors.push("redis.url must be set when redis.enabled is true".to_string());
            }
            if self.redis.channel.is_empty() {
                errors.push("redis.channel must not be empty".to_string());
            }
            if self.redis.timeout_seconds == 0 {
                errors.push("redis.timeout_seconds must be greater than 0".to_string());
            }
            if self.redis.reconnect_initial_backoff_seconds == 0
                || self.redis.reconnect_max_backoff_seconds
                    < self.redis.reconnect_initial_backoff_seconds
            {
                errors.push(
                    "redis reconnect backoff must satisfy 0 < initial <= max".to_string(),
                );
            }
        }

        if self.logging.format.parse::<crate::logging::LogFormat>().is_err() {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err()
            && tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err()
        {
            errors.push(format!("logging.level '{}' is invalid", self.logging.level));
        }

        for client in &self.auth.clients {
            if client.token.is_empty() {
                errors.push(format!(
                    "auth.clients: empty token for user {}",
                    client.user_id
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert!(!config.redis.enabled);
        assert_eq!(config.stream.ping_period(), Duration::from_secs(45));
        assert_eq!(config.stream.pong_timeout(), Duration::from_secs(15));
        assert_eq!(config.stream.write_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 9090,
            },
            ..Default::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:9090");
    }

    #[test]
    fn test_channel_name_uses_prefix() {
        let redis = RedisConfig {
            channel_prefix: "tenant-a:".to_string(),
            ..Default::default()
        };
        assert_eq!(redis.channel_name(), "tenant-a:messages");

        let unprefixed = RedisConfig {
            channel_prefix: String::new(),
            ..Default::default()
        };
        assert_eq!(unprefixed.channel_name(), "messages");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.stream.ping_period_seconds = 0;
        config.stream.allowed_origins = vec!["([".to_string()];
        config.redis.enabled = true;
        config.redis.url = String::new();
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("ping_period")));
        assert!(errors.iter().any(|e| e.contains("allowed_origins")));
        assert!(errors.iter().any(|e| e.contains("redis.url")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_disabled_redis_is_not_validated() {
        let mut config = Config::default();
        config.redis.url = String::new();
        assert!(config.validate().is_ok());
    }
}
