use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub kafka: Option<KafkaConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub holds: HoldPolicy,
    pub retry: RetryConfig,
    pub collaborators: Option<CollaboratorsConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HoldPolicy {
    #[serde(default = "default_hold_ttl")]
    pub ttl_minutes: i64,
    /// When set, a background task purges expired holds on this interval in
    /// addition to the sweep done by every create.
    pub reaper_interval_seconds: Option<u64>,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            ttl_minutes: default_hold_ttl(),
            reaper_interval_seconds: None,
        }
    }
}

fn default_hold_ttl() -> i64 { slotwise_core::HOLD_TTL_MINUTES }

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Shared secret for signed retry callbacks.
    pub callback_secret: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: i64,
    #[serde(default = "default_retry_topic")]
    pub topic: String,
    #[serde(default = "default_retry_group")]
    pub group_id: String,
}

fn default_max_attempts() -> u32 { slotwise_core::DEFAULT_MAX_RETRY_ATTEMPTS }
fn default_base_backoff() -> i64 { 30 }
fn default_retry_topic() -> String { "sessions.retry".to_string() }
fn default_retry_group() -> String { "slotwise-retry".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct CollaboratorsConfig {
    pub calendar_url: String,
    pub notifications_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 { 3000 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 100 }

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_pool_size() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in.
            .add_source(config::File::with_name("config/local").required(false))
            // SLOTWISE_RETRY__CALLBACK_SECRET=... sets retry.callback_secret
            .add_source(config::Environment::with_prefix("SLOTWISE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let raw = r#"
            [server]
            port = 8080

            [auth]
            jwt_secret = "dev"

            [retry]
            callback_secret = "whsec"
        "#;
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
        assert_eq!(cfg.holds.ttl_minutes, 10);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.topic, "sessions.retry");
        assert_eq!(cfg.server.rate_limit_per_minute, 100);
        assert!(cfg.redis.is_none());
    }
}
