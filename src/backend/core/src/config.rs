//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream commerce API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Catalog fetch/cache configuration
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the commerce REST API (e.g. "https://store.example/wp-json/wc/v3")
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// API consumer key
    #[serde(default)]
    pub consumer_key: String,

    /// API consumer secret
    #[serde(default)]
    pub consumer_secret: String,

    /// Per-call timeout
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum attempts per call (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base unit for the exponential backoff (delay = 2^attempt × base)
    #[serde(default = "default_retry_base", with = "humantime_serde")]
    pub retry_base: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            timeout: default_upstream_timeout(),
            max_attempts: default_max_attempts(),
            retry_base: default_retry_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; empty disables the distributed tier
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for every entry written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// How long a cached product batch is considered fresh
    #[serde(default = "default_fresh_ttl", with = "humantime_serde")]
    pub fresh_ttl: Duration,

    /// Stale-while-revalidate window after `fresh_ttl` expires
    #[serde(default = "default_swr_window", with = "humantime_serde")]
    pub swr_window: Duration,

    /// TTL applied to cached empty result sets so recovery is quick
    #[serde(default = "default_empty_ttl", with = "humantime_serde")]
    pub empty_result_ttl: Duration,

    /// Hard cap on how long a caller waits for an in-flight fetch
    #[serde(default = "default_inflight_wait", with = "humantime_serde")]
    pub inflight_wait: Duration,

    /// Maximum category recursion depth below the requested category
    #[serde(default = "default_category_depth")]
    pub category_depth: u32,

    /// Wall-clock budget for a whole category resolution
    #[serde(default = "default_category_budget", with = "humantime_serde")]
    pub category_budget: Duration,

    /// TTL for the cached category listing endpoint
    #[serde(default = "default_categories_ttl", with = "humantime_serde")]
    pub categories_ttl: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            fresh_ttl: default_fresh_ttl(),
            swr_window: default_swr_window(),
            empty_result_ttl: default_empty_ttl(),
            inflight_wait: default_inflight_wait(),
            category_depth: default_category_depth(),
            category_budget: default_category_budget(),
            categories_ttl: default_categories_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_upstream_url() -> String {
    "http://localhost:8081/wp-json/wc/v3".to_string()
}
fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base() -> Duration {
    Duration::from_secs(1)
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "vitrine:".to_string()
}
fn default_fresh_ttl() -> Duration {
    Duration::from_secs(600)
}
fn default_swr_window() -> Duration {
    Duration::from_secs(1200)
}
fn default_empty_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_inflight_wait() -> Duration {
    Duration::from_secs(3)
}
fn default_category_depth() -> u32 {
    3
}
fn default_category_budget() -> Duration {
    Duration::from_secs(10)
}
fn default_categories_ttl() -> Duration {
    Duration::from_secs(900)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("VITRINE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("VITRINE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_config() {
        let cfg = CatalogConfig::default();
        assert_eq!(cfg.fresh_ttl, Duration::from_secs(600));
        assert_eq!(cfg.swr_window, Duration::from_secs(1200));
        assert_eq!(cfg.category_depth, 3);
        assert_eq!(cfg.inflight_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_default_upstream_config() {
        let cfg = UpstreamConfig::default();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry_base, Duration::from_secs(1));
    }
}
