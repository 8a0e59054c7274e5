//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default path.
//! Only `[server]` and `[upstream]` are required; `[pool]` and `[publish]`
//! fall back to defaults.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [upstream]
//! base_url = "https://graph.example.com/v19.0"
//! transcoder_url = "http://transcoder:9000"
//!
//! [pool]
//! store_path = "/var/lib/publish-gateway/credentials.json"
//!
//! [publish]
//! deadline_secs = 120
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Platform API and media converter endpoints
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Transcoding service for the format and photo fallbacks. Without it,
    /// format conversion is unavailable and the photo fallback reuses the
    /// original media locator.
    #[serde(default)]
    pub transcoder_url: Option<String>,
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub store_path: PathBuf,
    pub sweep_interval_secs: u64,
    pub refresh_lookahead_secs: u64,
    /// Quarantine applied to a rate-limited credential when the response
    /// carried no `Retry-After`.
    pub default_retry_after_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("credentials.json"),
            sweep_interval_secs: 300,
            refresh_lookahead_secs: 7 * 24 * 3600,
            default_retry_after_secs: 3600,
        }
    }
}

/// Strategy engine settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub deadline_secs: Option<u64>,
    pub accessibility_delays_secs: Vec<u64>,
    pub generic_retry_delay_secs: u64,
    pub fallback_caption_suffix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        let retry = publisher::RetryPolicy::default();
        Self {
            deadline_secs: None,
            accessibility_delays_secs: retry
                .accessibility_delays
                .iter()
                .map(Duration::as_secs)
                .collect(),
            generic_retry_delay_secs: retry.generic_delay.as_secs(),
            fallback_caption_suffix: retry.fallback_caption_suffix,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn validate_http_url(field: &'static str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::invalid(
            field,
            format!("must start with http:// or https://, got: {url}"),
        ));
    }
    Ok(())
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        validate_http_url("upstream.base_url", &self.upstream.base_url)?;
        if let Some(url) = &self.upstream.transcoder_url {
            validate_http_url("upstream.transcoder_url", url)?;
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "upstream.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(common::Error::invalid(
                "pool.sweep_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.pool.store_path.as_os_str().is_empty() {
            return Err(common::Error::invalid("pool.store_path", "must not be empty"));
        }
        if self.publish.deadline_secs == Some(0) {
            return Err(common::Error::invalid(
                "publish.deadline_secs",
                "must be greater than 0 when set",
            ));
        }
        if self.publish.accessibility_delays_secs.is_empty() {
            return Err(common::Error::invalid(
                "publish.accessibility_delays_secs",
                "must list at least one delay",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("publish-gateway.toml")
    }

    pub fn retry_policy(&self) -> publisher::RetryPolicy {
        publisher::RetryPolicy {
            accessibility_delays: self
                .publish
                .accessibility_delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            generic_delay: Duration::from_secs(self.publish.generic_retry_delay_secs),
            fallback_caption_suffix: self.publish.fallback_caption_suffix.clone(),
        }
    }

    pub fn publish_policy(&self) -> publisher::PublishPolicy {
        publisher::PublishPolicy {
            deadline: self.publish.deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn classifier(&self) -> publisher::Classifier {
        publisher::Classifier::new(Duration::from_secs(self.pool.default_retry_after_secs))
    }
}
