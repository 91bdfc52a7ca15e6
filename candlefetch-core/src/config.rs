//! Configuration: broker credentials and fetch tuning, loaded from TOML.
//!
//! ```toml
//! [broker]
//! environment = "practice"
//! token = "..."
//! account_id = "1234567"
//!
//! [fetch]
//! per_request_limit = 5000
//! feed = "bid_ask"
//! read_buffer_size = 16384
//! max_concurrent_streams = 8
//! ```
//!
//! Every `[fetch]` key is optional.

use crate::data::planner::DEFAULT_PER_REQUEST_LIMIT;
use crate::domain::FeedVariant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Broker environment; selects the REST and streaming hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Live,
    #[default]
    Practice,
    Sandbox,
}

impl Environment {
    pub fn api_base(self) -> &'static str {
        match self {
            Environment::Live => "https://api-fxtrade.oanda.com",
            Environment::Practice => "https://api-fxpractice.oanda.com",
            Environment::Sandbox => "http://api-sandbox.oanda.com",
        }
    }

    pub fn stream_base(self) -> &'static str {
        match self {
            Environment::Live => "https://stream-fxtrade.oanda.com",
            Environment::Practice => "https://stream-fxpractice.oanda.com",
            Environment::Sandbox => "http://stream-sandbox.oanda.com",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Live => f.write_str("live"),
            Environment::Practice => f.write_str("practice"),
            Environment::Sandbox => f.write_str("sandbox"),
        }
    }
}

/// Resolved broker settings. The token is opaque to this crate.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: String,
    /// Sandbox only.
    #[serde(default)]
    pub username: Option<String>,
    /// Overrides the environment's REST host (tests, proxies).
    #[serde(default)]
    pub api_base: Option<String>,
    /// Overrides the environment's streaming host.
    #[serde(default)]
    pub stream_base: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Keep the token out of logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("environment", &self.environment)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("account_id", &self.account_id)
            .field("username", &self.username)
            .field("api_base", &self.api_base)
            .field("stream_base", &self.stream_base)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            token: String::new(),
            account_id: String::new(),
            username: None,
            api_base: None,
            stream_base: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or(self.environment.api_base())
    }

    pub fn stream_base(&self) -> &str {
        self.stream_base
            .as_deref()
            .unwrap_or(self.environment.stream_base())
    }
}

/// Fetch pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Upstream per-request row ceiling.
    #[serde(default = "default_per_request_limit")]
    pub per_request_limit: u32,
    #[serde(default)]
    pub feed: FeedVariant,
    /// Bytes read from a chunk stream per fragment.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Cap on simultaneously open chunk streams. Unset means four per
    /// available core, never more than the plan has chunks.
    #[serde(default)]
    pub max_concurrent_streams: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            per_request_limit: DEFAULT_PER_REQUEST_LIMIT,
            feed: FeedVariant::default(),
            read_buffer_size: default_read_buffer_size(),
            max_concurrent_streams: None,
        }
    }
}

fn default_per_request_limit() -> u32 {
    DEFAULT_PER_REQUEST_LIMIT
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_timeout_secs() -> u64 {
    30
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandlefetchConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl CandlefetchConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.per_request_limit == 0 {
            return Err(ConfigError::Invalid(
                "fetch.per_request_limit must be positive".into(),
            ));
        }
        if self.fetch.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "fetch.read_buffer_size must be positive".into(),
            ));
        }
        if self.fetch.max_concurrent_streams == Some(0) {
            return Err(ConfigError::Invalid(
                "fetch.max_concurrent_streams must be positive when set".into(),
            ));
        }
        if self.broker.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Token check, separate from `validate` so the CLI can inject `--token` first.
    pub fn require_token(&self) -> Result<(), ConfigError> {
        if self.broker.environment != Environment::Sandbox && self.broker.token.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "broker.token is required for the {} environment",
                self.broker.environment
            )));
        }
        Ok(())
    }
}
