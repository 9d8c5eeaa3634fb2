//! Configuration types and loading logic.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use mirror_tracing::TracingConfig;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::body::BodyStrategy;
use crate::proxy::duplicate::{Destination, DEFAULT_MAX_BODY_BYTES};
use crate::proxy::select::{OrderPolicy, StatusSet};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ordering: OrderingConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

/// Where requests are duplicated to and how.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URLs, in the order used by the `command` policy.
    #[serde(default)]
    pub destinations: Vec<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Fail with 504 when any destination takes longer than this.
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    #[serde(default)]
    pub body_strategy: BodyStrategy,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Which collected response is relayed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderingConfig {
    #[serde(default)]
    pub policy: OrderPolicy,

    /// Either `"200 201"` or `[200, 201]`.
    #[serde(default)]
    pub accepted_statuses: StatusSet,
}

fn default_listen_address() -> String {
    "localhost:8080".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            timeout_secs: default_timeout(),
            deadline_ms: None,
            body_strategy: BodyStrategy::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Validated destinations; at least one is required.
    pub fn parse_destinations(&self) -> Result<Vec<Destination>, ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        self.destinations
            .iter()
            .map(|raw| Destination::parse(raw))
            .collect()
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (MIRROR_ prefix, __ for nesting)
    /// 2. TOML config file (skipped when absent)
    /// 3. Defaults
    ///
    /// Command-line flags are applied on top by the caller.
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("MIRROR_").split("__"));
        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        Ok(figment.extract()?)
    }
}
