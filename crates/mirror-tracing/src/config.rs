//! Tracing configuration types.

use serde::{Deserialize, Serialize};

/// Filter applied when `--verbose` is given on the command line.
pub const VERBOSE_LOG_LEVEL: &str = "debug";

/// Configuration for logging and the optional OpenTelemetry exporter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TracingConfig {
    /// The service name reported to the OTLP collector.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint (e.g. "http://localhost:4317").
    /// When `None`, nothing is exported and only stderr logging is installed.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Transport protocol for OTLP export.
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// Log filter directive (e.g. "info", "mirror_proxy=debug,info").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shape of the stderr log lines.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Stderr log line format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// OTLP transport protocol.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

fn default_service_name() -> String {
    "mirror-proxy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TracingConfig {
    /// Raise the filter to [`VERBOSE_LOG_LEVEL`].
    pub fn verbose(mut self) -> Self {
        self.log_level = VERBOSE_LOG_LEVEL.to_string();
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}
