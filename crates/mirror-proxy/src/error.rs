//! Error taxonomy for startup configuration and the per-request pipeline.

use std::time::Duration;

use axum::http::StatusCode;
use axum::BoxError;
use thiserror::Error;

/// Invalid startup configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid order policy {0:?}, expected one of: command, first-ok, first-ko")]
    InvalidPolicy(String),

    #[error("invalid status code {0:?} in accepted status list")]
    InvalidStatusCode(String),

    #[error("no destination configured")]
    NoDestinations,

    #[error("invalid destination {destination:?}: {reason}")]
    InvalidDestination { destination: String, reason: String },
}

/// Failure while fanning a request out. The whole request fails; no
/// upstream body reaches the client.
#[derive(Debug, Error)]
pub enum DuplicationError {
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] axum::Error),

    #[error("failed to build request for {url}: {source}")]
    Build {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed: {source}")]
    Dispatch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("destinations did not all answer within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("no response collected for destination {index}")]
    MissingSlot { index: usize },
}

/// A stage ran without the state an earlier stage should have handed off.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("duplication result missing: the duplicate stage did not run for this request")]
    Missing,

    #[error("duplication result already attached to this request")]
    AlreadyAttached,
}

/// Failure while relaying the chosen response.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no upstream response to relay")]
    NoResponse,

    #[error("body of destination {index} was already consumed")]
    BodyConsumed { index: usize },

    #[error("failed to build client response: {0}")]
    Build(#[from] axum::http::Error),

    /// Headers are already on the wire; only logged.
    #[error("relay aborted after {bytes} bytes: {source}")]
    Stream {
        bytes: u64,
        #[source]
        source: BoxError,
    },
}

/// Anything a stage can forward to the outer reporting stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sending failed: {0}")]
    Duplication(#[from] DuplicationError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl PipelineError {
    /// Status the reporting stage writes for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Duplication(DuplicationError::DeadlineExceeded(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
