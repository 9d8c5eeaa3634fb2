//! Stage protocol and the per-request value threaded through the stages.
//!
//! A stage either answers the request ([`Outcome::Handled`]) or forwards a
//! failure outward ([`Outcome::Forward`]). Stages never write an error
//! response themselves: the outermost reporting stage does that once.
//!
//! State computed by one stage reaches later stages through the
//! [`Exchange`], which lives exactly as long as the request.

use std::future::Future;

use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;

use super::upstream::Duplication;
use crate::error::{HandoffError, PipelineError};

/// Result of running a stage.
#[derive(Debug)]
pub enum Outcome {
    /// The response for the client; nothing else may be written.
    Handled(Response),
    /// Not handled; the reporting stage writes `status` and `error`.
    Forward {
        status: StatusCode,
        error: PipelineError,
    },
}

impl Outcome {
    /// Forward `error` with the status it maps to.
    pub fn forward(error: impl Into<PipelineError>) -> Self {
        let error = error.into();
        Outcome::Forward {
            status: error.status(),
            error,
        }
    }
}

/// One unit of the request pipeline. Wrapping stages call their inner stage
/// and pass its outcome on unless they must short-circuit.
pub trait Stage: Send + Sync {
    fn serve(&self, exchange: &mut Exchange) -> impl Future<Output = Outcome> + Send;
}

/// The inbound request plus whatever earlier stages handed off.
pub struct Exchange {
    parts: Parts,
    body: Option<Body>,
    duplication: Option<Duplication>,
}

impl Exchange {
    pub fn new(request: Request) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            body: Some(body),
            duplication: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// The inbound body; `None` once a stage has taken it.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Hand the duplication result to later stages. Only the duplicator can
    /// build a [`Duplication`], so it is the only writer.
    pub fn attach(&mut self, duplication: Duplication) -> Result<(), HandoffError> {
        if self.duplication.is_some() {
            return Err(HandoffError::AlreadyAttached);
        }
        self.duplication = Some(duplication);
        Ok(())
    }

    pub fn duplication(&self) -> Result<&Duplication, HandoffError> {
        self.duplication.as_ref().ok_or(HandoffError::Missing)
    }

    /// Access for readers that take a response body.
    pub fn duplication_mut(&mut self) -> Result<&mut Duplication, HandoffError> {
        self.duplication.as_mut().ok_or(HandoffError::Missing)
    }

    /// Take the result back; used by the duplicator to close the bodies.
    pub(super) fn detach(&mut self) -> Option<Duplication> {
        self.duplication.take()
    }
}
