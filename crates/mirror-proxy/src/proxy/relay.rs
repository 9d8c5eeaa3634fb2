//! Final stage: rank the collected responses and stream the winner back.
//!
//! Status and headers of the chosen response are written first, then its
//! body is streamed chunk by chunk. The other responses are never read; the
//! duplicate stage closes them once the relayed body ends.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use axum::BoxError;
use bytes::Bytes;
use futures_core::Stream;
use tracing::Span;

use super::handoff::{Exchange, Outcome, Stage};
use super::headers::end_to_end;
use super::select::{HasStatus, OrderPolicy, StatusSet};
use super::upstream::{Duplication, UpstreamBody, UpstreamResponse};
use crate::error::{PipelineError, RelayError};

/// Relays the response the [`OrderPolicy`] ranks first.
#[derive(Debug, Clone)]
pub struct RelayStage {
    policy: OrderPolicy,
    accepted: StatusSet,
}

impl RelayStage {
    pub fn new(policy: OrderPolicy, accepted: StatusSet) -> Self {
        Self { policy, accepted }
    }

    fn relay(&self, exchange: &mut Exchange) -> Result<Response, PipelineError> {
        let chosen = self.choose(exchange.duplication()?)?;
        let response = exchange
            .duplication_mut()?
            .get_mut(chosen)
            .ok_or(RelayError::NoResponse)?;
        Ok(write_response(response)?)
    }

    /// Index of the first response after ranking.
    fn choose(&self, duplication: &Duplication) -> Result<usize, RelayError> {
        let ranked = self
            .policy
            .sort(&self.accepted, duplication.responses().iter().collect());
        let chosen = ranked.first().ok_or(RelayError::NoResponse)?;

        tracing::debug!(
            policy = %self.policy,
            chosen = chosen.index(),
            status = chosen.status().as_u16(),
            destination = chosen.destination(),
            ranked = ?ranked.iter().map(|r| r.index()).collect::<Vec<_>>(),
            "Selected response to relay"
        );
        Span::current().record("chosen_index", chosen.index());
        Ok(chosen.index())
    }
}

impl Stage for RelayStage {
    async fn serve(&self, exchange: &mut Exchange) -> Outcome {
        match self.relay(exchange) {
            Ok(response) => Outcome::Handled(response),
            Err(e) => Outcome::forward(e),
        }
    }
}

/// Status and end-to-end headers of `upstream`, with its body streamed.
fn write_response(upstream: &mut UpstreamResponse) -> Result<Response, RelayError> {
    let index = upstream.index();
    let body = upstream
        .take_body()
        .ok_or(RelayError::BodyConsumed { index })?;

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in end_to_end(upstream.headers()) {
        // `header` appends, so repeated headers keep every value.
        builder = builder.header(name, value);
    }

    let body = RelayBody {
        inner: body,
        index,
        span: Span::current(),
        bytes: 0,
        finished: false,
    };
    Ok(builder.body(Body::from_stream(body))?)
}

/// Counts relayed bytes and records them on the request span once the
/// body ends, fails, or is dropped by the client.
struct RelayBody {
    inner: UpstreamBody,
    index: usize,
    span: Span,
    bytes: u64,
    finished: bool,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(source))) => {
                self.finished = true;
                self.span.record("relayed_bytes", self.bytes);
                let err = RelayError::Stream {
                    bytes: self.bytes,
                    source,
                };
                tracing::error!(
                    parent: &self.span,
                    index = self.index,
                    error = %err,
                    "Relay aborted"
                );
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.span.record("relayed_bytes", self.bytes);
                tracing::debug!(
                    parent: &self.span,
                    index = self.index,
                    bytes = self.bytes,
                    "Relay finished"
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            self.span.record("relayed_bytes", self.bytes);
            tracing::debug!(
                parent: &self.span,
                index = self.index,
                bytes = self.bytes,
                "Client stopped reading before the relay finished"
            );
        }
    }
}
