//! Collected upstream responses and the duplication result that owns them.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, StatusCode};
use axum::BoxError;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;

use super::select::HasStatus;

type BoxedStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// An open upstream response body. Dropping it closes the upstream
/// connection (or hands it back to the pool once fully read).
pub struct UpstreamBody {
    inner: BoxedStream,
}

impl UpstreamBody {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            inner: Box::pin(stream.map_err(Into::<BoxError>::into)),
        }
    }

    #[cfg(test)]
    pub async fn into_bytes(self) -> Result<Bytes, BoxError> {
        let chunks: Vec<Bytes> = self.try_collect().await?;
        Ok(chunks.concat().into())
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// One destination's answer.
pub struct UpstreamResponse {
    index: usize,
    destination: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<UpstreamBody>,
}

impl UpstreamResponse {
    pub fn new(
        index: usize,
        destination: impl Into<String>,
        status: StatusCode,
        headers: HeaderMap,
        body: UpstreamBody,
    ) -> Self {
        Self {
            index,
            destination: destination.into(),
            status,
            headers,
            body: Some(body),
        }
    }

    pub(crate) fn from_reqwest(
        index: usize,
        destination: &str,
        response: reqwest::Response,
    ) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        Self::new(
            index,
            destination,
            status,
            headers,
            UpstreamBody::new(response.bytes_stream()),
        )
    }

    /// Position of the destination in the configured list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Hand the body to its single reader. `None` once taken.
    pub fn take_body(&mut self) -> Option<UpstreamBody> {
        self.body.take()
    }

    fn is_open(&self) -> bool {
        self.body.is_some()
    }
}

impl HasStatus for UpstreamResponse {
    fn status(&self) -> StatusCode {
        self.status
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("index", &self.index)
            .field("destination", &self.destination)
            .field("status", &self.status)
            .field("body_open", &self.is_open())
            .finish()
    }
}

/// Every response of one request, slot `i` answering destination `i`.
///
/// Only the duplicator builds one. Dropping it closes every body that is
/// still held.
#[derive(Debug)]
pub struct Duplication {
    responses: Vec<UpstreamResponse>,
}

impl Duplication {
    /// `responses` must already be index-aligned.
    pub(super) fn new(responses: Vec<UpstreamResponse>) -> Self {
        debug_assert!(responses.iter().enumerate().all(|(i, r)| r.index == i));
        Self { responses }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn responses(&self) -> &[UpstreamResponse] {
        &self.responses
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut UpstreamResponse> {
        self.responses.get_mut(index)
    }
}

impl Drop for Duplication {
    fn drop(&mut self) {
        let open = self.responses.iter().filter(|r| r.is_open()).count();
        tracing::debug!(
            responses = self.responses.len(),
            closed = open,
            "Closing upstream response bodies"
        );
    }
}
