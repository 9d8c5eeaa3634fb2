//! Request body duplication.
//!
//! An inbound body can be read once. [`duplicate`] turns it into N copies
//! that each destination reads at its own pace, either by buffering it up
//! front or by teeing chunks through per-destination channels.

use std::io;
use std::pin::Pin;

use axum::body::Body;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::DuplicationError;

/// Chunks each streaming copy may hold before the pump waits for its reader.
const TEE_CHANNEL_DEPTH: usize = 16;

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// How the inbound body is replicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyStrategy {
    /// Read the whole body into memory once; copies share the bytes.
    #[default]
    Buffered,
    /// Forward chunks as they arrive. The slowest destination paces the
    /// upstream read.
    Streaming,
}

/// One destination's view of the inbound body.
pub enum BodyCopy {
    Empty,
    Full(Bytes),
    Stream(ChunkStream),
}

impl BodyCopy {
    /// Convert into an outbound request body. `None` means send no body.
    pub fn into_request_body(self) -> Option<reqwest::Body> {
        match self {
            BodyCopy::Empty => None,
            BodyCopy::Full(bytes) => Some(reqwest::Body::from(bytes)),
            BodyCopy::Stream(stream) => Some(reqwest::Body::wrap_stream(stream)),
        }
    }

    #[cfg(test)]
    pub async fn into_bytes(self) -> Result<Bytes, io::Error> {
        match self {
            BodyCopy::Empty => Ok(Bytes::new()),
            BodyCopy::Full(bytes) => Ok(bytes),
            BodyCopy::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(chunks.concat().into())
            }
        }
    }
}

impl std::fmt::Debug for BodyCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyCopy::Empty => f.write_str("Empty"),
            BodyCopy::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            BodyCopy::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Replicate `source` into `copies` byte-identical bodies.
///
/// An absent source yields empty copies. With [`BodyStrategy::Buffered`] a
/// read error or a body over `max_bytes` fails before any copy exists. With
/// [`BodyStrategy::Streaming`] a read error is delivered to every copy.
pub async fn duplicate(
    source: Option<Body>,
    copies: usize,
    strategy: BodyStrategy,
    max_bytes: usize,
) -> Result<Vec<BodyCopy>, DuplicationError> {
    let Some(source) = source else {
        return Ok(empty(copies));
    };

    match strategy {
        BodyStrategy::Buffered => {
            let bytes = axum::body::to_bytes(source, max_bytes)
                .await
                .map_err(DuplicationError::ReadBody)?;
            if bytes.is_empty() {
                return Ok(empty(copies));
            }
            Ok((0..copies).map(|_| BodyCopy::Full(bytes.clone())).collect())
        }
        BodyStrategy::Streaming if copies == 1 => {
            let stream = source.into_data_stream().map_err(io::Error::other);
            Ok(vec![BodyCopy::Stream(Box::pin(stream))])
        }
        BodyStrategy::Streaming => Ok(tee(source, copies)),
    }
}

fn empty(copies: usize) -> Vec<BodyCopy> {
    (0..copies).map(|_| BodyCopy::Empty).collect()
}

/// Spawn a pump that fans each source chunk out to `copies` channels.
fn tee(source: Body, copies: usize) -> Vec<BodyCopy> {
    let mut sinks = Vec::with_capacity(copies);
    let mut outputs = Vec::with_capacity(copies);
    for _ in 0..copies {
        let (tx, rx) = mpsc::channel(TEE_CHANNEL_DEPTH);
        sinks.push(tx);
        outputs.push(BodyCopy::Stream(Box::pin(receiver_stream(rx))));
    }
    tokio::spawn(pump(source, sinks));
    outputs
}

/// Sole writer to every sink: one chunk reaches all open copies before the
/// next chunk is read.
async fn pump(source: Body, mut sinks: Vec<mpsc::Sender<Result<Bytes, io::Error>>>) {
    let mut chunks = source.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                let mut open = Vec::with_capacity(sinks.len());
                for sink in sinks {
                    if sink.send(Ok(bytes.clone())).await.is_ok() {
                        open.push(sink);
                    }
                }
                if open.is_empty() {
                    tracing::debug!("every body copy dropped, stopping tee");
                    return;
                }
                sinks = open;
            }
            Err(e) => {
                tracing::warn!(error = %e, "inbound body failed mid-stream");
                let message = e.to_string();
                for sink in &sinks {
                    let _ = sink.send(Err(io::Error::other(message.clone()))).await;
                }
                return;
            }
        }
    }
}

fn receiver_stream(
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}
