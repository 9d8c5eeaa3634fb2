//! Span builder helpers for mirror-proxy instrumentation.

/// Create the span covering one inbound request from arrival to the last
/// relayed byte.
///
/// Usage: `let span = mirror_request_span!(request_id, method, path);`
///
/// Fields recorded later:
/// - `status`: status code written to the client
/// - `latency_ms`: time until the pipeline produced its outcome
/// - `chosen_index`: destination index whose response was relayed
/// - `relayed_bytes`: body bytes written to the client, set when the relay ends
#[macro_export]
macro_rules! mirror_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "mirror_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            chosen_index = tracing::field::Empty,
            relayed_bytes = tracing::field::Empty,
        )
    };
}

/// Create a span for the dispatch of one duplicated request to a destination.
#[macro_export]
macro_rules! dispatch_span {
    ($index:expr, $url:expr) => {
        tracing::info_span!(
            "dispatch",
            index = $index,
            url = %$url,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
