//! Axum HTTP server: router, listener, graceful shutdown.
//!
//! Every method and path goes to the same handler, which runs the pipeline
//! and acts as the reporting stage: it is the only place a failure is turned
//! into a client response.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::proxy::duplicate::DuplicateStage;
use crate::proxy::handoff::{Exchange, Outcome, Stage};
use crate::proxy::relay::RelayStage;

/// The full request pipeline.
pub type Pipeline = DuplicateStage<RelayStage>;

/// Router sending every request through `stage`.
pub fn router<S: Stage + 'static>(stage: S) -> Router {
    Router::new()
        .fallback(handle_mirror::<S>)
        .with_state(Arc::new(stage))
        .layer(TraceLayer::new_for_http())
}

/// Build and run the HTTP server.
pub async fn run(listen_address: &str, pipeline: Pipeline) -> anyhow::Result<()> {
    let app = router(pipeline);

    let listener = tokio::net::TcpListener::bind(listen_address).await?;
    tracing::info!(address = %listen_address, "mirror-proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("mirror-proxy shut down gracefully");
    Ok(())
}

async fn handle_mirror<S: Stage + 'static>(
    State(stage): State<Arc<S>>,
    request: Request,
) -> Response {
    let request_id = Uuid::new_v4();
    let span =
        mirror_tracing::mirror_request_span!(request_id, request.method(), request.uri().path());
    let start = Instant::now();

    let mut exchange = Exchange::new(request);
    let outcome = stage.serve(&mut exchange).instrument(span.clone()).await;
    report(outcome, start, &span)
}

/// Write the outcome: a handled response as is, a forwarded failure as
/// `"<error>\n"` in plain text.
fn report(outcome: Outcome, start: Instant, span: &Span) -> Response {
    let latency_ms = start.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);

    match outcome {
        Outcome::Handled(response) => {
            let status = response.status().as_u16();
            span.record("status", status);
            tracing::info!(parent: span, status, latency_ms, "Relaying response");
            response
        }
        Outcome::Forward { status, error } => {
            span.record("status", status.as_u16());
            tracing::error!(
                parent: span,
                status = status.as_u16(),
                latency_ms,
                error = %error,
                "Request failed"
            );
            (
                status,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("{error}\n"),
            )
                .into_response()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        return;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
