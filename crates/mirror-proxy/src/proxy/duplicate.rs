//! Request duplication: one inbound request becomes one outbound request per
//! destination, and the collected responses are handed to the next stage.
//!
//! Dispatches run concurrently in a [`JoinSet`]. Each task owns its copy of
//! the method, headers and body, and returns a response tagged with its
//! destination index; the collector writes it into slot `index`, so the
//! result is index-aligned no matter which destination answers first.
//! Dropping the collector aborts every dispatch still in flight, which is how
//! client disconnects and the optional deadline cancel outstanding work.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use futures_core::Stream;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::body::{self, BodyCopy, BodyStrategy};
use super::handoff::{Exchange, Outcome, Stage};
use super::headers::outbound_headers;
use super::upstream::{Duplication, UpstreamResponse};
use crate::error::{ConfigError, DuplicationError};

/// Largest inbound body the buffered strategy reads.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Base URL of one destination, without a trailing `/`.
///
/// The inbound path and query are appended verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination(String);

impl Destination {
    /// Validate a destination given on the command line or in config.
    /// A bare `host:port` is taken as plain HTTP.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidDestination {
            destination: raw.to_string(),
            reason: reason.to_string(),
        };

        let base = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = reqwest::Url::parse(&base).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("a destination cannot carry a query or fragment"));
        }

        Ok(Self(base.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full URL for an inbound path and query, e.g. `/items?page=2`.
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.0, path_and_query)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the outbound client.
///
/// Decompression stays off so each destination's body and
/// `content-encoding` reach the client untouched. No user agent is set, so
/// outbound requests carry none at all.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .build()
}

/// Sends every inbound request to all destinations.
#[derive(Clone)]
pub struct Duplicator {
    client: reqwest::Client,
    destinations: Arc<[Destination]>,
    strategy: BodyStrategy,
    max_body_bytes: usize,
    deadline: Option<Duration>,
}

impl Duplicator {
    pub fn new(client: reqwest::Client, destinations: Vec<Destination>) -> Self {
        Self {
            client,
            destinations: destinations.into(),
            strategy: BodyStrategy::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            deadline: None,
        }
    }

    pub fn with_body_strategy(mut self, strategy: BodyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Fail with [`DuplicationError::DeadlineExceeded`] when the slowest
    /// destination has not answered after `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Dispatch one request to every destination and wait for all of them.
    ///
    /// Any single failure fails the whole duplication; responses already
    /// collected are closed and dispatches still running are aborted.
    pub async fn duplicate(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Option<Body>,
    ) -> Result<Duplication, DuplicationError> {
        let count = self.destinations.len();
        let copies = body::duplicate(body, count, self.strategy, self.max_body_bytes).await?;
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        let headers = outbound_headers(headers);

        let mut tasks = JoinSet::new();
        for (index, (destination, copy)) in self.destinations.iter().zip(copies).enumerate() {
            let dispatch = Dispatch {
                client: self.client.clone(),
                index,
                url: destination.url_for(path_and_query),
                method: method.clone(),
                headers: headers.clone(),
                body: copy,
            };
            let span = mirror_tracing::dispatch_span!(index, dispatch.url);
            tasks.spawn(dispatch.send().instrument(span));
        }

        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, collect(tasks, count))
                .await
                .map_err(|_| DuplicationError::DeadlineExceeded(deadline))?,
            None => collect(tasks, count).await,
        }
    }
}

/// Everything one dispatch task owns.
struct Dispatch {
    client: reqwest::Client,
    index: usize,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: BodyCopy,
}

impl Dispatch {
    async fn send(self) -> Result<UpstreamResponse, DuplicationError> {
        let Dispatch {
            client,
            index,
            url,
            method,
            headers,
            body,
        } = self;
        let start = Instant::now();

        let mut builder = client.request(method, &url).headers(headers);
        if let Some(body) = body.into_request_body() {
            builder = builder.body(body);
        }
        let request = match builder.build() {
            Ok(request) => request,
            Err(source) => return Err(DuplicationError::Build { url, source }),
        };

        let response = match client.execute(request).await {
            Ok(response) => response,
            Err(source) => {
                tracing::warn!(error = %source, "Destination request failed");
                return Err(DuplicationError::Dispatch { url, source });
            }
        };

        let span = tracing::Span::current();
        span.record("status", response.status().as_u16());
        span.record("latency_ms", start.elapsed().as_millis() as u64);
        tracing::debug!("Destination answered");

        Ok(UpstreamResponse::from_reqwest(index, &url, response))
    }
}

/// Wait for every dispatch and place each response in its own slot.
async fn collect(
    mut tasks: JoinSet<Result<UpstreamResponse, DuplicationError>>,
    count: usize,
) -> Result<Duplication, DuplicationError> {
    let mut slots: Vec<Option<UpstreamResponse>> =
        std::iter::repeat_with(|| None).take(count).collect();

    while let Some(joined) = tasks.join_next().await {
        let response = joined??;
        let index = response.index();
        match slots.get_mut(index) {
            Some(slot) => *slot = Some(response),
            None => return Err(DuplicationError::MissingSlot { index }),
        }
    }

    let responses = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.ok_or(DuplicationError::MissingSlot { index }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Duplication::new(responses))
}

/// Runs the [`Duplicator`], attaches its result to the exchange and calls
/// the inner stage.
///
/// Once the inner stage has answered, the duplication is detached and tied
/// to the outgoing response body: every upstream body that was not relayed
/// stays open until the client has received the relayed one, then all are
/// closed together.
pub struct DuplicateStage<S> {
    duplicator: Duplicator,
    inner: S,
}

impl<S: Stage> DuplicateStage<S> {
    pub fn new(duplicator: Duplicator, inner: S) -> Self {
        Self { duplicator, inner }
    }
}

impl<S: Stage> Stage for DuplicateStage<S> {
    async fn serve(&self, exchange: &mut Exchange) -> Outcome {
        let body = exchange.take_body();
        let result = self
            .duplicator
            .duplicate(exchange.method(), exchange.uri(), exchange.headers(), body)
            .await;
        let duplication = match result {
            Ok(duplication) => duplication,
            Err(e) => return Outcome::forward(e),
        };
        tracing::debug!(
            responses = duplication.len(),
            "Collected a response from every destination"
        );

        if let Err(e) = exchange.attach(duplication) {
            return Outcome::forward(e);
        }
        let outcome = self.inner.serve(exchange).await;
        seal(outcome, exchange.detach())
    }
}

/// Close the remaining upstream bodies once `outcome` no longer needs them.
fn seal(outcome: Outcome, duplication: Option<Duplication>) -> Outcome {
    match (outcome, duplication) {
        (Outcome::Handled(response), Some(duplication)) => Outcome::Handled(response.map(|body| {
            Body::from_stream(Sealed {
                inner: body.into_data_stream(),
                duplication: Some(duplication),
            })
        })),
        (outcome, _) => outcome,
    }
}

/// Passes a body through and drops the held duplication when it ends.
struct Sealed<S> {
    inner: S,
    duplication: Option<Duplication>,
}

impl<S, E> Stream for Sealed<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(Pin::new(&mut self.inner).poll_next(cx));
        if !matches!(item, Some(Ok(_))) {
            self.duplication = None;
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, COOKIE, HOST, USER_AGENT};
    use axum::http::{HeaderValue, StatusCode};
    use axum::response::Response;
    use axum::Router;
    use tokio::sync::Mutex;

    use super::super::relay::RelayStage;
    use super::super::select::{HasStatus, OrderPolicy, StatusSet};
    use super::super::upstream::testing::{counted_body, duplication, CloseCounter};
    use super::*;
    use crate::testing::{destination, refused_addr, spawn_server};

    fn duplicator(destinations: Vec<Destination>) -> Duplicator {
        Duplicator::new(build_client(Duration::from_secs(5)).unwrap(), destinations)
    }

    /// Upstream answering `status` with body `upstream-{index}` after `delay`.
    async fn fixed_upstream(index: usize, status: u16, delay: Duration) -> Destination {
        let app = Router::new().fallback(move || async move {
            tokio::time::sleep(delay).await;
            (StatusCode::from_u16(status).unwrap(), format!("upstream-{index}"))
        });
        destination(spawn_server(app).await)
    }

    /// Upstream recording the headers and body of every request it gets.
    async fn capturing_upstream(captured: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>) -> Destination {
        let app = Router::new().fallback(move |headers: HeaderMap, body: Bytes| {
            let captured = captured.clone();
            async move {
                captured.lock().await.push((headers, body));
                StatusCode::OK
            }
        });
        destination(spawn_server(app).await)
    }

    async fn read_body(response: &mut UpstreamResponse) -> Bytes {
        response.take_body().unwrap().into_bytes().await.unwrap()
    }

    #[test]
    fn test_destination_parse() {
        let table = [
            ("localhost:9000", "http://localhost:9000"),
            ("  127.0.0.1:8081 ", "http://127.0.0.1:8081"),
            ("https://api.example.com/", "https://api.example.com"),
            ("http://backend/base/", "http://backend/base"),
        ];
        for (raw, expected) in table {
            assert_eq!(Destination::parse(raw).unwrap().as_str(), expected, "{raw:?}");
        }

        let base = Destination::parse("http://backend/base/").unwrap();
        assert_eq!(base.url_for("/items?page=2"), "http://backend/base/items?page=2");
    }

    #[test]
    fn test_destination_rejects_invalid() {
        for raw in ["", "ftp://files.example.com", "http://", "http://h/?x=1", "http://h/#top"] {
            assert!(
                matches!(Destination::parse(raw), Err(ConfigError::InvalidDestination { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_responses_stay_index_aligned_under_latency_skew() {
        let statuses = [500, 201, 404, 200];
        let mut destinations = Vec::new();
        for (i, status) in statuses.into_iter().enumerate() {
            // The first destination is the slowest, the last answers at once.
            let delay = Duration::from_millis(40 * (statuses.len() - 1 - i) as u64);
            destinations.push(fixed_upstream(i, status, delay).await);
        }

        let duplicator = duplicator(destinations.clone());
        let mut duplication = duplicator
            .duplicate(&Method::GET, &"/ping".parse().unwrap(), &HeaderMap::new(), None)
            .await
            .unwrap();

        assert_eq!(duplication.len(), statuses.len());
        for (i, status) in statuses.into_iter().enumerate() {
            let response = duplication.get_mut(i).unwrap();
            assert_eq!(response.index(), i);
            assert_eq!(response.status().as_u16(), status);
            assert_eq!(response.destination(), destinations[i].url_for("/ping"));
            assert_eq!(read_body(response).await, format!("upstream-{i}"));
        }
    }

    #[tokio::test]
    async fn test_headers_reach_every_destination() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut destinations = Vec::new();
        for _ in 0..3 {
            destinations.push(capturing_upstream(captured.clone()).await);
        }

        let mut inbound = HeaderMap::new();
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        inbound.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        inbound.insert(COOKIE, HeaderValue::from_static("status=testing"));
        inbound.insert(HOST, HeaderValue::from_static("mirror.local:8080"));

        duplicator(destinations)
            .duplicate(&Method::GET, &"/".parse().unwrap(), &inbound, None)
            .await
            .unwrap();

        let captured = captured.lock().await;
        assert_eq!(captured.len(), 3);
        for (received, _) in captured.iter() {
            for name in [CONTENT_TYPE, CACHE_CONTROL, COOKIE] {
                let sent: Vec<_> = inbound.get_all(&name).iter().collect();
                let got: Vec<_> = received.get_all(&name).iter().collect();
                assert_eq!(got, sent, "{name}");
            }
            assert!(received.get(USER_AGENT).is_none());
            assert_ne!(received[HOST], "mirror.local:8080");
            // Only transport headers are added on the way out. The client
            // falls back to `accept: */*` when the inbound request has none.
            for name in received.keys() {
                assert!(
                    inbound.contains_key(name) || *name == HOST || *name == ACCEPT,
                    "unexpected header {name}"
                );
            }
            if let Some(accept) = received.get(ACCEPT) {
                assert_eq!(accept, "*/*");
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_user_agent_is_cleared() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let destination = capturing_upstream(captured.clone()).await;

        let mut inbound = HeaderMap::new();
        inbound.insert(USER_AGENT, HeaderValue::from_static("curl/8.5.0"));
        duplicator(vec![destination])
            .duplicate(&Method::GET, &"/".parse().unwrap(), &inbound, None)
            .await
            .unwrap();

        let captured = captured.lock().await;
        assert!(captured[0].0.get(USER_AGENT).is_none());
    }

    #[tokio::test]
    async fn test_multipart_body_reaches_every_destination() {
        let boundary = "boundaryboundaryboundary";
        let payload = Bytes::from(format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"artist\"\r\n\r\n\
             The B-52's\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"album\"\r\n\r\n\
             Cosmic Thing\r\n\
             --{boundary}--"
        ));
        let content_type = format!("multipart/form-data; boundary={boundary}");

        for strategy in [BodyStrategy::Buffered, BodyStrategy::Streaming] {
            let captured = Arc::new(Mutex::new(Vec::new()));
            let mut destinations = Vec::new();
            for _ in 0..3 {
                destinations.push(capturing_upstream(captured.clone()).await);
            }

            let mut inbound = HeaderMap::new();
            inbound.insert(CONTENT_TYPE, content_type.parse().unwrap());
            duplicator(destinations)
                .with_body_strategy(strategy)
                .duplicate(
                    &Method::POST,
                    &"/upload".parse().unwrap(),
                    &inbound,
                    Some(Body::from(payload.clone())),
                )
                .await
                .unwrap();

            let captured = captured.lock().await;
            assert_eq!(captured.len(), 3, "{strategy:?}");
            for (headers, body) in captured.iter() {
                assert_eq!(headers[CONTENT_TYPE], content_type.as_str());
                assert_eq!(*body, payload, "{strategy:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_path_and_query_are_preserved() {
        let app = Router::new().fallback(|uri: Uri| async move { uri.to_string() });
        let addr = spawn_server(app).await;

        let mut duplication = duplicator(vec![destination(addr)])
            .duplicate(&Method::GET, &"/a/b?x=1&y=two".parse().unwrap(), &HeaderMap::new(), None)
            .await
            .unwrap();
        let body = read_body(duplication.get_mut(0).unwrap()).await;
        assert_eq!(body, "/a/b?x=1&y=two");
    }

    #[tokio::test]
    async fn test_one_failed_destination_fails_everything() {
        let refused = destination(refused_addr().await);
        let destinations = vec![
            fixed_upstream(0, 200, Duration::ZERO).await,
            refused.clone(),
            fixed_upstream(2, 200, Duration::ZERO).await,
        ];

        let result = duplicator(destinations)
            .duplicate(&Method::GET, &"/".parse().unwrap(), &HeaderMap::new(), None)
            .await;
        match result {
            Err(DuplicationError::Dispatch { url, .. }) => assert_eq!(url, refused.url_for("/")),
            other => panic!("expected a dispatch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_aborts_slow_destinations() {
        let destinations = vec![
            fixed_upstream(0, 200, Duration::ZERO).await,
            fixed_upstream(1, 200, Duration::from_secs(3)).await,
        ];
        let deadline = Duration::from_millis(100);

        let start = Instant::now();
        let result = duplicator(destinations)
            .with_deadline(Some(deadline))
            .duplicate(&Method::GET, &"/".parse().unwrap(), &HeaderMap::new(), None)
            .await;
        assert!(matches!(result, Err(DuplicationError::DeadlineExceeded(d)) if d == deadline));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_oversized_buffered_body_fails_before_dispatch() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let destination = capturing_upstream(captured.clone()).await;

        let result = duplicator(vec![destination])
            .with_max_body_bytes(4)
            .duplicate(
                &Method::POST,
                &"/".parse().unwrap(),
                &HeaderMap::new(),
                Some(Body::from("too large")),
            )
            .await;
        assert!(matches!(result, Err(DuplicationError::ReadBody(_))));
        assert!(captured.lock().await.is_empty());
    }

    /// Inner stage recording whether it ran and what it saw.
    #[derive(Default)]
    struct Probe {
        ran: AtomicBool,
    }

    impl Stage for Probe {
        async fn serve(&self, exchange: &mut Exchange) -> Outcome {
            self.ran.store(true, Ordering::SeqCst);
            let statuses: Vec<u16> = match exchange.duplication() {
                Ok(duplication) => duplication
                    .responses()
                    .iter()
                    .map(|r| r.status().as_u16())
                    .collect(),
                Err(e) => return Outcome::forward(e),
            };
            let body = statuses.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
            Outcome::Handled(Response::new(Body::from(body)))
        }
    }

    #[tokio::test]
    async fn test_stage_hands_responses_to_inner_stage() {
        let destinations = vec![
            fixed_upstream(0, 404, Duration::from_millis(30)).await,
            fixed_upstream(1, 201, Duration::ZERO).await,
        ];
        let stage = DuplicateStage::new(duplicator(destinations), Probe::default());

        let mut exchange = Exchange::new(axum::extract::Request::new(Body::empty()));
        let outcome = stage.serve(&mut exchange).await;
        assert!(stage.inner.ran.load(Ordering::SeqCst));
        let Outcome::Handled(response) = outcome else {
            panic!("expected a response");
        };
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "404,201");
        // The result does not outlive the stage.
        assert!(exchange.duplication().is_err());
    }

    #[tokio::test]
    async fn test_stage_forwards_failure_without_running_inner() {
        let destinations = vec![destination(refused_addr().await)];
        let stage = DuplicateStage::new(duplicator(destinations), Probe::default());

        let mut exchange = Exchange::new(axum::extract::Request::new(Body::empty()));
        match stage.serve(&mut exchange).await {
            Outcome::Forward { status, error } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(error.to_string().starts_with("sending failed"), "{error}");
            }
            Outcome::Handled(_) => panic!("expected a forwarded failure"),
        }
        assert!(!stage.inner.ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unread_bodies_close_after_relay_finishes() {
        let counter = CloseCounter::default();
        let mut exchange = Exchange::new(axum::extract::Request::new(Body::empty()));
        exchange.attach(duplication(&[500, 202, 201], &counter)).unwrap();

        let relay = RelayStage::new(OrderPolicy::PrioritizeAccepted, StatusSet::default());
        let outcome = seal(relay.serve(&mut exchange).await, exchange.detach());
        let Outcome::Handled(response) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(counter.closed(), 0, "bodies closed before the relay finished");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "body-1");
        assert_eq!(counter.closed(), 3);
    }

    #[tokio::test]
    async fn test_bodies_close_when_relay_fails_mid_stream() {
        let counter = CloseCounter::default();
        let mut responses = duplication(&[200, 200], &counter);
        let failing = counted_body(
            vec![Ok(Bytes::from_static(b"par")), Err("upstream reset".into())],
            &counter,
        );
        let first = responses.get_mut(0).unwrap();
        drop(first.take_body());
        *first = UpstreamResponse::new(
            0,
            "http://upstream-0",
            StatusCode::OK,
            HeaderMap::new(),
            failing,
        );

        let mut exchange = Exchange::new(axum::extract::Request::new(Body::empty()));
        exchange.attach(responses).unwrap();
        let relay = RelayStage::new(OrderPolicy::PreserveOrder, StatusSet::default());
        let outcome = relay.serve(&mut exchange).await;
        let Outcome::Handled(response) = seal(outcome, exchange.detach()) else {
            panic!("expected a response");
        };

        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
        // Three bodies were built: the replaced one, the failing one and slot 1.
        assert_eq!(counter.closed(), 3);
    }

    #[tokio::test]
    async fn test_forwarded_outcome_drops_duplication() {
        let counter = CloseCounter::default();
        let forwarded = Outcome::forward(crate::error::HandoffError::Missing);
        let outcome = seal(forwarded, Some(duplication(&[200, 500], &counter)));
        assert!(matches!(outcome, Outcome::Forward { .. }));
        assert_eq!(counter.closed(), 2);
    }
}
