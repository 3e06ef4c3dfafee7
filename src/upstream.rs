use crate::error::GatewayError;
use axum::Json;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HeaderMap, HeaderName};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

/// Lifecycle of one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    BackendConnecting,
    Streaming,
    Buffered,
    Complete,
    Failed,
    CleanedUp,
}

/// Counts backend sessions opened and released by this process.
#[derive(Clone, Default)]
pub struct SessionTracker {
    opened: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> u64 {
        self.opened().saturating_sub(self.released())
    }
}

/// Ownership token for one backend request/response pair.
///
/// Released exactly once, when dropped. For a streaming relay the session
/// lives inside the response body, so release happens when the body finishes
/// or the caller goes away.
pub struct ProxySession {
    id: uuid::Uuid,
    url: String,
    state: SessionState,
    bytes_relayed: u64,
    tracker: SessionTracker,
}

impl ProxySession {
    pub fn open(tracker: &SessionTracker, url: &str) -> Self {
        tracker.opened.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("relaygate_upstream_sessions_active").increment(1.0);
        Self {
            id: uuid::Uuid::new_v4(),
            url: url.to_string(),
            state: SessionState::Init,
            bytes_relayed: 0,
            tracker: tracker.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(session = %self.id, from = ?self.state, to = ?next, "proxy session transition");
        self.state = next;
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if self.state == SessionState::Streaming {
            tracing::info!(
                session = %self.id,
                url = %self.url,
                bytes = self.bytes_relayed,
                "stream relay ended before backend finished"
            );
        }
        self.transition(SessionState::CleanedUp);
        self.tracker.released.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("relaygate_upstream_sessions_active").decrement(1.0);
        tracing::debug!(session = %self.id, bytes = self.bytes_relayed, "proxy session released");
    }
}

pub struct ProxyRequest<'a> {
    pub method: Method,
    pub url: String,
    pub api_key: &'a str,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl<'a> ProxyRequest<'a> {
    pub fn new(method: Method, url: String, api_key: &'a str) -> Self {
        Self {
            method,
            url,
            api_key,
            body: None,
            timeout: None,
        }
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a forwarded call: a decoded JSON body, or a live relay.
pub enum ProxyOutcome {
    Buffered(Value),
    Streaming(Response),
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            Self::Buffered(value) => Json(value).into_response(),
            Self::Streaming(response) => response,
        }
    }
}

/// Issues one backend call and relays or buffers its answer.
pub async fn forward(
    client: &reqwest::Client,
    tracker: &SessionTracker,
    request: ProxyRequest<'_>,
) -> Result<ProxyOutcome, GatewayError> {
    let mut session = ProxySession::open(tracker, &request.url);
    session.transition(SessionState::BackendConnecting);

    let mut builder = client
        .request(request.method, &request.url)
        .bearer_auth(request.api_key)
        .header(CONTENT_TYPE, "application/json");
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            session.transition(SessionState::Failed);
            record_outcome("error");
            tracing::warn!(url = %request.url, "backend request failed: {err}");
            return Err(GatewayError::BackendUnreachable(err.to_string()));
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        session.transition(SessionState::Failed);
        record_outcome("error");
        let body = upstream.bytes().await.unwrap_or_default();
        tracing::warn!(url = %request.url, %status, "backend returned error status");
        return Err(GatewayError::from_backend_body(status, &body));
    }

    if is_event_stream(upstream.headers()) {
        session.transition(SessionState::Streaming);
        record_outcome("stream");
        return Ok(ProxyOutcome::Streaming(relay(upstream, session)));
    }

    session.transition(SessionState::Buffered);
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            session.transition(SessionState::Failed);
            record_outcome("error");
            return Err(GatewayError::BackendUnreachable(err.to_string()));
        }
    };
    session.bytes_relayed = bytes.len() as u64;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => {
            session.transition(SessionState::Complete);
            record_outcome("json");
            Ok(ProxyOutcome::Buffered(value))
        }
        Err(err) => {
            session.transition(SessionState::Failed);
            record_outcome("error");
            Err(GatewayError::MalformedBody(err.to_string()))
        }
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("relaygate_upstream_requests_total", "outcome" => outcome).increment(1);
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    let Some(raw) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match raw.parse::<mime::Mime>() {
        Ok(parsed) => parsed.type_() == mime::TEXT && parsed.subtype() == mime::EVENT_STREAM,
        Err(_) => raw.contains("text/event-stream"),
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn relay(upstream: reqwest::Response, session: ProxySession) -> Response {
    let status: StatusCode = upstream.status();
    let headers = upstream.headers().clone();
    let stream = RelayStream {
        inner: upstream.bytes_stream().boxed(),
        session,
    };
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    response
}

/// Backend byte stream that owns its session until the body is dropped.
struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    session: ProxySession,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.session.bytes_relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.session.transition(SessionState::Failed);
                tracing::warn!(session = %this.session.id, "backend stream broke: {err}");
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                this.session.transition(SessionState::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_released_once_on_drop() {
        let tracker = SessionTracker::new();
        let mut session = ProxySession::open(&tracker, "http://backend/chat/completions");
        assert_eq!(session.state(), SessionState::Init);
        session.transition(SessionState::BackendConnecting);
        assert_eq!(tracker.active(), 1);
        drop(session);
        assert_eq!(tracker.opened(), 1);
        assert_eq!(tracker.released(), 1);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn detects_event_stream_content_type() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn hop_by_hop_headers_are_not_copied() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-request-id")));
        assert!(!is_hop_by_hop(&CONTENT_TYPE));
    }
}
