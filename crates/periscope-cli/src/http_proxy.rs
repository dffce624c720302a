//! HTTP Proxy
//!
//! Transparent reverse proxy that forwards every request to the configured
//! backend and publishes a snapshot of each request and response leg to the
//! traffic bus.
//!
//! Bodies are streamed through in both directions. Capture rides alongside
//! the stream via [`periscope_core::tap`], so the bytes the backend and the
//! client see are never held back by monitoring.

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode, Version},
    response::{IntoResponse, Response},
    Router,
};
use hyper::ext::ReasonPhrase;
use periscope_core::snapshot::now_millis;
use periscope_core::{
    tap, AppConfig, AppError, BodyCapture, CapturedBody, CorrelationId, CorrelationIdGenerator,
    HeaderPair, RequestSnapshot, ResponseSnapshot, TrafficBus,
};
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// State shared across proxy handlers
#[derive(Clone)]
pub struct HttpProxyState {
    /// Backend base URL without trailing slash
    pub upstream_url: String,
    /// HTTP client for making requests to the backend
    pub client: Client,
    /// Destination for captured traffic
    pub bus: Arc<TrafficBus>,
    /// Source of correlation IDs
    pub ids: Arc<CorrelationIdGenerator>,
    /// Bytes kept per captured body leg
    pub max_body_bytes: usize,
}

impl HttpProxyState {
    pub fn new(config: &AppConfig, bus: Arc<TrafficBus>) -> periscope_core::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.upstream_timeout())
            .build()
            .map_err(|e| AppError::ClientBuildFailed(e.to_string()))?;

        Ok(Self {
            upstream_url: config.target_base(),
            client,
            bus,
            ids: Arc::new(CorrelationIdGenerator::new()),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

/// Everything about the response leg known once its head has arrived
struct ResponseHead {
    http_version: Version,
    status: StatusCode,
    /// Reason phrase as sent by the backend, when it is not the canonical one
    reason: Option<String>,
    headers: Vec<HeaderPair>,
    start: u64,
    capture: BodyCapture,
}

/// Everything about the request leg known before its body is read
struct RequestHead {
    id: CorrelationId,
    url: String,
    method: String,
    http_version: Version,
    headers: Vec<HeaderPair>,
    start: u64,
}

/// Build the proxy router; every path and method is forwarded
pub fn proxy_router(state: HttpProxyState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Run the HTTP proxy on an already bound listener until `shutdown` resolves
pub async fn run_http_proxy<F>(
    listener: TcpListener,
    state: HttpProxyState,
    shutdown: F,
) -> periscope_core::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(
        "Server (proxy) is listening on port {} for {}",
        port, state.upstream_url
    );

    axum::serve(listener, proxy_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::ServerError(format!("proxy: {e}")))
}

/// Main proxy handler - forwards the request and captures both legs
async fn proxy_handler(State(state): State<HttpProxyState>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let head = RequestHead {
        id: state.ids.next(),
        url: url.clone(),
        method: parts.method.to_string(),
        http_version: parts.version,
        headers: header_pairs(&parts.headers),
        start: now_millis(),
    };
    let id = head.id;
    debug!(id = %id, "Proxying {} {}", parts.method, url);

    let mut upstream_req = state
        .client
        .request(parts.method.clone(), format!("{}{}", state.upstream_url, url));
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            upstream_req = upstream_req.header(name.clone(), value.clone());
        }
    }

    let request_capture = if body.is_end_stream() {
        None
    } else {
        let expected_len = body.size_hint().exact();
        let (tapped, capture) = tap(
            body.into_data_stream(),
            state.max_body_bytes,
            expected_len,
        );
        upstream_req = upstream_req.body(reqwest::Body::wrap_stream(tapped));
        Some(capture)
    };

    let (response_tx, response_rx) = oneshot::channel();
    tokio::spawn(publish_exchange(
        state.bus.clone(),
        head,
        request_capture,
        response_rx,
    ));

    let upstream_response = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            // Dropping response_tx tells the exchange there is no response leg
            return upstream_error(id, e);
        }
    };

    let status = upstream_response.status();
    let http_version = upstream_response.version();
    let resp_headers = upstream_response.headers().clone();
    let reason = upstream_response.extensions().get::<ReasonPhrase>().cloned();
    let expected_len = if has_no_body(&parts.method, status) {
        Some(0)
    } else {
        upstream_response.content_length()
    };

    let (tapped, capture) = tap(
        Box::pin(upstream_response.bytes_stream()),
        state.max_body_bytes,
        expected_len,
    );

    let _ = response_tx.send(ResponseHead {
        http_version,
        status,
        reason: reason
            .as_ref()
            .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned()),
        headers: header_pairs(&resp_headers),
        start: now_millis(),
        capture,
    });

    let mut response = Response::new(Body::from_stream(tapped));
    *response.status_mut() = status;
    if let Some(reason) = reason {
        response.extensions_mut().insert(reason);
    }
    let headers = response.headers_mut();
    for (name, value) in resp_headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

/// Publish the request snapshot, then the response snapshot if one arrives.
///
/// Runs as its own task per exchange so publication order is fixed: the
/// request event always goes out first, even if the backend answered before
/// the request body finished.
async fn publish_exchange(
    bus: Arc<TrafficBus>,
    head: RequestHead,
    request_capture: Option<BodyCapture>,
    response_rx: oneshot::Receiver<ResponseHead>,
) {
    let id = head.id;

    // Response capture runs alongside so its end time is not skewed
    let response_leg = tokio::spawn(async move {
        let head = response_rx.await.ok()?;
        let body = head.capture.finish().await;
        Some(ResponseSnapshot {
            id,
            http_version: version_str(head.http_version).to_string(),
            headers: head.headers,
            status_code: head.status.as_u16(),
            status_message: head.reason.unwrap_or_else(|| {
                head.status.canonical_reason().unwrap_or("").to_string()
            }),
            body,
            start: head.start,
            end: now_millis(),
        })
    });

    let (body, end) = match request_capture {
        Some(capture) => {
            let body = capture.finish().await;
            (body, now_millis())
        }
        None => (CapturedBody::empty(), head.start),
    };

    bus.publish(
        RequestSnapshot {
            id,
            url: head.url,
            method: head.method,
            http_version: version_str(head.http_version).to_string(),
            headers: head.headers,
            body,
            start: head.start,
            end,
        }
        .into(),
    )
    .await;

    match response_leg.await {
        Ok(Some(snapshot)) => {
            bus.publish(snapshot.into()).await;
        }
        Ok(None) => debug!(id = %id, "Exchange ended without a response"),
        Err(e) => warn!(id = %id, "Response capture task failed: {}", e),
    }
}

/// Error response returned to the client when the backend cannot be reached
fn upstream_error(id: CorrelationId, e: reqwest::Error) -> Response {
    if e.is_timeout() {
        warn!(id = %id, "Upstream request timed out: {}", e);
        return (StatusCode::GATEWAY_TIMEOUT, "Upstream request timed out").into_response();
    }
    error!(id = %id, "Upstream request failed: {}", e);
    (
        StatusCode::BAD_GATEWAY,
        format!("Upstream request failed: {e}"),
    )
        .into_response()
}

/// Responses that never carry a body, whatever their headers say
fn has_no_body(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Flatten a header map into ordered pairs, one per value
fn header_pairs(headers: &HeaderMap) -> Vec<HeaderPair> {
    headers
        .iter()
        .map(|(name, value)| {
            HeaderPair::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}
