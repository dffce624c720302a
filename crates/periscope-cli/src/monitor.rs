//! Monitor server
//!
//! Serves the prebuilt monitor UI and pushes live traffic events to every
//! connected WebSocket subscriber.
//!
//! Any request carrying WebSocket upgrade headers is a subscriber handshake,
//! whatever its path. Everything else is a static file lookup, with
//! `index.html` served for directories.
//!
//! Subscriber lifecycle: `Connecting` (handshake, origin check) → `Open`
//! (registered on the bus, receiving frames) → `Closing` (send failure,
//! peer close, protocol error, or bus shutdown; unregistered) → `Closed`
//! (removed from the connection registry). A rejected handshake never
//! reaches the bus.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use periscope_core::config::defaults::MONITOR_SUBPROTOCOL;
use periscope_core::snapshot::now_millis;
use periscope_core::{AppConfig, AppError, SubscriberId, TrafficBus};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Handshake predicate deciding which origins may subscribe
pub trait OriginPolicy: Send + Sync {
    fn allows(&self, origin: Option<&str>) -> bool;
}

/// Accepts every handshake
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl OriginPolicy for AllowAll {
    fn allows(&self, _origin: Option<&str>) -> bool {
        true
    }
}

/// Accepts only handshakes whose `Origin` is on the list
#[derive(Debug, Clone)]
pub struct AllowList {
    origins: Vec<String>,
}

impl AllowList {
    pub fn new(origins: Vec<String>) -> Self {
        let origins = origins
            .into_iter()
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .collect();
        Self { origins }
    }
}

impl OriginPolicy for AllowList {
    fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            Some(origin) => self
                .origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
            None => false,
        }
    }
}

/// Lifecycle stage of one subscriber connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Registry entry for an open subscriber connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub origin: Option<String>,
    pub state: ConnectionState,
    /// Milliseconds since UNIX epoch
    pub connected_at: u64,
}

/// Why a subscriber connection ended
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    SendFailed(String),
    ProtocolError(String),
    BusClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::SendFailed(e) => write!(f, "send failed: {e}"),
            CloseReason::ProtocolError(e) => write!(f, "protocol error: {e}"),
            CloseReason::BusClosed => write!(f, "server shutting down"),
        }
    }
}

/// State shared across monitor handlers
#[derive(Clone)]
pub struct MonitorState {
    bus: Arc<TrafficBus>,
    connections: Arc<RwLock<HashMap<SubscriberId, ConnectionInfo>>>,
    origin_policy: Arc<dyn OriginPolicy>,
    static_dir: PathBuf,
}

impl MonitorState {
    pub fn new(config: &AppConfig, bus: Arc<TrafficBus>) -> Self {
        let origin_policy: Arc<dyn OriginPolicy> = if config.allowed_origins.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(AllowList::new(config.allowed_origins.clone()))
        };
        Self::with_policy(bus, config.static_dir.clone(), origin_policy)
    }

    pub fn with_policy(
        bus: Arc<TrafficBus>,
        static_dir: PathBuf,
        origin_policy: Arc<dyn OriginPolicy>,
    ) -> Self {
        Self {
            bus,
            connections: Arc::new(RwLock::new(HashMap::new())),
            origin_policy,
            static_dir,
        }
    }

    /// Number of subscriber connections currently open
    pub async fn subscriber_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Copy of the connection registry
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    async fn set_connection_state(&self, id: SubscriberId, state: ConnectionState) {
        if let Some(info) = self.connections.write().await.get_mut(&id) {
            info.state = state;
        }
    }
}

/// Build the monitor router
pub fn monitor_router(state: MonitorState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .fallback(monitor_handler)
        .with_state(state)
        .layer(cors)
}

/// Run the monitor on an already bound listener until `shutdown` resolves
pub async fn run_monitor<F>(
    listener: TcpListener,
    state: MonitorState,
    shutdown: F,
) -> periscope_core::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!("Server (monitor) is listening on port {}", port);

    axum::serve(
        listener,
        monitor_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| AppError::ServerError(format!("monitor: {e}")))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    subscribers: usize,
    published: u64,
    connections: Vec<ConnectionInfo>,
}

/// Health check endpoint; a handshake here is still a subscriber
async fn health_handler(
    State(state): State<MonitorState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
) -> Response {
    if let Some(upgrade) = ws {
        return accept_subscriber(state, peer, upgrade, &headers);
    }
    let connections = state.connections().await;
    Json(HealthResponse {
        status: "ok",
        subscribers: connections.len(),
        published: state.bus.published_count(),
        connections,
    })
    .into_response()
}

/// Upgrade requests become subscribers; anything else is a static file
async fn monitor_handler(
    State(state): State<MonitorState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    req: Request<axum::body::Body>,
) -> Response {
    match ws {
        Some(upgrade) => accept_subscriber(state, peer, upgrade, req.headers()),
        None => serve_static(&state, req).await,
    }
}

/// `Connecting` → `Open`: evaluate the origin policy once, then upgrade
fn accept_subscriber(
    state: MonitorState,
    peer: SocketAddr,
    upgrade: WebSocketUpgrade,
    headers: &HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !state.origin_policy.allows(origin.as_deref()) {
        warn!(
            peer = %peer,
            "Connection from origin {} rejected",
            origin.as_deref().unwrap_or("<none>")
        );
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    debug!(peer = %peer, state = ?ConnectionState::Connecting, "Subscriber handshake accepted");
    upgrade
        .protocols([MONITOR_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_subscriber(socket, state, peer, origin))
}

/// Drive one subscriber connection from `Open` to `Closed`
async fn handle_subscriber(
    socket: WebSocket,
    state: MonitorState,
    peer: SocketAddr,
    origin: Option<String>,
) {
    let mut subscription = state.bus.subscribe().await;
    let id = subscription.id();
    state.connections.write().await.insert(
        id,
        ConnectionInfo {
            peer,
            origin,
            state: ConnectionState::Open,
            connected_at: now_millis(),
        },
    );
    info!(peer = %peer, subscriber = %id, "Connection accepted");

    let (mut sender, mut receiver) = socket.split();

    let reason = loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break CloseReason::BusClosed;
                };
                let frame = match event.to_json() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(id = %event.id(), "Failed to serialize {} event: {}", event.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(frame)).await {
                    break CloseReason::SendFailed(e.to_string());
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) => break CloseReason::PeerClosed,
                    Some(Ok(Message::Text(text))) => {
                        debug!(peer = %peer, "Ignoring {} byte message from subscriber", text.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::ProtocolError(e.to_string()),
                }
            }
        }
    };

    state.set_connection_state(id, ConnectionState::Closing).await;
    state.bus.unsubscribe(id).await;
    if matches!(reason, CloseReason::BusClosed) {
        let _ = sender.close().await;
    }
    if subscription.dropped() > 0 {
        info!(
            peer = %peer,
            "Subscriber missed {} events while lagging",
            subscription.dropped()
        );
    }
    state.connections.write().await.remove(&id);
    debug!(subscriber = %id, state = ?ConnectionState::Closed, "Connection removed");

    info!(peer = %peer, "Peer {} disconnected ({})", peer, reason);
}

async fn serve_static(state: &MonitorState, req: Request<axum::body::Body>) -> Response {
    let result: Result<_, Infallible> = ServeDir::new(&state.static_dir).oneshot(req).await;
    match result {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}
