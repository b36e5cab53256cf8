#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use hooklink_core::auth::SessionDescriptor;
use hooklink_core::transport::{TransportConfig, SUBPROTOCOL};
use hooklink_core::tunnel::TunnelConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const SECRET: &str = "whsec_x";
pub const WEBSOCKET_ID: &str = "wid1";
pub const EXPIRED_ID: &str = "expired";

/// Tunnel settings short enough for tests.
pub fn fast_tunnel() -> TunnelConfig {
    TunnelConfig {
        connect_attempt_wait: Duration::from_millis(50),
        reconnect_interval: Duration::from_secs(60),
        inbound_buffer: 16,
    }
}

pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        handshake_timeout: Duration::from_secs(2),
        close_delay: Duration::from_millis(100),
        ..TransportConfig::default()
    }
    .with_pong_wait(Duration::from_secs(2))
}

pub fn descriptor(websocket_url: &str, websocket_id: &str) -> SessionDescriptor {
    SessionDescriptor {
        websocket_url: websocket_url.to_owned(),
        websocket_id: websocket_id.to_owned(),
        authorized_feature: "webhooks".to_owned(),
        secret: SECRET.to_owned(),
        reconnect_delay: None,
        default_version: "2020-08-27".to_owned(),
        latest_version: "2024-06-20".to_owned(),
        connect_filter_warning: false,
    }
}

pub fn webhook_frame(webhook_id: &str, conversation_id: &str, payload: Value) -> Value {
    json!({
        "type": "webhook_event",
        "webhook_id": webhook_id,
        "webhook_conversation_id": conversation_id,
        "event_payload": payload.to_string(),
        "http_headers": {"Stripe-Signature": "t=1,v1=sig"},
        "endpoint": {"api_version": null},
    })
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Clone)]
pub struct Upgrade {
    pub websocket_id: Option<String>,
    pub feature: Option<String>,
    pub protocol: Option<String>,
}

struct BackendState {
    addr: SocketAddr,
    pending: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    received: mpsc::UnboundedSender<Value>,
    session_posts: AtomicUsize,
    session_forms: Mutex<Vec<String>>,
    fail_sessions: AtomicBool,
    connect_filter_warning: AtomicBool,
    upgrades: Mutex<Vec<Upgrade>>,
    kick: tokio::sync::Notify,
    webhook_endpoints: Mutex<Value>,
    endpoint_versions: Mutex<Vec<Option<String>>>,
}

/// Fake backend: the session endpoint and the tunnel websocket on one port.
pub struct MockBackend {
    pub addr: SocketAddr,
    push: mpsc::UnboundedSender<String>,
    received: mpsc::UnboundedReceiver<Value>,
    state: Arc<BackendState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push, pending) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();

        let state = Arc::new(BackendState {
            addr,
            pending: tokio::sync::Mutex::new(pending),
            received: received_tx,
            session_posts: AtomicUsize::new(0),
            session_forms: Mutex::new(Vec::new()),
            fail_sessions: AtomicBool::new(false),
            connect_filter_warning: AtomicBool::new(false),
            upgrades: Mutex::new(Vec::new()),
            kick: tokio::sync::Notify::new(),
            webhook_endpoints: Mutex::new(json!({"data": []})),
            endpoint_versions: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/stripecli/sessions", post(create_session))
            .route("/v1/webhook_endpoints", get(list_webhook_endpoints))
            .route("/subscribe", get(subscribe))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            addr,
            push,
            received,
            state,
        }
    }

    pub fn api_base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn websocket_url(&self) -> String {
        format!("ws://{}/subscribe", self.addr)
    }

    /// Queues a frame for the current or next tunnel connection.
    pub fn push(&self, frame: Value) {
        self.push.send(frame.to_string()).unwrap();
    }

    /// Next frame the client wrote to the tunnel.
    pub async fn next_received(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("no frame from client within 5s")
            .expect("backend closed")
    }

    pub async fn assert_nothing_received(&mut self, within: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(within, self.received.recv()).await {
            panic!("unexpected frame from client: {frame}");
        }
    }

    pub fn session_posts(&self) -> usize {
        self.state.session_posts.load(Ordering::SeqCst)
    }

    pub fn session_forms(&self) -> Vec<String> {
        self.state.session_forms.lock().unwrap().clone()
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.state.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn warn_about_connect_filter(&self) {
        self.state.connect_filter_warning.store(true, Ordering::SeqCst);
    }

    /// Drops the live tunnel socket without a close handshake.
    pub fn kick(&self) {
        self.state.kick.notify_one();
    }

    pub fn set_webhook_endpoints(&self, data: Value) {
        *self.state.webhook_endpoints.lock().unwrap() = json!({ "data": data });
    }

    /// `Stripe-Version` sent with each webhook endpoint listing.
    pub fn endpoint_versions(&self) -> Vec<Option<String>> {
        self.state.endpoint_versions.lock().unwrap().clone()
    }

    pub fn upgrades(&self) -> Vec<Upgrade> {
        self.state.upgrades.lock().unwrap().clone()
    }
}

async fn create_session(State(state): State<Arc<BackendState>>, body: String) -> Response {
    state.session_posts.fetch_add(1, Ordering::SeqCst);
    state.session_forms.lock().unwrap().push(body);
    if state.fail_sessions.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    Json(json!({
        "reconnect_delay": 0,
        "secret": SECRET,
        "websocket_id": WEBSOCKET_ID,
        "websocket_url": format!("ws://{}/subscribe", state.addr),
        "websocket_authorized_feature": "webhooks",
        "display_connect_filter_warning": state.connect_filter_warning.load(Ordering::SeqCst),
        "default_version": "2020-08-27",
        "latest_version": "2024-06-20",
    }))
    .into_response()
}

async fn list_webhook_endpoints(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> Json<Value> {
    let version = headers
        .get("stripe-version")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    state.endpoint_versions.lock().unwrap().push(version);
    Json(state.webhook_endpoints.lock().unwrap().clone())
}

async fn subscribe(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let websocket_id = header("websocket-id");
    state.upgrades.lock().unwrap().push(Upgrade {
        websocket_id: websocket_id.clone(),
        feature: query.get("websocket_feature").cloned(),
        protocol: header("sec-websocket-protocol"),
    });

    if websocket_id.as_deref() == Some(EXPIRED_ID) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "Unknown WebSocket ID."}})),
        )
            .into_response();
    }

    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| serve_tunnel(socket, state))
}

async fn serve_tunnel(socket: WebSocket, state: Arc<BackendState>) {
    let (mut tx, mut rx) = socket.split();
    let mut pending = state.pending.lock().await;
    loop {
        tokio::select! {
            _ = state.kick.notified() => break,
            frame = pending.recv() => match frame {
                Some(text) => {
                    if tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = state.received.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

struct DestinationState {
    status: StatusCode,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ReceivedRequest>>,
}

/// Local HTTP server standing in for a developer's webhook handler.
pub struct MockDestination {
    pub addr: SocketAddr,
    state: Arc<DestinationState>,
}

impl MockDestination {
    pub async fn start(status: StatusCode, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(DestinationState {
            status,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(receive)
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn receive(
    State(state): State<Arc<DestinationState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    state.requests.lock().unwrap().push(ReceivedRequest {
        path: uri.path().to_owned(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    tokio::time::sleep(state.delay).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    (state.status, [("x-served-by", "mock")], "ok").into_response()
}

/// Accepts connections and never answers.
pub async fn black_hole() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// A bare websocket tunnel endpoint that sends `frames` on every connection
/// and then stops reading, so pings go unanswered. With `deaf_for` set it
/// resumes reading (and answering pings) after that long; otherwise never.
pub struct DeafTunnel {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
}

impl DeafTunnel {
    pub async fn start(frames: Vec<Value>, deaf_for: Option<Duration>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let frames = frames.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) =
                        tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await
                    else {
                        return;
                    };
                    for frame in frames {
                        if ws.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    match deaf_for {
                        Some(pause) => {
                            tokio::time::sleep(pause).await;
                            while let Some(Ok(_)) = ws.next().await {}
                        }
                        None => std::future::pending::<()>().await,
                    }
                });
            }
        });
        Self { addr, accepts }
    }

    pub fn websocket_url(&self) -> String {
        format!("ws://{}/subscribe", self.addr)
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

fn echo_subprotocol(
    _request: &HandshakeRequest,
    mut response: HandshakeResponse,
) -> Result<HandshakeResponse, ErrorResponse> {
    response
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));
    Ok(response)
}
