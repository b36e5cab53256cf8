//! One physical websocket connection to the tunnel backend.
//!
//! [`dial`] performs the upgrade. [`Connection::start`] splits the socket
//! into a read pump and a write pump. The write pump owns the sink and the
//! [`Outbox`] for as long as the connection lives, so there is never more
//! than one writer. The connection never reconnects by itself; the tunnel
//! decides what happens after [`Connection::close`].

mod pumps;

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::{self, http};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use tunnel_proto::SESSION_EXPIRED_MESSAGE;
use url::Url;

use crate::auth::SessionDescriptor;
use crate::client_info::ClientIdentity;

pub use pumps::{ClosedConnection, Connection, Outbox};
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SUBPROTOCOL: &str = "stripecli-devproxy-v1";
const WEBSOCKET_ID_HEADER: &str = "websocket-id";
const CLIENT_METADATA_HEADER: &str = "x-stripe-client-user-agent";

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Rewrites `wss://` tunnel URLs to `ws://`. Debugging only.
    pub no_wss: bool,
    pub handshake_timeout: Duration,
    /// A connection that sees no pong for this long is considered dead.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    /// How long to wait for the peer's close frame after sending ours.
    pub close_delay: Duration,
    pub identity: ClientIdentity,
}

impl TransportConfig {
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 2 / 10;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(10);
        Self {
            no_wss: false,
            handshake_timeout: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 2 / 10,
            write_wait: Duration::from_secs(1),
            close_delay: Duration::from_secs(1),
            identity: ClientIdentity::current(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid tunnel url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value for upgrade header {0}")]
    InvalidHeader(&'static str),
    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("websocket upgrade rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("no pong received within {0:?}")]
    PongTimeout(Duration),
    #[error("connection closed by peer")]
    ClosedByPeer,
}

impl TransportError {
    /// The backend no longer knows the websocket id; a fresh session is needed.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::Rejected { message, .. } if message == SESSION_EXPIRED_MESSAGE)
    }

    /// Whether the socket ended the way sockets normally end.
    pub fn is_expected_close(&self) -> bool {
        matches!(
            self,
            Self::ClosedByPeer
                | Self::Socket(tungstenite::Error::ConnectionClosed)
                | Self::Socket(tungstenite::Error::AlreadyClosed)
        )
    }
}

/// Tunnel URL with the authorized feature attached as a query parameter.
pub fn tunnel_url(
    config: &TransportConfig,
    session: &SessionDescriptor,
) -> Result<Url, TransportError> {
    let raw = match session.websocket_url.strip_prefix("wss") {
        Some(rest) if config.no_wss => format!("ws{rest}"),
        _ => session.websocket_url.clone(),
    };
    let mut url = Url::parse(&raw).map_err(|source| TransportError::InvalidUrl {
        url: raw.clone(),
        source,
    })?;
    url.query_pairs_mut()
        .append_pair("websocket_feature", &session.authorized_feature);
    Ok(url)
}

pub async fn dial(
    config: &TransportConfig,
    session: &SessionDescriptor,
) -> Result<WsStream, TransportError> {
    let url = tunnel_url(config, session)?;
    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(
        USER_AGENT,
        header_value("User-Agent", &config.identity.user_agent)?,
    );
    headers.insert(
        HeaderName::from_static(CLIENT_METADATA_HEADER),
        header_value(CLIENT_METADATA_HEADER, &config.identity.metadata)?,
    );
    headers.insert(
        HeaderName::from_static(WEBSOCKET_ID_HEADER),
        header_value(WEBSOCKET_ID_HEADER, &session.websocket_id)?,
    );
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    debug!(target = "hooklink::transport", url = %url, "dialing websocket");

    match timeout(config.handshake_timeout, connect_async(request)).await {
        Err(_) => Err(TransportError::HandshakeTimeout(config.handshake_timeout)),
        Ok(Err(tungstenite::Error::Http(response))) => Err(rejection(response)),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok((stream, _))) => Ok(stream),
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name))
}

fn rejection(response: http::Response<Option<Vec<u8>>>) -> TransportError {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        #[serde(default)]
        message: String,
    }

    let message = response
        .body()
        .as_deref()
        .and_then(|body| serde_json::from_slice::<ErrorBody>(body).ok())
        .map(|body| body.error.message)
        .unwrap_or_default();

    TransportError::Rejected {
        status: response.status().as_u16(),
        message,
    }
}
