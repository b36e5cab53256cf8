use serde::{Deserialize, Serialize};

/// Error message the backend returns on upgrade when the websocket id it
/// issued has expired.
pub const SESSION_EXPIRED_MESSAGE: &str = "Unknown WebSocket ID.";

/// Body of a successful session authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Seconds until the client should recycle its connection. Zero when
    /// the backend gives no hint.
    #[serde(default)]
    pub reconnect_delay: u64,
    pub secret: String,
    pub websocket_id: String,
    pub websocket_url: String,
    pub websocket_authorized_feature: String,
    #[serde(default)]
    pub display_connect_filter_warning: bool,
    #[serde(default)]
    pub default_version: String,
    #[serde(default)]
    pub latest_version: String,
}
