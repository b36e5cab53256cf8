//! Session authorization against the backend's REST API.
//!
//! One POST yields a short-lived [`SessionDescriptor`]: the tunnel URL, the
//! websocket id to present on upgrade and the webhook signing secret. The
//! call is safe to repeat; the tunnel re-authorizes whenever its session
//! expires.

use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder};
use thiserror::Error;
use tracing::debug;
use tunnel_proto::SessionResponse;

use crate::client_info::ClientIdentity;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";
pub const SESSIONS_PATH: &str = "/v1/stripecli/sessions";
pub const CLIENT_METADATA_HEADER: &str = "X-Stripe-Client-User-Agent";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authorization failed: status={status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed authorization response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    #[error("authorization cancelled")]
    Cancelled,
}

/// Authenticated access to the backend REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    identity: ClientIdentity,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        identity: ClientIdentity,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            identity,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(header::USER_AGENT, &self.identity.user_agent)
            .header(CLIENT_METADATA_HEADER, &self.identity.metadata)
    }
}

/// Immutable result of one authorization. A new one supersedes the old after
/// re-authorization; nothing mutates it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub websocket_url: String,
    pub websocket_id: String,
    pub authorized_feature: String,
    pub secret: String,
    pub reconnect_delay: Option<Duration>,
    pub default_version: String,
    pub latest_version: String,
    pub connect_filter_warning: bool,
}

impl From<SessionResponse> for SessionDescriptor {
    fn from(response: SessionResponse) -> Self {
        Self {
            websocket_url: response.websocket_url,
            websocket_id: response.websocket_id,
            authorized_feature: response.websocket_authorized_feature,
            secret: response.secret,
            reconnect_delay: (response.reconnect_delay > 0)
                .then(|| Duration::from_secs(response.reconnect_delay)),
            default_version: response.default_version,
            latest_version: response.latest_version,
            connect_filter_warning: response.display_connect_filter_warning,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub device_name: String,
    pub websocket_features: Vec<String>,
    /// JSON-encoded subscription filters.
    pub filters: Option<String>,
    pub forward_url: Option<String>,
    pub forward_connect_url: Option<String>,
}

impl AuthorizeRequest {
    fn form(&self) -> Vec<(&'static str, &str)> {
        let mut form = vec![("device_name", self.device_name.as_str())];
        for feature in &self.websocket_features {
            form.push(("websocket_features[]", feature.as_str()));
        }
        if let Some(filters) = self.filters.as_deref() {
            form.push(("filters", filters));
        }
        if let Some(url) = self.forward_url.as_deref().filter(|url| !url.is_empty()) {
            form.push(("forward_to_url", url));
        }
        if let Some(url) = self
            .forward_connect_url
            .as_deref()
            .filter(|url| !url.is_empty())
        {
            form.push(("forward_connect_to_url", url));
        }
        form
    }
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    api: ApiClient,
}

impl Authorizer {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Performs a single authorization exchange. Retrying is the caller's job.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<SessionDescriptor, AuthError> {
        debug!(
            target = "hooklink::auth",
            device_name = %request.device_name,
            "authorizing tunnel session"
        );

        let res = self
            .api
            .request(Method::POST, SESSIONS_PATH)
            .form(&request.form())
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(AuthError::UnexpectedStatus { status, body });
        }

        let session: SessionResponse = serde_json::from_str(&body)?;
        debug!(
            target = "hooklink::auth",
            websocket_url = %session.websocket_url,
            websocket_id = %session.websocket_id,
            feature = %session.websocket_authorized_feature,
            reconnect_delay = session.reconnect_delay,
            "session authorized"
        );
        Ok(session.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_skips_absent_hints() {
        let request = AuthorizeRequest {
            device_name: "laptop".into(),
            websocket_features: vec!["webhooks".into()],
            filters: None,
            forward_url: Some(String::new()),
            forward_connect_url: Some("http://localhost:4000".into()),
        };
        assert_eq!(
            request.form(),
            vec![
                ("device_name", "laptop"),
                ("websocket_features[]", "webhooks"),
                ("forward_connect_to_url", "http://localhost:4000"),
            ]
        );
    }

    #[test]
    fn zero_reconnect_delay_means_no_hint() {
        let response = SessionResponse {
            reconnect_delay: 0,
            secret: "whsec_x".into(),
            websocket_id: "wid1".into(),
            websocket_url: "wss://example.test/subscribe".into(),
            websocket_authorized_feature: "webhooks".into(),
            display_connect_filter_warning: false,
            default_version: String::new(),
            latest_version: String::new(),
        };
        let descriptor = SessionDescriptor::from(response.clone());
        assert_eq!(descriptor.reconnect_delay, None);

        let descriptor = SessionDescriptor::from(SessionResponse {
            reconnect_delay: 45,
            ..response
        });
        assert_eq!(descriptor.reconnect_delay, Some(Duration::from_secs(45)));
    }
}
