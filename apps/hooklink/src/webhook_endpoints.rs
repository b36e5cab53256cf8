//! Routes taken from the webhook endpoints configured on the account.

use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::auth::ApiClient;
use crate::forward::Destination;

pub const WEBHOOK_ENDPOINTS_PATH: &str = "/v1/webhook_endpoints";
/// Pinned so the list shape does not depend on the account's default version.
pub const WEBHOOK_ENDPOINTS_API_VERSION: &str = "2019-03-14";
const PAGE_LIMIT: &str = "30";

#[derive(Debug, Error)]
pub enum WebhookEndpointsError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed webhook endpoint list: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebhookEndpoint {
    pub url: String,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub enabled_events: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl WebhookEndpoint {
    pub fn is_enabled(&self) -> bool {
        self.status != "disabled"
    }

    /// Endpoints owned by a platform application receive connect events.
    pub fn is_connect(&self) -> bool {
        self.application.as_deref().is_some_and(|app| !app.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEndpointList {
    #[serde(default)]
    data: Vec<WebhookEndpoint>,
}

pub async fn list_webhook_endpoints(
    api: &ApiClient,
) -> Result<Vec<WebhookEndpoint>, WebhookEndpointsError> {
    let res = api
        .request(Method::GET, WEBHOOK_ENDPOINTS_PATH)
        .query(&[("limit", PAGE_LIMIT)])
        .header("Stripe-Version", WEBHOOK_ENDPOINTS_API_VERSION)
        .send()
        .await?;

    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        return Err(WebhookEndpointsError::UnexpectedStatus { status, body });
    }
    let list: WebhookEndpointList = serde_json::from_str(&body)?;
    Ok(list.data)
}

/// Rebases an endpoint's path onto the local forward target.
pub fn build_forward_url(forward_url: &str, endpoint_url: &str) -> Result<String, url::ParseError> {
    let forward = Url::parse(forward_url)?;
    let endpoint = Url::parse(endpoint_url)?;

    let host = forward.host_str().unwrap_or_default();
    let authority = match forward.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    Ok(format!(
        "{}://{}{}{}",
        forward.scheme(),
        authority,
        forward.path().trim_end_matches('/'),
        endpoint.path()
    ))
}

pub fn build_endpoint_routes(
    endpoints: &[WebhookEndpoint],
    forward_url: &str,
    forward_connect_url: &str,
    forward_headers: &[String],
    forward_connect_headers: &[String],
) -> Vec<Destination> {
    endpoints
        .iter()
        .filter(|endpoint| endpoint.is_enabled())
        .filter_map(|endpoint| {
            let connect = endpoint.is_connect();
            let (base, headers) = if connect {
                (forward_connect_url, forward_connect_headers)
            } else {
                (forward_url, forward_headers)
            };
            match build_forward_url(base, &endpoint.url) {
                Ok(url) => Some(Destination {
                    url,
                    connect,
                    event_destination: false,
                    event_types: endpoint.enabled_events.clone(),
                    headers: headers.to_vec(),
                }),
                Err(err) => {
                    debug!(
                        target = "hooklink::config",
                        endpoint = %endpoint.url,
                        error = %err,
                        "skipping webhook endpoint with unusable url"
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, application: Option<&str>, status: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            url: url.into(),
            application: application.map(Into::into),
            enabled_events: vec!["*".into()],
            status: status.into(),
        }
    }

    #[test]
    fn forward_url_keeps_local_host_and_endpoint_path() {
        assert_eq!(
            build_forward_url("http://localhost:4242", "https://example.com/hooks/stripe").unwrap(),
            "http://localhost:4242/hooks/stripe"
        );
        assert_eq!(
            build_forward_url("http://localhost/api/", "https://example.com/hooks").unwrap(),
            "http://localhost/api/hooks"
        );
    }

    #[test]
    fn routes_split_connect_and_skip_disabled() {
        let endpoints = vec![
            endpoint("https://example.com/account", None, "enabled"),
            endpoint("https://example.com/connect", Some("ca_123"), "enabled"),
            endpoint("https://example.com/old", None, "disabled"),
            endpoint("not a url", None, "enabled"),
        ];
        let routes = build_endpoint_routes(
            &endpoints,
            "http://localhost:4000",
            "http://localhost:5000",
            &["X-A: 1".to_string()],
            &["X-B: 2".to_string()],
        );

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].url, "http://localhost:4000/account");
        assert!(!routes[0].connect);
        assert_eq!(routes[0].headers, ["X-A: 1"]);
        assert_eq!(routes[1].url, "http://localhost:5000/connect");
        assert!(routes[1].connect);
        assert_eq!(routes[1].headers, ["X-B: 2"]);
    }

    #[test]
    fn list_shape_tolerates_missing_fields() {
        let list: WebhookEndpointList =
            serde_json::from_str(r#"{"data":[{"url":"https://e.com/a","application":null}]}"#)
                .unwrap();
        assert_eq!(list.data.len(), 1);
        assert!(!list.data[0].is_connect());
        assert!(list.data[0].is_enabled());
    }
}
