//! Proxy configuration, independent of how it was collected.

use thiserror::Error;
use url::Url;

use crate::auth::{ApiClient, AuthorizeRequest};
use crate::forward::processor::DEFAULT_MAX_FORWARD_CONCURRENCY;
use crate::forward::{Destination, HttpOptions, ProcessorConfig};
use crate::transport::TransportConfig;
use crate::tunnel::TunnelConfig;

pub const WEBHOOKS_FEATURE: &str = "webhooks";

/// Thin event types the backend can deliver, plus the wildcard.
pub const KNOWN_THIN_EVENTS: &[&str] = &[
    "*",
    "v1.billing.meter.error_report_triggered",
    "v1.billing.meter.no_meter_found",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--forward-to cannot be a relative path when loading webhook endpoints from the API")]
    RelativeForwardUrl,
    #[error(
        "--forward-connect-to cannot be a relative path when loading webhook endpoints from the API"
    )]
    RelativeForwardConnectUrl,
    #[error("--load-from-webhooks-api requires a location to forward to with --forward-to")]
    MissingForwardUrl,
    #[error("invalid forward url {url}: {source}")]
    InvalidForwardUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no webhook endpoints are defined on this account")]
    NoWebhookEndpoints,
    #[error("max forward concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("filters must be valid json: {0}")]
    InvalidFilters(#[source] serde_json::Error),
    #[error("unknown thin event type {0:?}")]
    UnknownThinEvent(String),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub api: ApiClient,
    pub device_name: String,
    pub websocket_feature: String,
    /// Event types to receive; `*` for all.
    pub events: Vec<String>,
    pub forward_url: Option<String>,
    pub forward_headers: Vec<String>,
    /// Falls back to `forward_url` when unset.
    pub forward_connect_url: Option<String>,
    /// Falls back to `forward_headers` when empty.
    pub forward_connect_headers: Vec<String>,
    /// Event destination receiving thin events for the platform account.
    pub forward_thin_url: Option<String>,
    /// Falls back to `forward_thin_url` when unset.
    pub forward_thin_connect_url: Option<String>,
    /// Thin event types to relay; `*` for all.
    pub thin_events: Vec<String>,
    pub load_from_webhooks_api: bool,
    pub use_latest_api_version: bool,
    /// JSON-encoded subscription filters passed through to authorization.
    pub filters: Option<String>,
    pub http: HttpOptions,
    pub max_forward_concurrency: usize,
    pub tunnel: TunnelConfig,
    pub transport: TransportConfig,
}

impl ProxyConfig {
    pub fn new(api: ApiClient, device_name: impl Into<String>) -> Self {
        let transport = TransportConfig {
            identity: api.identity().clone(),
            ..TransportConfig::default()
        };
        Self {
            api,
            device_name: device_name.into(),
            websocket_feature: WEBHOOKS_FEATURE.to_owned(),
            events: vec!["*".to_owned()],
            forward_url: None,
            forward_headers: Vec::new(),
            forward_connect_url: None,
            forward_connect_headers: Vec::new(),
            forward_thin_url: None,
            forward_thin_connect_url: None,
            thin_events: vec!["*".to_owned()],
            load_from_webhooks_api: false,
            use_latest_api_version: false,
            filters: None,
            http: HttpOptions::default(),
            max_forward_concurrency: DEFAULT_MAX_FORWARD_CONCURRENCY,
            tunnel: TunnelConfig::default(),
            transport,
        }
    }

    /// Checks that forward targets and filters are consistent before anything
    /// touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_forward_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if let Some(filters) = &self.filters {
            serde_json::from_str::<serde_json::Value>(filters)
                .map_err(ConfigError::InvalidFilters)?;
        }

        if self.load_from_webhooks_api {
            let forward = self
                .forward_url
                .as_deref()
                .filter(|url| !url.is_empty())
                .ok_or(ConfigError::MissingForwardUrl)?;
            if forward.starts_with('/') {
                return Err(ConfigError::RelativeForwardUrl);
            }
            if self.raw_forward_connect_url().is_some_and(|url| url.starts_with('/')) {
                return Err(ConfigError::RelativeForwardConnectUrl);
            }
        }

        if let Some(unknown) = self
            .thin_events
            .iter()
            .find(|event| !KNOWN_THIN_EVENTS.contains(&event.as_str()))
        {
            return Err(ConfigError::UnknownThinEvent(unknown.clone()));
        }

        for url in [
            self.resolved_forward_url(),
            self.resolved_forward_connect_url(),
            self.resolved_forward_thin_url(),
            self.resolved_forward_thin_connect_url(),
        ]
        .into_iter()
        .flatten()
        {
            Url::parse(&url).map_err(|source| ConfigError::InvalidForwardUrl { url, source })?;
        }
        Ok(())
    }

    pub fn resolved_forward_url(&self) -> Option<String> {
        self.forward_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(normalize_forward_url)
    }

    pub fn resolved_forward_connect_url(&self) -> Option<String> {
        self.raw_forward_connect_url().map(normalize_forward_url)
    }

    pub fn resolved_forward_thin_url(&self) -> Option<String> {
        non_empty(&self.forward_thin_url).map(normalize_forward_url)
    }

    pub fn resolved_forward_thin_connect_url(&self) -> Option<String> {
        non_empty(&self.forward_thin_connect_url)
            .or_else(|| non_empty(&self.forward_thin_url))
            .map(normalize_forward_url)
    }

    pub fn resolved_forward_connect_headers(&self) -> &[String] {
        if self.forward_connect_headers.is_empty() {
            &self.forward_headers
        } else {
            &self.forward_connect_headers
        }
    }

    /// Destinations given directly by the forward flags.
    pub fn static_destinations(&self) -> Vec<Destination> {
        let mut destinations = Vec::new();
        if let Some(url) = self.resolved_forward_url() {
            destinations.push(Destination {
                url,
                connect: false,
                event_destination: false,
                event_types: self.events(),
                headers: self.forward_headers.clone(),
            });
        }
        if let Some(url) = self.resolved_forward_connect_url() {
            destinations.push(Destination {
                url,
                connect: true,
                event_destination: false,
                event_types: self.events(),
                headers: self.resolved_forward_connect_headers().to_vec(),
            });
        }
        destinations
    }

    /// Event destinations given by the thin forward flags. These apply in
    /// both routing modes since webhook endpoints never receive thin events.
    pub fn thin_destinations(&self) -> Vec<Destination> {
        let scopes = [
            (self.resolved_forward_thin_url(), false, &self.forward_headers[..]),
            (
                self.resolved_forward_thin_connect_url(),
                true,
                self.resolved_forward_connect_headers(),
            ),
        ];
        scopes
            .into_iter()
            .filter_map(|(url, connect, headers)| {
                Some(Destination {
                    url: url?,
                    connect,
                    event_destination: true,
                    event_types: self.thin_events(),
                    headers: headers.to_vec(),
                })
            })
            .collect()
    }

    pub fn authorize_request(&self) -> AuthorizeRequest {
        AuthorizeRequest {
            device_name: self.device_name.clone(),
            websocket_features: vec![self.websocket_feature.clone()],
            filters: self.filters.clone(),
            forward_url: self.resolved_forward_url(),
            forward_connect_url: self.resolved_forward_connect_url(),
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            events: self.events(),
            thin_events: self.thin_events(),
            use_latest_api_version: self.use_latest_api_version,
            max_forward_concurrency: self.max_forward_concurrency,
        }
    }

    fn events(&self) -> Vec<String> {
        if self.events.is_empty() {
            vec!["*".to_owned()]
        } else {
            self.events.clone()
        }
    }

    fn thin_events(&self) -> Vec<String> {
        if self.thin_events.is_empty() {
            vec!["*".to_owned()]
        } else {
            self.thin_events.clone()
        }
    }

    fn raw_forward_connect_url(&self) -> Option<&str> {
        self.forward_connect_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .or_else(|| self.forward_url.as_deref().filter(|url| !url.is_empty()))
    }
}

fn non_empty(url: &Option<String>) -> Option<&str> {
    url.as_deref().filter(|url| !url.is_empty())
}

/// Completes a possibly partial forward target: a bare port or a bare path
/// means localhost, and a missing scheme means plain http.
pub fn normalize_forward_url(raw: &str) -> String {
    let mut url = raw.trim().to_owned();
    if url.parse::<u16>().is_ok() {
        url = format!("localhost:{url}");
    }
    if url.starts_with('/') {
        url = format!("localhost{url}");
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("http://{url}");
    }
    url
}
