//! Delivery of tunnelled webhook events to local HTTP destinations.

pub mod endpoint;
pub mod event;
pub mod processor;
pub mod registry;

use std::collections::BTreeMap;

use thiserror::Error;

pub use endpoint::{EndpointClient, EndpointResponse};
pub use event::{StripeEvent, ThinEvent};
pub use processor::{ProcessorConfig, WebhookEventProcessor};
pub use registry::{Destination, DestinationRegistry, HttpOptions};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid header {name:?} for {url}")]
    InvalidHeader { url: String, name: String },
    #[error("failed to POST to {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read response from {url}: {source}")]
    ReadBody {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Correlates one forwarding attempt with the tunnel message it came from.
/// For thin events `webhook_id` holds the event destination id and the
/// conversation id is empty.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub webhook_id: String,
    pub webhook_conversation_id: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub http_headers: BTreeMap<String, String>,
}
