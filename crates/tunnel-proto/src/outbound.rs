use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    pub event_id: String,
    pub webhook_conversation_id: String,
    /// Set only when acknowledging a thin event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_destination_id: Option<String>,
}

/// The local destination's answer, relayed back so the backend can show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub webhook_id: String,
    pub webhook_conversation_id: String,
    pub forward_url: String,
    pub status: u16,
    pub body: String,
    pub http_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    EventAck(EventAck),
    WebhookResponse(WebhookResponse),
}

impl OutboundMessage {
    pub fn event_ack(event_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self::EventAck(EventAck {
            event_id: event_id.into(),
            webhook_conversation_id: conversation_id.into(),
            event_destination_id: None,
        })
    }

    /// Acknowledges a thin event. Thin events have no conversation.
    pub fn thin_event_ack(event_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self::EventAck(EventAck {
            event_id: event_id.into(),
            webhook_conversation_id: String::new(),
            event_destination_id: Some(destination_id.into()),
        })
    }

    pub fn webhook_conversation_id(&self) -> &str {
        match self {
            Self::EventAck(ack) => &ack.webhook_conversation_id,
            Self::WebhookResponse(response) => &response.webhook_conversation_id,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
