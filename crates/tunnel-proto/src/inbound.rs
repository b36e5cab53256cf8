use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::de::null_as_default;

pub const WEBHOOK_EVENT: &str = "webhook_event";
pub const REQUEST_LOG_EVENT: &str = "request_log_event";
pub const V2_EVENT: &str = "v2_event";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
}

/// Properties of the synthetic endpoint the backend rendered the event for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub webhook_id: String,
    pub webhook_conversation_id: String,
    /// The event body as the backend would have POSTed it. Itself JSON.
    pub event_payload: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub endpoint: EndpointInfo,
}

/// A thin event addressed to an event destination rather than a webhook
/// endpoint. The payload only references the changed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2Event {
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_destination_id: String,
    /// The thin event body. Itself JSON.
    pub payload: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub http_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogEvent {
    pub request_log_id: String,
    pub event_payload: String,
}

/// A frame whose `type` this client does not understand. Kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage {
    pub message_type: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    WebhookEvent(WebhookEvent),
    V2Event(V2Event),
    RequestLogEvent(RequestLogEvent),
    Unknown(UnknownMessage),
}

impl InboundMessage {
    /// Parses one text frame. Unrecognised `type` values are not an error.
    pub fn parse(frame: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(frame)?;
        if !value.is_object() {
            return Err(FrameError::NotAnObject);
        }

        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match message_type.as_str() {
            WEBHOOK_EVENT => Ok(Self::WebhookEvent(serde_json::from_value(value)?)),
            V2_EVENT => Ok(Self::V2Event(serde_json::from_value(value)?)),
            REQUEST_LOG_EVENT => Ok(Self::RequestLogEvent(serde_json::from_value(value)?)),
            _ => Ok(Self::Unknown(UnknownMessage {
                message_type,
                raw: frame.to_owned(),
            })),
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            Self::WebhookEvent(_) => WEBHOOK_EVENT,
            Self::V2Event(_) => V2_EVENT,
            Self::RequestLogEvent(_) => REQUEST_LOG_EVENT,
            Self::Unknown(unknown) => &unknown.message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout(5)]
    fn parses_webhook_event_frame() {
        let frame = r#"{"type":"webhook_event","webhook_id":"wh_1","webhook_conversation_id":"wc_1","event_payload":"{\"id\":\"evt_1\",\"type\":\"charge.succeeded\"}","http_headers":{"Stripe-Signature":"t=1"},"endpoint":{"api_version":null}}"#;

        let InboundMessage::WebhookEvent(event) = InboundMessage::parse(frame).unwrap() else {
            panic!("expected webhook event");
        };
        assert_eq!(event.webhook_id, "wh_1");
        assert_eq!(event.webhook_conversation_id, "wc_1");
        assert_eq!(event.endpoint.api_version, None);
        assert_eq!(
            event.http_headers.get("Stripe-Signature").map(String::as_str),
            Some("t=1")
        );
    }

    #[test_timeout::timeout(5)]
    fn missing_headers_and_endpoint_default() {
        let frame = r#"{"type":"webhook_event","webhook_id":"wh_2","webhook_conversation_id":"wc_2","event_payload":"{}"}"#;
        let InboundMessage::WebhookEvent(event) = InboundMessage::parse(frame).unwrap() else {
            panic!("expected webhook event");
        };
        assert!(event.http_headers.is_empty());
        assert_eq!(event.endpoint, EndpointInfo::default());
    }

    #[test_timeout::timeout(5)]
    fn null_headers_and_endpoint_default() {
        let frame = r#"{"type":"webhook_event","webhook_id":"wh_3","webhook_conversation_id":"wc_3","event_payload":"{}","http_headers":null,"endpoint":null}"#;
        let InboundMessage::WebhookEvent(event) = InboundMessage::parse(frame).unwrap() else {
            panic!("expected webhook event");
        };
        assert!(event.http_headers.is_empty());
        assert_eq!(event.endpoint, EndpointInfo::default());
    }

    #[test_timeout::timeout(5)]
    fn parses_v2_event_frame() {
        let frame = r#"{"type":"v2_event","event_destination_id":"ed_1","payload":"foo","http_headers":{"Request-Header":"bar"}}"#;
        let message = InboundMessage::parse(frame).unwrap();
        assert_eq!(message.message_type(), V2_EVENT);
        let InboundMessage::V2Event(event) = message else {
            panic!("expected v2 event");
        };
        assert_eq!(event.event_destination_id, "ed_1");
        assert_eq!(event.payload, "foo");
        assert_eq!(
            event.http_headers.get("Request-Header").map(String::as_str),
            Some("bar")
        );

        let bare = r#"{"type":"v2_event","payload":"{}","http_headers":null}"#;
        let InboundMessage::V2Event(event) = InboundMessage::parse(bare).unwrap() else {
            panic!("expected v2 event");
        };
        assert_eq!(event.event_destination_id, "");
        assert!(event.http_headers.is_empty());
    }

    #[test_timeout::timeout(5)]
    fn request_log_event_is_recognised() {
        let frame = r#"{"type":"request_log_event","request_log_id":"req_1","event_payload":"{}"}"#;
        let message = InboundMessage::parse(frame).unwrap();
        assert_eq!(message.message_type(), REQUEST_LOG_EVENT);
    }

    #[test_timeout::timeout(5)]
    fn unknown_type_is_preserved() {
        let frame = r#"{"type":"server_notice","text":"maintenance at noon"}"#;
        let message = InboundMessage::parse(frame).unwrap();
        assert_eq!(
            message,
            InboundMessage::Unknown(UnknownMessage {
                message_type: "server_notice".into(),
                raw: frame.into(),
            })
        );
    }

    #[test_timeout::timeout(5)]
    fn frame_without_type_is_unknown() {
        let message = InboundMessage::parse(r#"{"hello":"world"}"#).unwrap();
        assert_eq!(message.message_type(), "");
    }

    #[test_timeout::timeout(5)]
    fn garbage_is_rejected() {
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse("[1,2]"),
            Err(FrameError::NotAnObject)
        ));
    }

    #[test_timeout::timeout(5)]
    fn webhook_event_missing_ids_is_malformed() {
        let frame = r#"{"type":"webhook_event","event_payload":"{}"}"#;
        assert!(InboundMessage::parse(frame).is_err());
    }
}
