use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tunnel_proto::de::null_as_default;

const DASHBOARD_BASE: &str = "https://dashboard.stripe.com";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event payload is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event request field has unexpected shape: {0}")]
    UnexpectedRequest(String),
}

/// The API request that triggered an event, when there was one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub idempotency_key: String,
}

/// The few event fields the proxy needs for routing and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub account: String,
    pub livemode: bool,
    pub created: i64,
    pub request: RequestData,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    event_type: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    livemode: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    created: i64,
    #[serde(default)]
    request: Value,
}

impl StripeEvent {
    pub fn parse(payload: &str) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_str(payload)?;
        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            account: raw.account.unwrap_or_default(),
            livemode: raw.livemode,
            created: raw.created,
            request: extract_request(raw.request)?,
        })
    }

    pub fn is_connect(&self) -> bool {
        !self.account.is_empty()
    }

    pub fn dashboard_url(&self) -> String {
        format!("{}/events/{}", self.dashboard_base(), self.id)
    }

    fn dashboard_base(&self) -> String {
        let mut base = DASHBOARD_BASE.to_owned();
        if self.is_connect() {
            base.push('/');
            base.push_str(&self.account);
        }
        if !self.livemode {
            base.push_str("/test");
        }
        base
    }
}

/// Older API versions send the request id as a bare string; newer ones send
/// an object.
fn extract_request(value: Value) -> Result<RequestData, EventError> {
    match value {
        Value::Null => Ok(RequestData::default()),
        Value::String(id) => Ok(RequestData {
            id,
            idempotency_key: String::new(),
        }),
        object @ Value::Object(_) => Ok(serde_json::from_value(object)?),
        other => Err(EventError::UnexpectedRequest(other.to_string())),
    }
}

/// The object a thin event points at. Consumers fetch it themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedObject {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub object_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
}

/// A thin event delivered to an event destination. Unlike [`StripeEvent`]
/// it carries no snapshot, only a reference to what changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub event_type: String,
    /// RFC 3339 timestamp, kept as sent.
    #[serde(default, deserialize_with = "null_as_default")]
    pub created: String,
    /// The connected account the event belongs to; empty for the platform.
    #[serde(default, deserialize_with = "null_as_default")]
    pub context: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub related_object: RelatedObject,
}

impl ThinEvent {
    pub fn parse(payload: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn is_connect(&self) -> bool {
        !self.context.is_empty()
    }

    pub fn dashboard_url(&self, destination_id: &str) -> String {
        format!(
            "{DASHBOARD_BASE}/workbench/webhooks/{destination_id}?event={}",
            self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_event() {
        let event = StripeEvent::parse(r#"{"id":"evt_1","type":"charge.succeeded"}"#).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "charge.succeeded");
        assert!(!event.is_connect());
        assert_eq!(event.request, RequestData::default());
    }

    #[test]
    fn request_as_string_or_object() {
        let event = StripeEvent::parse(r#"{"id":"evt_1","type":"a","request":"req_123"}"#).unwrap();
        assert_eq!(event.request.id, "req_123");

        let event = StripeEvent::parse(
            r#"{"id":"evt_1","type":"a","request":{"id":"req_456","idempotency_key":"idem"}}"#,
        )
        .unwrap();
        assert_eq!(event.request.id, "req_456");
        assert_eq!(event.request.idempotency_key, "idem");
    }

    #[test]
    fn request_of_other_shape_is_rejected() {
        let err = StripeEvent::parse(r#"{"id":"evt_1","type":"a","request":42}"#).unwrap_err();
        assert!(matches!(err, EventError::UnexpectedRequest(_)));
    }

    #[test]
    fn account_marks_connect_event() {
        let event =
            StripeEvent::parse(r#"{"id":"evt_1","type":"a","account":"acct_9","livemode":true}"#)
                .unwrap();
        assert!(event.is_connect());
        assert_eq!(
            event.dashboard_url(),
            "https://dashboard.stripe.com/acct_9/events/evt_1"
        );
    }

    #[test]
    fn test_mode_dashboard_link() {
        let event = StripeEvent::parse(r#"{"id":"evt_2","type":"a"}"#).unwrap();
        assert_eq!(
            event.dashboard_url(),
            "https://dashboard.stripe.com/test/events/evt_2"
        );
    }

    #[test]
    fn null_fields_read_as_unset() {
        let event = StripeEvent::parse(
            r#"{"id":"evt_1","type":"charge.succeeded","account":null,"request":{"id":null,"idempotency_key":null}}"#,
        )
        .unwrap();
        assert_eq!(event.id, "evt_1");
        assert!(!event.is_connect());
        assert_eq!(event.request, RequestData::default());

        let event = StripeEvent::parse(
            r#"{"id":"evt_2","type":"a","livemode":null,"created":null,"request":null}"#,
        )
        .unwrap();
        assert!(!event.livemode);
        assert_eq!(event.created, 0);
    }

    #[test]
    fn thin_event_reads_context_and_related_object() {
        let event = ThinEvent::parse(
            r#"{"id":"evt_t1","object":"v2.core.event","type":"v1.billing.meter.no_meter_found","created":"2024-09-01T00:00:00.000Z","context":"acct_7","related_object":{"id":"mtr_1","type":"billing.meter","url":"/v1/billing/meters/mtr_1"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "v1.billing.meter.no_meter_found");
        assert!(event.is_connect());
        assert_eq!(event.related_object.object_type, "billing.meter");
        assert_eq!(
            event.dashboard_url("ed_1"),
            "https://dashboard.stripe.com/workbench/webhooks/ed_1?event=evt_t1"
        );

        let bare =
            ThinEvent::parse(r#"{"id":"evt_t2","type":"a","context":null,"related_object":null}"#)
                .unwrap();
        assert!(!bare.is_connect());
        assert_eq!(bare.related_object, RelatedObject::default());
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            StripeEvent::parse("{not json"),
            Err(EventError::Malformed(_))
        ));
    }
}
