//! Wire schema for the webhook tunnel.
//!
//! Frames travel as JSON text messages over the websocket. Inbound frames are
//! discriminated by their `type` field; outbound frames carry the same tag so
//! the backend can route acks and forwarded responses.

pub mod de;
mod inbound;
mod outbound;
mod session;
mod truncate;

pub use inbound::{
    EndpointInfo, FrameError, InboundMessage, RequestLogEvent, UnknownMessage, V2Event,
    WebhookEvent, REQUEST_LOG_EVENT, V2_EVENT, WEBHOOK_EVENT,
};
pub use outbound::{EventAck, OutboundMessage, WebhookResponse};
pub use session::{SessionResponse, SESSION_EXPIRED_MESSAGE};
pub use truncate::{
    truncate, MAX_BODY_SIZE, MAX_HEADER_KEY_SIZE, MAX_HEADER_VALUE_SIZE, MAX_NUM_HEADERS,
};
