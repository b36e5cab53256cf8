//! Typed observation stream for whatever renders the proxy: the terminal
//! renderer in the binary, or any other consumer holding the receiver.

use tokio::sync::mpsc;
use tracing::trace;

use crate::forward::event::{StripeEvent, ThinEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Loading,
    Connected,
    Reconnecting,
    Ready,
    Done,
}

/// An event that was received and passed the global filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub webhook_id: String,
    pub event: StripeEvent,
    /// Raw payload, for consumers printing full JSON.
    pub payload: String,
}

/// A thin event that passed the thin event filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinEventRecord {
    pub event_destination_id: String,
    pub event: ThinEvent,
    pub payload: String,
}

/// A destination answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub webhook_id: String,
    pub event_id: String,
    pub event_type: String,
    pub forward_url: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    State {
        state: ConnectionState,
        data: Option<String>,
    },
    Event(EventRecord),
    ThinEvent(ThinEventRecord),
    Response(ResponseRecord),
    Error(String),
    Warning(String),
}

/// Cloneable, never-blocking sender side of the observation stream.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ProxyEvent) {
        if self.tx.send(event).is_err() {
            trace!(target = "hooklink::output", "output receiver dropped");
        }
    }

    pub fn state(&self, state: ConnectionState, data: Option<String>) {
        self.emit(ProxyEvent::State { state, data });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProxyEvent::Error(message.into()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(ProxyEvent::Warning(message.into()));
    }
}
