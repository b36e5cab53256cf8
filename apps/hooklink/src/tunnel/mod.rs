//! The logical tunnel session, which outlives any single connection.
//!
//! One task owns the state machine: it dials, runs a [`Connection`] until it
//! fails, gets reset or the tunnel is cancelled, and dials again. Only that
//! task ever holds the current connection, and the outbound queue moves from
//! one connection to the next, so a stale connection can never write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnel_proto::{InboundMessage, OutboundMessage};

use crate::auth::{AuthError, SessionDescriptor};
use crate::transport::{self, CloseCode, Connection, Outbox, TransportConfig, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum TunnelEvent {
    State(TunnelState),
    /// A session descriptor was adopted, initially or after re-authorization.
    Session(Arc<SessionDescriptor>),
    Message(InboundMessage),
    /// The initial authorization failed; the tunnel is closing.
    Fatal(AuthError),
}

/// Supplies session descriptors to the tunnel.
#[async_trait]
pub trait SessionSource: Send + Sync + 'static {
    /// First session. An error here is fatal for the tunnel.
    async fn initial(&self, cancel: &CancellationToken) -> Result<SessionDescriptor, AuthError>;

    /// Called after a failed dial. `Ok(None)` keeps the current session.
    async fn refresh(
        &self,
        cancel: &CancellationToken,
        last_error: Option<&TransportError>,
    ) -> Result<Option<SessionDescriptor>, AuthError>;
}

/// Anything that accepts outbound messages without blocking.
pub trait OutboundSink: Send + Sync + 'static {
    fn send_message(&self, message: OutboundMessage);
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Pause between failed dial attempts.
    pub connect_attempt_wait: Duration,
    /// Connection lifetime when the session carries no reconnect hint.
    pub reconnect_interval: Duration,
    pub inbound_buffer: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_attempt_wait: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(60),
            inbound_buffer: 64,
        }
    }
}

/// Cloneable handle for enqueueing outbound messages.
#[derive(Debug, Clone)]
pub struct TunnelSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl OutboundSink for TunnelSender {
    fn send_message(&self, message: OutboundMessage) {
        if let Err(err) = self.tx.send(message) {
            debug!(
                target = "hooklink::tunnel",
                webhook_conversation_id = %err.0.webhook_conversation_id(),
                "tunnel closed; dropping outbound message"
            );
        }
    }
}

pub struct TunnelHandle {
    sender: TunnelSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Queues a message for the current or next connection. Never blocks.
    pub fn send_message(&self, message: OutboundMessage) {
        self.sender.send_message(message);
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!(target = "hooklink::tunnel", error = %err, "tunnel task panicked");
        }
    }
}

enum Exit {
    Stop,
    Dropped,
    Reset,
}

pub struct TunnelClient<S> {
    config: TunnelConfig,
    transport: TransportConfig,
    source: S,
    cancel: CancellationToken,
    events: mpsc::Sender<TunnelEvent>,
}

impl<S: SessionSource> TunnelClient<S> {
    /// Starts the tunnel task. The returned receiver closes once the tunnel
    /// reaches [`TunnelState::Closed`].
    pub fn spawn(
        config: TunnelConfig,
        transport: TransportConfig,
        source: S,
        cancel: CancellationToken,
    ) -> (TunnelHandle, mpsc::Receiver<TunnelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let client = Self {
            config,
            transport,
            source,
            cancel: cancel.clone(),
            events: events_tx,
        };
        let task = tokio::spawn(client.run(Outbox::new(outbound_rx)));

        let handle = TunnelHandle {
            sender: TunnelSender { tx: outbound_tx },
            cancel,
            task,
        };
        (handle, events_rx)
    }

    async fn run(self, outbox: Outbox) {
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            session = self.source.initial(&self.cancel) => match session {
                Ok(session) => Some(session),
                Err(err) => {
                    error!(target = "hooklink::tunnel", error = %err, "initial authorization failed");
                    self.deliver(TunnelEvent::Fatal(err)).await;
                    None
                }
            },
        };

        if let Some(session) = session {
            self.drive(session, outbox).await;
        }

        self.notify(TunnelState::Closed).await;
        debug!(target = "hooklink::tunnel", "tunnel closed");
    }

    async fn drive(&self, session: SessionDescriptor, mut outbox: Outbox) {
        let mut session = Arc::new(session);
        self.deliver(TunnelEvent::Session(Arc::clone(&session))).await;

        let mut generation: u64 = 0;
        let mut reconnecting = false;

        loop {
            self.notify(TunnelState::Connecting).await;
            let Some(ws) = self.connect(&mut session, &mut reconnecting).await else {
                break;
            };

            generation += 1;
            let (connection, mut inbound) = Connection::start(
                ws,
                generation,
                &self.transport,
                outbox,
                &self.cancel,
                self.config.inbound_buffer,
            );
            reconnecting = false;
            info!(target = "hooklink::tunnel", generation, "tunnel connected");
            self.notify(TunnelState::Connected).await;

            let lifetime = session
                .reconnect_delay
                .unwrap_or(self.config.reconnect_interval);
            let reset = sleep(lifetime);
            tokio::pin!(reset);

            let exit = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break Exit::Stop,
                    message = inbound.recv() => match message {
                        Some(message) => {
                            if !self.deliver(TunnelEvent::Message(message)).await {
                                break Exit::Stop;
                            }
                        }
                        None => break Exit::Dropped,
                    },
                    _ = connection.stopped() => break Exit::Dropped,
                    _ = &mut reset => break Exit::Reset,
                }
            };

            let (code, reason) = match exit {
                Exit::Stop => {
                    self.notify(TunnelState::Closing).await;
                    (CloseCode::Normal, "Connection Done")
                }
                Exit::Dropped => (CloseCode::Away, "Server closed the connection"),
                Exit::Reset => (CloseCode::Normal, "Resetting the connection"),
            };
            let closed = connection.close(code, reason).await;
            let Some(returned) = closed.outbox else {
                error!(target = "hooklink::tunnel", generation, "outbound queue lost; stopping tunnel");
                break;
            };
            if returned.has_unsent() {
                debug!(target = "hooklink::tunnel", generation, "requeued an unsent message");
            }
            outbox = returned;

            match exit {
                Exit::Stop => break,
                Exit::Dropped => {
                    match &closed.error {
                        Some(err) => warn!(target = "hooklink::tunnel", generation, error = %err, "disconnected; reconnecting"),
                        None => warn!(target = "hooklink::tunnel", generation, "disconnected; reconnecting"),
                    }
                    reconnecting = true;
                    self.notify(TunnelState::Reconnecting).await;
                }
                Exit::Reset => {
                    debug!(target = "hooklink::tunnel", generation, ?lifetime, "resetting the connection");
                }
            }
        }
    }

    /// Dials until a connection is up. `None` means the tunnel was cancelled.
    async fn connect(
        &self,
        session: &mut Arc<SessionDescriptor>,
        reconnecting: &mut bool,
    ) -> Option<transport::WsStream> {
        loop {
            let dialed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                dialed = transport::dial(&self.transport, session) => dialed,
            };
            let err = match dialed {
                Ok(ws) => return Some(ws),
                Err(err) => err,
            };

            warn!(
                target = "hooklink::tunnel",
                error = %err,
                session_expired = err.is_session_expired(),
                "failed to connect; retrying"
            );
            if !*reconnecting {
                *reconnecting = true;
                self.notify(TunnelState::Reconnecting).await;
            }

            let refreshed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                refreshed = self.source.refresh(&self.cancel, Some(&err)) => refreshed,
            };
            match refreshed {
                Ok(Some(next)) => {
                    *session = Arc::new(next);
                    self.deliver(TunnelEvent::Session(Arc::clone(session))).await;
                }
                Ok(None) => {}
                Err(auth_err) => warn!(
                    target = "hooklink::tunnel",
                    error = %auth_err,
                    "re-authorization failed; keeping current session"
                ),
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = sleep(self.config.connect_attempt_wait) => {}
            }
        }
    }

    /// Hands an event to the consumer. Returns false if the consumer is gone
    /// or the tunnel was cancelled while waiting for room.
    async fn deliver(&self, event: TunnelEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// State changes wait for room like any other event, except once the
    /// tunnel is cancelled, when they are best effort.
    async fn notify(&self, state: TunnelState) {
        if !self.cancel.is_cancelled() && self.deliver(TunnelEvent::State(state)).await {
            return;
        }
        if let Err(err) = self.events.try_send(TunnelEvent::State(state)) {
            debug!(
                target = "hooklink::tunnel",
                ?state,
                error = %err,
                "state notification dropped"
            );
        }
    }
}
