use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};
use tunnel_proto::{InboundMessage, OutboundMessage};

use super::{CloseCode, TransportConfig, TransportError, WsStream};

/// Outbound queue plus the one message whose write failed, if any. Moves into
/// the write pump of each connection in turn.
#[derive(Debug)]
pub struct Outbox {
    queue: mpsc::UnboundedReceiver<OutboundMessage>,
    unsent: Option<OutboundMessage>,
}

impl Outbox {
    pub fn new(queue: mpsc::UnboundedReceiver<OutboundMessage>) -> Self {
        Self {
            queue,
            unsent: None,
        }
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent.is_some()
    }

    async fn next(&mut self) -> Option<OutboundMessage> {
        if let Some(message) = self.unsent.take() {
            return Some(message);
        }
        self.queue.recv().await
    }
}

struct ReadExit {
    stream: SplitStream<WsStream>,
    error: Option<TransportError>,
}

struct WriteExit {
    sink: SplitSink<WsStream, Message>,
    outbox: Outbox,
    error: Option<TransportError>,
}

/// What is left after a connection has been torn down.
#[derive(Debug)]
pub struct ClosedConnection {
    /// `None` only if the write pump panicked.
    pub outbox: Option<Outbox>,
    /// Why the connection stopped on its own, if it did.
    pub error: Option<TransportError>,
}

pub struct Connection {
    generation: u64,
    guard: DropGuard,
    token: CancellationToken,
    write_wait: Duration,
    close_delay: Duration,
    read_task: JoinHandle<ReadExit>,
    write_task: JoinHandle<WriteExit>,
}

impl Connection {
    /// Spawns both pumps. Cancelling `parent` stops them as well.
    pub fn start(
        ws: WsStream,
        generation: u64,
        config: &TransportConfig,
        outbox: Outbox,
        parent: &CancellationToken,
        inbound_buffer: usize,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let token = parent.child_token();
        let (sink, stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer.max(1));

        let read_task = tokio::spawn(read_pump(
            stream,
            inbound_tx,
            config.pong_wait,
            token.clone(),
            generation,
        ));
        let write_task = tokio::spawn(write_pump(
            sink,
            outbox,
            config.ping_period,
            config.write_wait,
            token.clone(),
            generation,
        ));

        debug!(target = "hooklink::transport", generation, "pumps started");

        let connection = Self {
            generation,
            guard: token.clone().drop_guard(),
            token,
            write_wait: config.write_wait,
            close_delay: config.close_delay,
            read_task,
            write_task,
        };
        (connection, inbound_rx)
    }

    /// Resolves once either pump has stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Stops both pumps, sends a close frame and waits briefly for the peer's.
    pub async fn close(self, code: CloseCode, reason: &str) -> ClosedConnection {
        let Connection {
            generation,
            guard,
            token: _,
            write_wait,
            close_delay,
            read_task,
            write_task,
        } = self;
        guard.disarm().cancel();

        let (stream, read_error) = match read_task.await {
            Ok(exit) => (Some(exit.stream), exit.error),
            Err(err) => {
                error!(target = "hooklink::transport", generation, error = %err, "read pump panicked");
                (None, None)
            }
        };
        let (sink, outbox, write_error) = match write_task.await {
            Ok(exit) => (Some(exit.sink), Some(exit.outbox), exit.error),
            Err(err) => {
                error!(target = "hooklink::transport", generation, error = %err, "write pump panicked");
                (None, None, None)
            }
        };

        if let (Some(stream), Some(sink)) = (stream, sink) {
            match stream.reunite(sink) {
                Ok(ws) => send_close(ws, code, reason, write_wait, close_delay, generation).await,
                Err(err) => debug!(target = "hooklink::transport", generation, error = %err, "could not reunite socket halves"),
            }
        }

        debug!(target = "hooklink::transport", generation, ?code, "connection closed");
        ClosedConnection {
            outbox,
            error: read_error.or(write_error),
        }
    }
}

async fn send_close(
    mut ws: WsStream,
    code: CloseCode,
    reason: &str,
    write_wait: Duration,
    close_delay: Duration,
    generation: u64,
) {
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    match timeout(write_wait, ws.close(Some(frame))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(target = "hooklink::transport", generation, error = %err, "close frame not sent");
            return;
        }
        Err(_) => {
            debug!(target = "hooklink::transport", generation, "timed out sending close frame");
            return;
        }
    }

    let peer_closed = timeout(close_delay, async {
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if peer_closed.is_err() {
        trace!(target = "hooklink::transport", generation, "peer did not answer close frame");
    }
}

async fn read_pump(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::Sender<InboundMessage>,
    pong_wait: Duration,
    token: CancellationToken,
    generation: u64,
) -> ReadExit {
    let mut deadline = Instant::now() + pong_wait;

    let error = loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            frame = timeout_at(deadline, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => break Some(TransportError::PongTimeout(pong_wait)),
            Ok(None) => break Some(TransportError::ClosedByPeer),
            Ok(Some(Err(err))) => break Some(err.into()),
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(target = "hooklink::transport", generation, "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                trace!(target = "hooklink::transport", generation, "pong");
                continue;
            }
            Message::Close(frame) => {
                debug!(target = "hooklink::transport", generation, ?frame, "peer sent close frame");
                break Some(TransportError::ClosedByPeer);
            }
            Message::Ping(_) | Message::Frame(_) => continue,
        };

        let message = match InboundMessage::parse(&text) {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "hooklink::transport", generation, error = %err, "dropping malformed frame");
                continue;
            }
        };

        // Pongs queued behind this frame stay unread while the consumer is
        // busy, so the wait does not count against the peer.
        let waiting = Instant::now();
        let delivered = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            sent = inbound.send(message) => sent.is_ok(),
        };
        if !delivered {
            break None;
        }
        deadline += waiting.elapsed();
    };

    match &error {
        Some(err) if err.is_expected_close() => {
            debug!(target = "hooklink::transport", generation, error = %err, "read pump stopped")
        }
        Some(err) => {
            warn!(target = "hooklink::transport", generation, error = %err, "connection lost unexpectedly")
        }
        None => trace!(target = "hooklink::transport", generation, "read pump cancelled"),
    }
    token.cancel();
    ReadExit { stream, error }
}

async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outbox: Outbox,
    ping_period: Duration,
    write_wait: Duration,
    token: CancellationToken,
    generation: u64,
) -> WriteExit {
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let error = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            _ = ping.tick() => {
                let ping = Message::Ping(Vec::new());
                if let Err(err) = write_frame(&mut sink, ping, write_wait).await {
                    break Some(err);
                }
            }
            message = outbox.next() => {
                let Some(message) = message else {
                    debug!(target = "hooklink::transport", generation, "outbound queue closed");
                    break None;
                };
                let frame = match message.to_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target = "hooklink::transport", generation, error = %err, "dropping unserializable outbound message");
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut sink, Message::Text(frame), write_wait).await {
                    outbox.unsent = Some(message);
                    break Some(err);
                }
                trace!(
                    target = "hooklink::transport",
                    generation,
                    webhook_conversation_id = %message.webhook_conversation_id(),
                    "frame written"
                );
            }
        }
    };

    if let Some(err) = &error {
        warn!(target = "hooklink::transport", generation, error = %err, "write pump stopped");
    }
    token.cancel();
    WriteExit {
        sink,
        outbox,
        error,
    }
}

async fn write_frame(
    sink: &mut SplitSink<WsStream, Message>,
    message: Message,
    write_wait: Duration,
) -> Result<(), TransportError> {
    match timeout(write_wait, sink.send(message)).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::WriteTimeout(write_wait)),
    }
}
