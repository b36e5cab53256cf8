//! Turns inbound tunnel messages into acks and forwarding attempts.
//!
//! Every forward runs as a tracked task that first takes a slot from one
//! limiter shared by all destinations. `shutdown` closes intake, closes the
//! limiter so queued forwards give up, and waits for the rest.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};
use tunnel_proto::{InboundMessage, OutboundMessage, V2Event, WebhookEvent, WebhookResponse};

use super::endpoint::EndpointClient;
use super::event::{StripeEvent, ThinEvent};
use super::registry::DestinationRegistry;
use super::EventContext;
use crate::output::{EventRecord, OutputSink, ProxyEvent, ResponseRecord, ThinEventRecord};
use crate::tunnel::OutboundSink;

pub const DEFAULT_MAX_FORWARD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Global event type filter; `*` lets everything through.
    pub events: Vec<String>,
    /// Thin event types to relay to event destinations; empty relays none.
    pub thin_events: Vec<String>,
    pub use_latest_api_version: bool,
    pub max_forward_concurrency: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            events: vec!["*".to_owned()],
            thin_events: Vec::new(),
            use_latest_api_version: false,
            max_forward_concurrency: DEFAULT_MAX_FORWARD_CONCURRENCY,
        }
    }
}

pub struct WebhookEventProcessor {
    events: HashSet<String>,
    thin_events: HashSet<String>,
    use_latest_api_version: bool,
    registry: Arc<DestinationRegistry>,
    outbound: Arc<dyn OutboundSink>,
    output: OutputSink,
    limiter: Arc<Semaphore>,
    tracker: TaskTracker,
    intake: CancellationToken,
}

impl WebhookEventProcessor {
    pub fn new(
        config: ProcessorConfig,
        registry: Arc<DestinationRegistry>,
        outbound: Arc<dyn OutboundSink>,
        output: OutputSink,
    ) -> Self {
        Self {
            events: config.events.into_iter().collect(),
            thin_events: config.thin_events.into_iter().collect(),
            use_latest_api_version: config.use_latest_api_version,
            registry,
            outbound,
            output,
            limiter: Arc::new(Semaphore::new(config.max_forward_concurrency.max(1))),
            tracker: TaskTracker::new(),
            intake: CancellationToken::new(),
        }
    }

    /// Handles one inbound message. Must be called from within a Tokio
    /// runtime; forwards are spawned and this returns immediately.
    pub fn process_event(&self, message: InboundMessage) {
        if self.intake.is_cancelled() {
            debug!(
                target = "hooklink::processor",
                "processor shut down; ignoring inbound message"
            );
            return;
        }

        match message {
            InboundMessage::WebhookEvent(webhook) => self.process_webhook_event(webhook),
            InboundMessage::V2Event(thin) => self.process_thin_event(thin),
            other => debug!(
                target = "hooklink::processor",
                message_type = %other.message_type(),
                "ignoring non-webhook message"
            ),
        }
    }

    /// Number of forwarding tasks still alive.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub async fn shutdown(&self) {
        self.intake.cancel();
        self.limiter.close();
        self.tracker.close();
        debug!(
            target = "hooklink::processor",
            in_flight = self.tracker.len(),
            "waiting for in-flight forwards"
        );
        self.tracker.wait().await;
    }

    fn process_webhook_event(&self, webhook: WebhookEvent) {
        debug!(
            target = "hooklink::processor",
            webhook_id = %webhook.webhook_id,
            webhook_conversation_id = %webhook.webhook_conversation_id,
            "processing webhook event"
        );

        let event = match StripeEvent::parse(&webhook.event_payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    target = "hooklink::processor",
                    webhook_id = %webhook.webhook_id,
                    error = %err,
                    "malformed event payload; dropping without ack"
                );
                return;
            }
        };

        self.outbound.send_message(OutboundMessage::event_ack(
            &webhook.webhook_id,
            &webhook.webhook_conversation_id,
        ));

        if self.filtered_by_api_version(&webhook) {
            return;
        }
        if !(self.events.contains("*") || self.events.contains(&event.event_type)) {
            trace!(
                target = "hooklink::processor",
                event_type = %event.event_type,
                "event type not subscribed"
            );
            return;
        }

        self.output.emit(ProxyEvent::Event(EventRecord {
            webhook_id: webhook.webhook_id.clone(),
            event: event.clone(),
            payload: webhook.event_payload.clone(),
        }));

        let connect = event.is_connect();
        let context = Arc::new(EventContext {
            webhook_id: webhook.webhook_id,
            webhook_conversation_id: webhook.webhook_conversation_id,
            event_id: event.id,
            event_type: event.event_type,
            payload: webhook.event_payload,
            http_headers: webhook.http_headers,
        });

        for client in self.registry.matching(connect, &context.event_type) {
            self.spawn_forward(Arc::clone(client), Arc::clone(&context));
        }
    }

    fn process_thin_event(&self, thin: V2Event) {
        debug!(
            target = "hooklink::processor",
            event_destination_id = %thin.event_destination_id,
            "processing thin event"
        );

        let event = match ThinEvent::parse(&thin.payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    target = "hooklink::processor",
                    event_destination_id = %thin.event_destination_id,
                    error = %err,
                    "malformed thin event payload; dropping without ack"
                );
                return;
            }
        };

        self.outbound.send_message(OutboundMessage::thin_event_ack(
            &event.id,
            &thin.event_destination_id,
        ));

        if !(self.thin_events.contains("*") || self.thin_events.contains(&event.event_type)) {
            trace!(
                target = "hooklink::processor",
                event_type = %event.event_type,
                "thin event type not subscribed"
            );
            return;
        }

        self.output.emit(ProxyEvent::ThinEvent(ThinEventRecord {
            event_destination_id: thin.event_destination_id.clone(),
            event: event.clone(),
            payload: thin.payload.clone(),
        }));

        let connect = event.is_connect();
        let context = Arc::new(EventContext {
            webhook_id: thin.event_destination_id,
            webhook_conversation_id: String::new(),
            event_id: event.id,
            event_type: event.event_type,
            payload: thin.payload,
            http_headers: thin.http_headers,
        });

        for client in self.registry.matching_thin(connect) {
            self.spawn_forward(Arc::clone(client), Arc::clone(&context));
        }
    }

    fn filtered_by_api_version(&self, webhook: &WebhookEvent) -> bool {
        let api_version = webhook.endpoint.api_version.as_deref();
        let filtered = match api_version {
            Some(_) => !self.use_latest_api_version,
            None => self.use_latest_api_version,
        };
        if filtered {
            debug!(
                target = "hooklink::processor",
                webhook_id = %webhook.webhook_id,
                api_version = api_version.unwrap_or("<account default>"),
                use_latest = self.use_latest_api_version,
                "event rendered for a different api version; not forwarding"
            );
        }
        filtered
    }

    fn spawn_forward(&self, client: Arc<EndpointClient>, context: Arc<EventContext>) {
        let limiter = Arc::clone(&self.limiter);
        let intake = self.intake.clone();
        let outbound = Arc::clone(&self.outbound);
        let output = self.output.clone();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = intake.cancelled() => None,
                permit = limiter.acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!(
                    target = "hooklink::processor",
                    url = %client.url(),
                    webhook_id = %context.webhook_id,
                    "shutting down before a forwarding slot freed up"
                );
                return;
            };

            let result = client.post(&context).await;
            drop(permit);

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    debug!(
                        target = "hooklink::processor",
                        url = %client.url(),
                        error = %err,
                        "forward failed"
                    );
                    return;
                }
            };

            output.emit(ProxyEvent::Response(ResponseRecord {
                webhook_id: context.webhook_id.clone(),
                event_id: context.event_id.clone(),
                event_type: context.event_type.clone(),
                forward_url: client.url().to_owned(),
                status: response.status,
            }));
            outbound.send_message(OutboundMessage::WebhookResponse(WebhookResponse {
                webhook_id: context.webhook_id.clone(),
                webhook_conversation_id: context.webhook_conversation_id.clone(),
                forward_url: client.url().to_owned(),
                status: response.status,
                body: response.body,
                http_headers: response.headers,
            }));
        });
    }
}
