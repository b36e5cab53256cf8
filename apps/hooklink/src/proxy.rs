//! Top-level wiring: authorizer, tunnel, event processor and destinations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthorizeRequest, Authorizer, SessionDescriptor};
use crate::config::{ConfigError, ProxyConfig};
use crate::forward::{DestinationRegistry, ForwardError, WebhookEventProcessor};
use crate::output::{ConnectionState, OutputSink};
use crate::transport::TransportError;
use crate::tunnel::{SessionSource, TunnelClient, TunnelEvent, TunnelState};
use crate::webhook_endpoints::{self, WebhookEndpointsError};

pub const INITIAL_AUTH_ATTEMPTS: usize = 6;
pub const INITIAL_AUTH_RETRY_WAIT: Duration = Duration::from_secs(1);

const CONNECT_FILTER_WARNING: &str = "you specified the 'account' filter for Connect accounts \
     but are not a Connect user, so the filter will not be applied.";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load webhook endpoints: {0}")]
    WebhookEndpoints(#[from] WebhookEndpointsError),
    #[error("failed to set up destinations: {0}")]
    Destinations(#[from] ForwardError),
    #[error("error while authenticating: {0}")]
    Authorization(#[source] AuthError),
}

pub struct Proxy {
    config: ProxyConfig,
    authorizer: Authorizer,
    registry: Arc<DestinationRegistry>,
    output: OutputSink,
}

impl Proxy {
    /// Validates the configuration and builds the destination registry,
    /// loading webhook endpoints from the API when asked to.
    pub async fn init(config: ProxyConfig, output: OutputSink) -> Result<Self, ProxyError> {
        config.validate()?;

        let mut destinations = if config.load_from_webhooks_api {
            let endpoints = webhook_endpoints::list_webhook_endpoints(&config.api).await?;
            if endpoints.is_empty() {
                return Err(ConfigError::NoWebhookEndpoints.into());
            }
            let forward_url = config.resolved_forward_url().unwrap_or_default();
            let forward_connect_url = config.resolved_forward_connect_url().unwrap_or_default();
            webhook_endpoints::build_endpoint_routes(
                &endpoints,
                &forward_url,
                &forward_connect_url,
                &config.forward_headers,
                config.resolved_forward_connect_headers(),
            )
        } else {
            config.static_destinations()
        };
        destinations.extend(config.thin_destinations());

        let registry = DestinationRegistry::from_destinations(destinations, &config.http, &output)?;
        for client in registry.iter() {
            debug!(
                target = "hooklink::proxy",
                url = %client.url(),
                connect = client.is_connect(),
                "registered destination"
            );
        }

        Ok(Self {
            authorizer: Authorizer::new(config.api.clone()),
            registry: Arc::new(registry),
            config,
            output,
        })
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    /// Authorizes a session only to read its signing secret.
    pub async fn session_secret(&self, cancel: &CancellationToken) -> Result<String, ProxyError> {
        let refresher = self.refresher();
        let session = refresher
            .initial(cancel)
            .await
            .map_err(ProxyError::Authorization)?;
        Ok(session.secret)
    }

    /// Runs until `cancel` fires or the initial authorization fails.
    ///
    /// Teardown order: stop taking inbound messages, drain the processor,
    /// then close the tunnel so in-flight responses still go out.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        self.output.state(ConnectionState::Loading, None);

        let tunnel_cancel = CancellationToken::new();
        let (tunnel, mut events) = TunnelClient::spawn(
            self.config.tunnel.clone(),
            self.config.transport.clone(),
            self.refresher(),
            tunnel_cancel,
        );
        let processor = WebhookEventProcessor::new(
            self.config.processor_config(),
            Arc::clone(&self.registry),
            Arc::new(tunnel.sender()),
            self.output.clone(),
        );

        let mut secret: Option<String> = None;
        let mut ready = false;
        let mut fatal = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                None => break,
                Some(TunnelEvent::Message(message)) => processor.process_event(message),
                Some(TunnelEvent::Session(session)) => secret = Some(session.secret.clone()),
                Some(TunnelEvent::State(TunnelState::Connected)) => {
                    self.output.state(ConnectionState::Connected, None);
                    if !ready {
                        ready = true;
                        self.output.state(ConnectionState::Ready, secret.clone());
                    }
                }
                Some(TunnelEvent::State(TunnelState::Reconnecting)) => {
                    self.output.state(ConnectionState::Reconnecting, None);
                }
                Some(TunnelEvent::State(state)) => {
                    debug!(target = "hooklink::proxy", ?state, "tunnel state");
                }
                Some(TunnelEvent::Fatal(err)) => {
                    fatal = Some(err);
                    break;
                }
            }
        }

        info!(target = "hooklink::proxy", "shutting down");
        processor.shutdown().await;
        tunnel.stop();
        tunnel.join().await;
        drop(events);
        self.output.state(ConnectionState::Done, None);

        match fatal {
            Some(err) => Err(ProxyError::Authorization(err)),
            None => Ok(()),
        }
    }

    fn refresher(&self) -> SessionRefresher {
        SessionRefresher::new(
            self.authorizer.clone(),
            self.config.authorize_request(),
            self.output.clone(),
        )
    }
}

/// Authorizes the initial session with a few retries, and re-authorizes
/// later only when the backend says the session expired.
pub struct SessionRefresher {
    authorizer: Authorizer,
    request: AuthorizeRequest,
    output: OutputSink,
    warned: AtomicBool,
    attempts: usize,
    retry_wait: Duration,
}

impl SessionRefresher {
    pub fn new(authorizer: Authorizer, request: AuthorizeRequest, output: OutputSink) -> Self {
        Self {
            authorizer,
            request,
            output,
            warned: AtomicBool::new(false),
            attempts: INITIAL_AUTH_ATTEMPTS,
            retry_wait: INITIAL_AUTH_RETRY_WAIT,
        }
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    async fn authorize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionDescriptor, AuthError> {
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            session = self.authorizer.authorize(&self.request) => session?,
        };
        if session.connect_filter_warning && !self.warned.swap(true, Ordering::SeqCst) {
            self.output.warning(CONNECT_FILTER_WARNING);
        }
        Ok(session)
    }
}

#[async_trait]
impl SessionSource for SessionRefresher {
    async fn initial(&self, cancel: &CancellationToken) -> Result<SessionDescriptor, AuthError> {
        let mut last_error = AuthError::Cancelled;
        for attempt in 1..=self.attempts {
            match self.authorize(cancel).await {
                Ok(session) => return Ok(session),
                Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
                Err(err) => {
                    warn!(
                        target = "hooklink::proxy",
                        attempt,
                        error = %err,
                        "authorization attempt failed"
                    );
                    last_error = err;
                }
            }
            if attempt < self.attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                    _ = sleep(self.retry_wait) => {}
                }
            }
        }
        Err(last_error)
    }

    async fn refresh(
        &self,
        cancel: &CancellationToken,
        last_error: Option<&TransportError>,
    ) -> Result<Option<SessionDescriptor>, AuthError> {
        if last_error.is_some_and(|err| !err.is_session_expired()) {
            return Ok(None);
        }
        info!(target = "hooklink::proxy", "session expired; re-authorizing");
        self.authorize(cancel).await.map(Some)
    }
}
