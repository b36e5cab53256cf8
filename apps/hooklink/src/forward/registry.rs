use std::sync::Arc;
use std::time::Duration;

use super::endpoint::EndpointClient;
use super::ForwardError;
use crate::output::OutputSink;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// A local HTTP target registered for the lifetime of a proxy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub url: String,
    /// Receives events for connected accounts instead of the primary one.
    pub connect: bool,
    /// Receives thin events only; snapshot events are never routed here.
    pub event_destination: bool,
    pub event_types: Vec<String>,
    /// Extra headers as `"Key: Value"` lines.
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub skip_verify: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FORWARD_TIMEOUT,
            skip_verify: false,
        }
    }
}

/// Read-only set of endpoint clients. Safe to share across forwarding tasks.
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    clients: Vec<Arc<EndpointClient>>,
}

impl DestinationRegistry {
    pub fn from_destinations(
        destinations: Vec<Destination>,
        options: &HttpOptions,
        output: &OutputSink,
    ) -> Result<Self, ForwardError> {
        let clients = destinations
            .into_iter()
            .map(|destination| {
                EndpointClient::new(destination, options, output.clone()).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clients })
    }

    pub fn matching<'a>(
        &'a self,
        connect: bool,
        event_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<EndpointClient>> + 'a {
        self.clients.iter().filter(move |client| {
            !client.is_event_destination() && client.supports_event_type(connect, event_type)
        })
    }

    /// Event destinations that take a thin event in the given account scope.
    pub fn matching_thin(&self, connect: bool) -> impl Iterator<Item = &Arc<EndpointClient>> {
        self.clients
            .iter()
            .filter(move |client| client.is_event_destination() && client.supports_context(connect))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointClient>> {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Splits a `"Key: Value"` line after stripping control characters. Lines
/// without a colon or with an empty key yield nothing.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let cleaned: String = line.chars().filter(|c| !matches!(c, '\0'..='\x1f')).collect();
    let (key, value) = cleaned.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), value.trim().to_owned()))
}
