use std::collections::{BTreeMap, HashSet};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::{redirect, Client, Response};
use tracing::debug;
use tunnel_proto::{
    truncate, MAX_BODY_SIZE, MAX_HEADER_KEY_SIZE, MAX_HEADER_VALUE_SIZE, MAX_NUM_HEADERS,
};

use super::registry::{parse_header_line, Destination, HttpOptions};
use super::{EventContext, ForwardError};
use crate::output::OutputSink;

/// What a destination answered, already capped for the trip back through the
/// tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// POSTs events to one local destination.
#[derive(Debug)]
pub struct EndpointClient {
    url: String,
    connect: bool,
    event_destination: bool,
    events: HashSet<String>,
    headers: HeaderMap,
    host_override: Option<HeaderValue>,
    http: Client,
    output: OutputSink,
}

impl EndpointClient {
    pub fn new(
        destination: Destination,
        options: &HttpOptions,
        output: OutputSink,
    ) -> Result<Self, ForwardError> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.skip_verify)
            .build()
            .map_err(ForwardError::Client)?;

        let mut headers = HeaderMap::new();
        let mut host_override = None;
        for line in &destination.headers {
            let Some((key, value)) = parse_header_line(line) else {
                continue;
            };
            let invalid = || ForwardError::InvalidHeader {
                url: destination.url.clone(),
                name: key.clone(),
            };
            let value = HeaderValue::from_str(&value).map_err(|_| invalid())?;
            if key.eq_ignore_ascii_case("host") {
                host_override = Some(value);
                continue;
            }
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| invalid())?;
            headers.append(name, value);
        }

        Ok(Self {
            url: destination.url,
            connect: destination.connect,
            event_destination: destination.event_destination,
            events: destination.event_types.into_iter().collect(),
            headers,
            host_override,
            http,
            output,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connect(&self) -> bool {
        self.connect
    }

    pub fn is_event_destination(&self) -> bool {
        self.event_destination
    }

    pub fn supports_event_type(&self, connect: bool, event_type: &str) -> bool {
        connect == self.connect && (self.events.contains("*") || self.events.contains(event_type))
    }

    /// Event destinations take every thin event for their account scope;
    /// type filtering happens once, in the processor.
    pub fn supports_context(&self, connect: bool) -> bool {
        connect == self.connect
    }

    /// Forwards the event payload. Transport failures are also reported on the
    /// output sink so they read differently from an error status.
    pub async fn post(&self, context: &EventContext) -> Result<EndpointResponse, ForwardError> {
        debug!(
            target = "hooklink::forward",
            url = %self.url,
            webhook_id = %context.webhook_id,
            "forwarding event to local endpoint"
        );

        let response = match self
            .http
            .post(&self.url)
            .headers(self.merged_headers(&context.http_headers))
            .body(context.payload.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(source) => {
                self.output.error(format!(
                    "Failed to POST to {} [{}]: {source}",
                    self.url, context.event_id
                ));
                return Err(ForwardError::Request {
                    url: self.url.clone(),
                    source,
                });
            }
        };

        let status = response.status().as_u16();
        let headers = capture_headers(response.headers());
        let body = match read_capped_body(response).await {
            Ok(body) => body,
            Err(source) => {
                self.output.error(format!(
                    "Failed to read response from {} [{}]: {source}",
                    self.url, context.event_id
                ));
                return Err(ForwardError::ReadBody {
                    url: self.url.clone(),
                    source,
                });
            }
        };

        Ok(EndpointResponse {
            status,
            headers,
            body,
        })
    }

    fn merged_headers(&self, event_headers: &BTreeMap<String, String>) -> HeaderMap {
        let mut merged = HeaderMap::new();
        for (key, value) in event_headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    merged.append(name, value);
                }
                _ => debug!(
                    target = "hooklink::forward",
                    header = %key,
                    "skipping event header that is not valid http"
                ),
            }
        }
        for (name, value) in &self.headers {
            merged.append(name.clone(), value.clone());
        }
        if let Some(host) = &self.host_override {
            merged.insert(HOST, host.clone());
        }
        merged
    }
}

fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .take(MAX_NUM_HEADERS)
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((
                truncate(name.as_str(), MAX_HEADER_KEY_SIZE, false),
                truncate(value, MAX_HEADER_VALUE_SIZE, true),
            ))
        })
        .collect()
}

async fn read_capped_body(mut response: Response) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() > MAX_BODY_SIZE {
            break;
        }
    }
    Ok(truncate(
        &String::from_utf8_lossy(&buf),
        MAX_BODY_SIZE,
        true,
    ))
}
