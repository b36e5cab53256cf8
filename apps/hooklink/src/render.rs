use chrono::Local;
use hooklink_core::{ConnectionState, ProxyEvent};
use tokio::sync::mpsc;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Prints proxy observations for a human at a terminal.
pub struct Renderer {
    print_json: bool,
}

impl Renderer {
    pub fn new(print_json: bool) -> Self {
        Self { print_json }
    }

    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ProxyEvent>) {
        while let Some(event) = events.recv().await {
            let now = Local::now().format(TIMESTAMP_FORMAT).to_string();
            match self.format(&event, &now) {
                Some(Line::Out(line)) => println!("{line}"),
                Some(Line::Err(line)) => eprintln!("{line}"),
                None => {}
            }
        }
    }

    fn format(&self, event: &ProxyEvent, now: &str) -> Option<Line> {
        match event {
            ProxyEvent::State { state, data } => match state {
                ConnectionState::Loading => Some(Line::Err("> Getting ready...".to_owned())),
                ConnectionState::Reconnecting => {
                    Some(Line::Err("> Connection lost, reconnecting...".to_owned()))
                }
                ConnectionState::Ready => Some(Line::Err(format!(
                    "> Ready! Your webhook signing secret is {} (^C to quit)",
                    data.as_deref().unwrap_or("<unknown>")
                ))),
                ConnectionState::Connected | ConnectionState::Done => None,
            },
            ProxyEvent::Event(record) if self.print_json => Some(Line::Out(record.payload.clone())),
            ProxyEvent::Event(record) => Some(Line::Out(format!(
                "{now}   --> {} [{}]",
                record.event.event_type, record.event.id
            ))),
            ProxyEvent::ThinEvent(record) if self.print_json => {
                Some(Line::Out(record.payload.clone()))
            }
            ProxyEvent::ThinEvent(record) => Some(Line::Out(format!(
                "{now}   --> {} [{}]",
                record.event.event_type,
                record.event.dashboard_url(&record.event_destination_id)
            ))),
            ProxyEvent::Response(_) if self.print_json => None,
            ProxyEvent::Response(record) => Some(Line::Out(format!(
                "{now}  <--  [{}] POST {} [{}]",
                record.status, record.forward_url, record.event_id
            ))),
            ProxyEvent::Error(message) => {
                Some(Line::Err(format!("{now}            [ERROR] {message}")))
            }
            ProxyEvent::Warning(message) => Some(Line::Err(format!("Warning: {message}"))),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Out(String),
    Err(String),
}
