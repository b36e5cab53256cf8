//! Core of the `hooklink` webhook tunnel: session authorization, the
//! reconnecting websocket tunnel, and forwarding of received events to local
//! HTTP destinations.

pub mod auth;
pub mod client_info;
pub mod config;
pub mod forward;
pub mod output;
pub mod proxy;
pub mod transport;
pub mod tunnel;
pub mod webhook_endpoints;

pub use config::ProxyConfig;
pub use output::{ConnectionState, OutputSink, ProxyEvent};
pub use proxy::{Proxy, ProxyError};
