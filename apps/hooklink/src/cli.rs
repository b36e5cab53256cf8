use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hooklink_core::auth::{ApiClient, DEFAULT_API_BASE};
use hooklink_core::client_info::ClientIdentity;
use hooklink_core::forward::processor::DEFAULT_MAX_FORWARD_CONCURRENCY;
use hooklink_core::forward::HttpOptions;
use hooklink_core::ProxyConfig;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "hooklink",
    author,
    version,
    about = "Receive webhook events through a tunnel and forward them to a local server"
)]
pub struct Cli {
    /// Secret API key used to authorize the tunnel session.
    #[arg(long, env = "HOOKLINK_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// API base URL.
    #[arg(long, env = "HOOKLINK_API_BASE", default_value = DEFAULT_API_BASE, hide = true)]
    pub api_base: String,

    /// Name this machine reports to the backend. Defaults to the hostname.
    #[arg(long, env = "HOOKLINK_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Comma-separated event types to listen for.
    #[arg(
        short = 'e',
        long,
        env = "HOOKLINK_EVENTS",
        value_delimiter = ',',
        default_value = "*"
    )]
    pub events: Vec<String>,

    /// URL to forward events to. A bare port or path means localhost.
    #[arg(short = 'f', long, env = "HOOKLINK_FORWARD_TO")]
    pub forward_to: Option<String>,

    /// Custom headers for forwarded requests, as "Key: Value".
    #[arg(short = 'H', long, value_delimiter = ',')]
    pub headers: Vec<String>,

    /// URL to forward Connect events to. Defaults to --forward-to.
    #[arg(short = 'c', long, env = "HOOKLINK_FORWARD_CONNECT_TO")]
    pub forward_connect_to: Option<String>,

    /// Custom headers for forwarded Connect requests. Defaults to --headers.
    #[arg(long, value_delimiter = ',')]
    pub connect_headers: Vec<String>,

    /// URL to forward thin events to. A bare port or path means localhost.
    #[arg(long, env = "HOOKLINK_FORWARD_THIN_TO")]
    pub forward_thin_to: Option<String>,

    /// URL to forward Connect thin events to. Defaults to --forward-thin-to.
    #[arg(long, env = "HOOKLINK_FORWARD_THIN_CONNECT_TO")]
    pub forward_thin_connect_to: Option<String>,

    /// Comma-separated thin event types to listen for.
    #[arg(long, value_delimiter = ',', default_value = "*")]
    pub thin_events: Vec<String>,

    /// Build routes from the webhook endpoints configured on the account.
    #[arg(short = 'a', long, visible_alias = "use-configured-webhooks")]
    pub load_from_webhooks_api: bool,

    /// Receive events rendered with the latest API version.
    #[arg(short = 'l', long)]
    pub latest: bool,

    /// Skip certificate verification when forwarding to HTTPS endpoints.
    #[arg(long)]
    pub skip_verify: bool,

    /// Per-request timeout for forwarded events, in seconds.
    #[arg(long, env = "HOOKLINK_FORWARD_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Maximum number of forwarded requests in flight across all destinations.
    #[arg(
        long,
        env = "HOOKLINK_MAX_FORWARD_CONCURRENCY",
        default_value_t = DEFAULT_MAX_FORWARD_CONCURRENCY
    )]
    pub max_forward_concurrency: usize,

    /// JSON subscription filters passed to the backend.
    #[arg(long)]
    pub filters: Option<String>,

    /// Force unencrypted ws:// instead of wss://.
    #[arg(long, hide = true)]
    pub no_wss: bool,

    /// Only print the webhook signing secret and exit.
    #[arg(long)]
    pub print_secret: bool,

    /// Print full event payloads instead of one line per event.
    #[arg(short = 'j', long)]
    pub print_json: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "HOOKLINK_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,
}

impl TryFrom<Cli> for ProxyConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.api_key.trim().is_empty() {
            bail!("an API key is required (--api-key or HOOKLINK_API_KEY)");
        }
        Url::parse(&cli.api_base)
            .with_context(|| format!("invalid api base: {}", cli.api_base))?;

        let api = ApiClient::new(&cli.api_base, cli.api_key.trim(), ClientIdentity::current());
        let device_name = cli.device_name.unwrap_or_else(default_device_name);

        let mut config = ProxyConfig::new(api, device_name);
        config.events = cli.events;
        config.forward_url = cli.forward_to;
        config.forward_headers = cli.headers;
        config.forward_connect_url = cli.forward_connect_to;
        config.forward_connect_headers = cli.connect_headers;
        config.forward_thin_url = cli.forward_thin_to;
        config.forward_thin_connect_url = cli.forward_thin_connect_to;
        config.thin_events = cli.thin_events;
        config.load_from_webhooks_api = cli.load_from_webhooks_api;
        config.use_latest_api_version = cli.latest;
        config.filters = cli.filters;
        config.http = HttpOptions {
            timeout: Duration::from_secs(cli.timeout),
            skip_verify: cli.skip_verify,
        };
        config.max_forward_concurrency = cli.max_forward_concurrency;
        config.transport.no_wss = cli.no_wss;

        config.validate()?;
        Ok(config)
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("hooklink-{}", &id[..8])
        })
}
