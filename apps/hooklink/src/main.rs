use anyhow::{Context, Result};
use clap::Parser;
use hooklink_core::{OutputSink, Proxy, ProxyConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cli;
mod render;
mod telemetry;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    telemetry::init(&cli.log_level)?;

    let print_secret = cli.print_secret;
    let print_json = cli.print_json;
    let config = ProxyConfig::try_from(cli)?;
    info!(
        device_name = %config.device_name,
        api_base = %config.api.base_url(),
        events = ?config.events,
        "starting hooklink"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let (output, events) = OutputSink::channel();
    let proxy = Proxy::init(config, output)
        .await
        .context("failed to start proxy")?;

    if print_secret {
        let secret = proxy.session_secret(&cancel).await?;
        println!("{secret}");
        return Ok(());
    }

    let renderer = tokio::spawn(render::Renderer::new(print_json).run(events));
    let result = proxy.run(cancel).await;
    if let Err(err) = renderer.await {
        debug!(error = %err, "renderer task failed");
    }
    result.context("proxy stopped with an error")
}

async fn cancel_on_signal(cancel: CancellationToken) {
    shutdown_signal().await;
    info!("interrupt received, shutting down");
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            debug!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
