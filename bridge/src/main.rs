use std::sync::Arc;

use anyhow::Context;
use log::info;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use tokio::select;

use voice_bridge::bridge::{OpusPassthrough, WebRtcFactory};
use voice_bridge::registry::Registry;
use voice_bridge::signaling::Gateway;
use voice_bridge::{config, router};

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = config::parse();

    TermLogger::init(
        opts.log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    info!("Starting {} {}", CRATE_NAME, CRATE_VERSION);

    let registry = Registry::new();
    let (upstream, events, mut upstream_task) = mumble::spawn(opts.mumble);
    tokio::spawn(router::route_upstream(events, registry.clone()));

    let factory = WebRtcFactory::new(opts.ice_servers).context("failed to set up WebRTC")?;
    let gateway = Gateway::new(
        registry,
        upstream,
        Arc::new(factory),
        Arc::new(OpusPassthrough),
        opts.gateway,
    );

    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("failed to listen on {}", opts.listen))?;

    select! {
        res = gateway.serve(listener) => res.context("signaling endpoint failed")?,
        res = &mut upstream_task => {
            res.context("upstream task panicked")?
                .context("lost the voice server")?;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("failed to wait for Ctrl-C")?;
            info!("Shutting down");
        }
    }

    upstream_task.abort();
    Ok(())
}
