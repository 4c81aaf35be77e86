// hostmesh relay: one pub/sub adapter on the configured medium plus one stream adapter per
// accepted TCP connection, joined by a switch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hostmesh_node::{
    config, medium, Adapter, AdapterCleanup, AdapterEvent, NodeConfig, PubSubAdapter,
    StreamAdapter, Switch,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("hostmesh-relay {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load().context("loading configuration")?;
    info!(medium = %cfg.medium, listen = %cfg.relay_listen, ttl = cfg.ttl_secs, "hostmesh-relay starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    let switch = Arc::new(Switch::new());
    let medium = medium::from_uri(&cfg.medium)?;
    let pubsub = PubSubAdapter::new(cfg.adapter_settings("pubsub"), medium)?;
    switch
        .add_adapter(Arc::new(pubsub))
        .await
        .context("starting pub/sub adapter")?;

    let listener = TcpListener::bind(cfg.relay_listen)
        .await
        .with_context(|| format!("binding {}", cfg.relay_listen))?;
    info!(addr = %cfg.relay_listen, "accepting stream peers");

    let accept_switch = switch.clone();
    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_peer(accept_switch.clone(), cfg.clone(), stream, peer));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    accept.abort();
    switch.shutdown().await;
    Ok(())
}

/// Attach one TCP peer and detach it once its stream fails or ends.
async fn serve_peer(switch: Arc<Switch>, cfg: NodeConfig, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "cannot disable nagle");
    }
    let adapter = Arc::new(StreamAdapter::from_stream(
        cfg.adapter_settings(format!("stream:{peer}")),
        stream,
    ));
    let mut events = adapter.subscribe();
    let id = match switch.add_adapter(adapter).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%peer, error = %e, "stream peer rejected");
            return;
        }
    };
    info!(%peer, adapter = %id, "stream peer attached");
    loop {
        match events.recv().await {
            Ok(AdapterEvent::Stopped) | Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                break
            }
            Ok(AdapterEvent::ConnectionError { error, fatal, .. }) => {
                warn!(%peer, %error, fatal, "stream peer connection error");
            }
            _ => {}
        }
    }
    if let Err(e) = switch.remove_adapter(id, AdapterCleanup::Stop).await {
        warn!(%peer, error = %e, "stream peer did not stop cleanly");
    }
    info!(%peer, "stream peer detached");
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
