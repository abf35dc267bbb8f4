use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nexus_bridge_ipc::BridgeServer;
use nexus_bridged::config::BridgeConfig;
use nexus_bridged::demo::{build_demo_bridge, DemoNode};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "nexus-bridged", version)]
#[command(about = "Serve the nexus daemon bridge on a Unix socket")]
struct Args {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Absolute directory for daemon state; overrides the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Socket path; defaults to `<data_dir>/bridge.sock`.
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    config.apply_overrides(args.data_dir, args.socket);
    let data_dir = config.data_dir()?.to_path_buf();
    let socket = config.socket_path()?;

    let node = Arc::new(DemoNode::new("nexus-demo"));
    let (bridge, events) =
        build_demo_bridge(&data_dir, node).context("failed to register daemon methods")?;
    let status = bridge.initialize();
    log::debug!("nexus-bridged: bridge ready status={status}");
    if config.auto_start {
        bridge.start_daemon(&config.daemon_args).await.context("failed to start daemon")?;
    }

    let server = BridgeServer::bind(bridge.clone(), &socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    let shutdown = CancellationToken::new();
    let mut serve = tokio::spawn(server.serve(events, shutdown.clone()));

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            log::info!("nexus-bridged: shutting down");
            shutdown.cancel();
            None
        }
        served = &mut serve => Some(served),
    };
    let served = match finished {
        Some(served) => served,
        None => serve.await,
    };
    served.context("server task panicked")?.context("server failed")?;

    if let Err(err) = bridge.stop_daemon().await {
        log::warn!("nexus-bridged: stopping daemon failed: {err}");
    }
    Ok(())
}
