//! CLI entry point (spec §6 "CLI surface"): binds the DHT, starts it,
//! and waits for SIGINT/SIGTERM to shut down cleanly.

use clap::Parser;
use dht_crawler::{
    config::{
        Config,
        DhtConfig,
        MapConfig,
    },
    Dht,
};
use tracing::{
    error,
    info,
};

#[derive(Parser, Debug)]
#[command(name = "dht_crawler", about = "Mainline DHT crawler and metadata harvester")]
struct Args {
    /// Directory for routing_table.dat/peer_storage.dat/metadata.dat.
    #[arg(long, default_value = ".")]
    config_dir: String,

    /// UDP port to bind for the KRPC socket.
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Comma-separated bootstrap endpoints, e.g. router.bittorrent.com:6881.
    #[arg(long)]
    bootstrap: Option<String>,
}

fn build_config(args: &Args) -> MapConfig {
    let mut config = MapConfig::new();
    config.set("persistence.config_dir", args.config_dir.clone());
    config.set("dht.port", args.port.to_string());
    if let Some(bootstrap) = &args.bootstrap {
        config.set("dht.bootstrap_nodes", bootstrap.clone());
    } else {
        config.set(
            "dht.bootstrap_nodes",
            "router.bittorrent.com:6881,dht.transmissionbt.com:6881,router.utorrent.com:6881",
        );
    }
    config
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = build_config(&args);
    let resolved = DhtConfig::from_config(&config as &dyn Config);

    let dht = match Dht::bind(resolved).await {
        Ok(dht) => dht,
        Err(cause) => {
            error!(%cause, "failed to bind DHT");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(cause) = dht.start().await {
        error!(%cause, "failed to start DHT");
        return std::process::ExitCode::FAILURE;
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    if let Err(cause) = dht.stop().await {
        error!(%cause, "error during shutdown");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{
        signal,
        SignalKind,
    };

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
