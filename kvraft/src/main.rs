mod config;
mod kv_service;
mod metrics;
mod raft;
mod raft_client;
mod raft_service;
mod server;
mod state_kv;

use clap::Parser;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    config::RuntimeConfig::from_toml(&args.config)?;

    let runtime_config = config::instance()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    log::info!(
        "starting node {} of {} on {}",
        runtime_config.id,
        runtime_config.node_list.len(),
        runtime_config.addr
    );
    let mut server = server::Server::new(runtime_config)?;
    server.start().await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}
