mod watcher;

use nl_common::config::EnvConfig;
use nl_dhcp::{Server, ServerConfig};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{error, info};

use watcher::LeaseJournal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,netlease=debug".parse().unwrap()),
        )
        .init();

    info!("netlease starting...");

    let env = EnvConfig::load(None);
    info!("config snapshot: {}", env.config_path.display());
    info!("lease journal: {}", env.lease_journal_path.display());

    let journal = LeaseJournal::new(env.lease_journal_path.clone());
    let server = Arc::new(Server::new(ServerConfig::new(Some(Box::new(
        move |lease: &nl_dhcp::Lease| journal.append(lease),
    )))));

    // Initial load is fatal: a daemon that cannot bind its listeners or
    // read its config has nothing to serve.
    watcher::load_and_apply(server.as_ref(), &env.config_path)?;

    // SIGHUP re-applies the snapshot; listeners for already-served
    // subnets are replaced in place.
    let reload_server = Arc::clone(&server);
    let reload_path = env.config_path.clone();
    let mut signals = Signals::new([SIGHUP])?;
    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            if signal == SIGHUP {
                info!("received SIGHUP, reloading config...");
                match watcher::load_and_apply(reload_server.as_ref(), &reload_path) {
                    Ok(()) => info!("config reloaded"),
                    Err(e) => error!("config reload failed: {}", e),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.close();

    Ok(())
}
