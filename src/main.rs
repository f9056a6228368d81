use std::sync::Arc;

use launchkit::config::LauncherConfig;
use launchkit::ipc::IPCServer;
use launchkit::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("launchkit starting");

    let cfg = LauncherConfig::load()?;
    let listen_addr = cfg.listen_addr.clone();
    let supervisor = Arc::new(Supervisor::new(cfg)?);

    let ipc_server = IPCServer::new(supervisor.clone(), &listen_addr);
    tracing::info!("Starting IPC server on {}", listen_addr);

    tokio::select! {
        res = ipc_server.start() => {
            if let Err(e) = res {
                tracing::error!("IPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    // Never leave the app running behind us.
    supervisor.shutdown().await;
    tracing::info!("launchkit shutting down");
    Ok(())
}
