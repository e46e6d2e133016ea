use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use tunnel_server::config::{ServerArgs, ServerSettings};
use tunnel_server::network::TunInterfaceProvider;
use tunnel_server::server::{ServerContext, TunnelServer};
use tunnel_server::utils::logging;

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = ServerArgs::parse();

    // Held until exit so buffered file logs are flushed
    let _log_guard = match &args.log_file {
        Some(log_file) => Some(logging::init_file_logging(&args.log_level, log_file)?),
        None => {
            logging::init_logging(&args.log_level)?;
            None
        }
    };

    info!("Starting tunnel server");
    info!("Server version: {}", env!("CARGO_PKG_VERSION"));

    let settings = ServerSettings::load_from_file(&args.config_file).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config_file.display()
        )
    })?;
    let listen_addr = args.listen_addr()?;

    let interfaces = Arc::new(TunInterfaceProvider::new(args.tun_mtu));
    let context = Arc::new(ServerContext::new(settings, interfaces));
    let server = Arc::new(TunnelServer::bind(listen_addr, context).await?);

    let mut running = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    tokio::select! {
        result = &mut running => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }
    server.shutdown().await;
    running.await??;

    info!("Tunnel server exited");
    Ok(())
}
