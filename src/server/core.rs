// src/server/core.rs
//! Core server implementation for the tunnel server.
//!
//! This module contains the shared server context, the accept loop that
//! starts a tunnel per client, and shutdown of every active tunnel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::constants::ACCEPT_ERROR_BACKOFF;
use crate::config::ServerSettings;
use crate::network::{AddressPool, InterfaceProvider};
use crate::protocol::MessageError;
use crate::server::tunnel::ServerTunnel;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Listening socket bound
    Created,
    /// Accepting clients
    Running,
    /// Server is shutting down
    ShuttingDown,
    /// Server has stopped
    Stopped,
}

/// State shared by every tunnel of a server
pub struct ServerContext {
    pub settings: ServerSettings,
    /// Virtual addresses for IP flows
    pub address_pool: AddressPool,
    /// Creates the interfaces behind IP flows
    pub interfaces: Arc<dyn InterfaceProvider>,
}

impl ServerContext {
    /// Build the context, sizing the address pool from the settings
    pub fn new(settings: ServerSettings, interfaces: Arc<dyn InterfaceProvider>) -> Self {
        let (start, end) = settings.pool_range();
        let address_pool = AddressPool::new(start, end);

        Self {
            settings,
            address_pool,
            interfaces,
        }
    }
}

/// Handle to a running tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl TunnelHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stop the tunnel, tearing down all of its flows
    pub fn close(&self) {
        debug!("Closing tunnel for {}", self.peer);
        self.cancel.cancel();
    }
}

/// Accepts control connections and runs a tunnel for each
pub struct TunnelServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
    state: Arc<RwLock<ServerState>>,
    shutdown: CancellationToken,
    tunnels: Arc<Mutex<HashMap<u64, TunnelHandle>>>,
    next_tunnel: AtomicU64,
}

impl TunnelServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, context: Arc<ServerContext>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            context,
            state: Arc::new(RwLock::new(ServerState::Created)),
            shutdown: CancellationToken::new(),
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            next_tunnel: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Handles of the tunnels currently running
    pub fn tunnels(&self) -> Vec<TunnelHandle> {
        self.tunnels.lock().values().cloned().collect()
    }

    /// Accept clients until `shutdown` is called
    pub async fn run(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Created {
                return Err(ServerError::Internal(format!(
                    "Server cannot run in state {:?}",
                    *state
                )));
            }
            *state = ServerState::Running;
        }
        info!("Tunnel server running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Accepted control connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        self.spawn_tunnel(stream, peer);
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        *self.state.write().await = ServerState::Stopped;
        info!("Tunnel server stopped accepting");
        Ok(())
    }

    fn spawn_tunnel(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_tunnel.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        self.tunnels.lock().insert(
            id,
            TunnelHandle {
                peer,
                cancel: cancel.clone(),
            },
        );

        let context = self.context.clone();
        let tunnels = self.tunnels.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match ServerTunnel::new(reader, writer, context, cancel).run().await {
                Ok(()) => info!("Tunnel for {} closed", peer),
                Err(e) => warn!("Tunnel for {} failed: {}", peer, e),
            }
            tunnels.lock().remove(&id);
        });
    }

    /// Stop accepting and close every active tunnel
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::ShuttingDown || *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::ShuttingDown;
        }

        let tunnels = self.tunnels();
        info!("Shutting down, closing {} tunnels", tunnels.len());
        for tunnel in &tunnels {
            tunnel.close();
        }
        self.shutdown.cancel();
    }
}
