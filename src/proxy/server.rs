//! Server module
//!
//! One accept loop per listening socket feeds a single dispatcher, which hands
//! every connection to the execution strategy and tracks it until it ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::common::{ProxyError, Result};
use crate::config::defaults;

use super::handler::ConnectionContext;
use super::message::{create_channel, ServerHandle, ServerMessage};
use super::strategy::ExecutionStrategy;

/// Pause after a failed accept, so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listening sockets plus what every accepted connection shares
pub struct Server {
    listeners: Vec<TcpListener>,
    ctx: Arc<ConnectionContext>,
    strategy: Arc<dyn ExecutionStrategy>,
    shutdown_grace: Duration,
}

impl Server {
    /// Bind every listen address
    ///
    /// # Parameters
    ///
    /// * `addrs` - Listen addresses (`host:port`), at least one
    /// * `ctx` - Shared per-connection context
    /// * `strategy` - How each accepted connection is run
    ///
    /// # Returns
    ///
    /// A server ready to `start`, or a configuration error if no address is
    /// given or one fails to bind.
    pub async fn bind(
        addrs: &[String],
        ctx: Arc<ConnectionContext>,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(ProxyError::Config(
                "No listening address specified; use at least one --listen option".to_string(),
            ));
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr.as_str())
                .await
                .map_err(|e| ProxyError::Config(format!("Failed to bind {}: {}", addr, e)))?;
            listeners.push(listener);
        }

        Ok(Self::from_listeners(listeners, ctx, strategy))
    }

    /// Serve on already bound listeners
    pub fn from_listeners(
        listeners: Vec<TcpListener>,
        ctx: Arc<ConnectionContext>,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        Self {
            listeners,
            ctx,
            strategy,
            shutdown_grace: Duration::from_secs(defaults::shutdown_grace()),
        }
    }

    /// How long shutdown waits for in-flight connections
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    /// Start serving in the background
    ///
    /// Returns the control handle and the task that completes after shutdown.
    pub fn start(self) -> (ServerHandle, JoinHandle<Result<()>>) {
        let (handle, rx) = create_channel();
        let internal = handle.clone();
        let task = tokio::spawn(self.run(internal, rx));
        (handle, task)
    }

    async fn run(self, handle: ServerHandle, mut rx: mpsc::Receiver<ServerMessage>) -> Result<()> {
        let Server {
            listeners,
            ctx,
            strategy,
            shutdown_grace,
        } = self;

        let mut acceptors = JoinSet::new();
        for listener in listeners {
            match listener.local_addr() {
                Ok(addr) => info!("Listening on {} ({} per connection)", addr, strategy.name()),
                Err(e) => warn!("Listening on an unknown address: {}", e),
            }
            acceptors.spawn(accept_loop(listener, handle.clone()));
        }
        drop(handle);

        let mut connections = JoinSet::new();
        let mut active: usize = 0;

        loop {
            select! {
                message = rx.recv() => match message {
                    Some(ServerMessage::Accepted { stream, peer }) => {
                        debug!("New connection from {}", peer);
                        active += 1;
                        connections.spawn(strategy.run(stream, peer, Arc::clone(&ctx)));

                        if active % 100 == 0 {
                            info!("Active connections: {}", active);
                        }
                    }
                    Some(ServerMessage::Shutdown) => {
                        info!("Received shutdown message");
                        break;
                    }
                    None => {
                        info!("All server handles dropped, stopping");
                        break;
                    }
                },

                Some(result) = connections.join_next() => {
                    active = active.saturating_sub(1);
                    if let Err(e) = result {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        acceptors.abort_all();

        info!("Waiting for {} connections to complete...", active);
        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    error!("Connection task failed during shutdown: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, {} connections still active", connections.len());
            connections.abort_all();
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, handle: ServerHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if handle.send(ServerMessage::Accepted { stream, peer }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
