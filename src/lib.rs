//! Portshare: a port-sharing protocol demultiplexer
//!
//! Accepts TCP connections on one or more shared ports, inspects the first
//! bytes each client sends and relays the connection, untouched, to the
//! backend of the protocol it speaks: SSH, TLS (optionally by SNI or ALPN),
//! OpenVPN, HTTP, administrator-defined byte patterns and more.
//!
//! # Main Features
//!
//! - Ordered probing over a growing prefix of the connection, with a deadline
//! - Fallback protocol on timeout or when nothing matches
//! - Exact replay of the probed bytes, then a bidirectional relay with half-close
//! - Task-per-connection or thread-per-connection isolation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use portshare::config::{ConfigLoader, DemuxConfig};
//! use portshare::protocol::ProtocolTable;
//! use portshare::proxy::{strategy_for, ConnectionContext, Server, ShovelOptions};
//! use portshare::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = DemuxConfig::from_file("portshare.json")?;
//!     let table = Arc::new(ProtocolTable::from_config(&config)?);
//!     let shovel = ShovelOptions {
//!         connect_timeout: config.connect_timeout(),
//!         transfer_buffer_size: config.transfer_buffer_size,
//!     };
//!     let ctx = Arc::new(ConnectionContext::new(table, shovel, config.execution));
//!
//!     let server = Server::bind(&config.listen, ctx, strategy_for(config.execution)).await?;
//!     let (handle, task) = server.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     task.await.map_err(|e| portshare::ProxyError::Other(e.to_string()))??;
//!     Ok(())
//! }
//! ```

pub mod common;
pub mod config;
pub mod protocol;
pub mod proxy;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, ProxyError, Result};
pub use protocol::{Probe, ProbeResult, ProtocolEntry, ProtocolTable};
pub use proxy::{Router, RoutingDecision, Server, ServerHandle};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
