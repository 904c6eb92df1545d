//! Proxy module
//!
//! Routing, relaying and serving: the router turns a connection's first bytes
//! into a routing decision, the forwarder relays the connection to the chosen
//! backend, and the server accepts connections and runs each one as an
//! isolated unit of the configured execution strategy.

mod forwarder;
mod handler;
mod message;
mod router;
mod server;
mod strategy;

pub use forwarder::{connect_backend, relay, shovel, RelayStats, ShovelOptions};
pub use handler::{handle_connection, ConnectionContext};
pub use message::{create_channel, ServerHandle, ServerMessage};
pub use router::{ProbeSession, Router, RoutingDecision, Verdict};
pub use server::Server;
pub use strategy::{run_isolated, strategy_for, ExecutionStrategy, TaskPerConnection, ThreadPerConnection, UnitFuture};
