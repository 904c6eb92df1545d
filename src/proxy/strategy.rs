//! Execution strategies
//!
//! An execution strategy decides what a connection's pipeline runs on. Each
//! connection is its own unit: a failure or panic in one never reaches the
//! listener or any other connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use log::error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::ExecutionMode;

use super::handler::{handle_connection, ConnectionContext};

/// Future driving one connection to completion
pub type UnitFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs the pipeline of one accepted connection
pub trait ExecutionStrategy: Send + Sync {
    /// Strategy name, for logs
    fn name(&self) -> &'static str;

    /// Build the unit for a connection; the server spawns and tracks it
    fn run(&self, stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) -> UnitFuture;
}

/// One tokio task per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskPerConnection;

impl ExecutionStrategy for TaskPerConnection {
    fn name(&self) -> &'static str {
        "task"
    }

    fn run(&self, stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) -> UnitFuture {
        Box::pin(handle_connection(stream, peer, ctx))
    }
}

/// One OS thread, with its own single-threaded runtime, per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPerConnection;

impl ExecutionStrategy for ThreadPerConnection {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn run(&self, stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) -> UnitFuture {
        Box::pin(async move {
            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to detach connection from {}: {}", peer, e);
                    return;
                }
            };

            let unit = run_isolated(format!("portshare-{}", peer), move || async move {
                match TcpStream::from_std(stream) {
                    Ok(stream) => handle_connection(stream, peer, ctx).await,
                    Err(e) => error!("Failed to register connection from {}: {}", peer, e),
                }
            });
            if let Err(e) = unit.await {
                error!("Execution unit for {} failed: {}", peer, e);
            }
        })
    }
}

/// Strategy for a configured execution mode
pub fn strategy_for(mode: ExecutionMode) -> Arc<dyn ExecutionStrategy> {
    match mode {
        ExecutionMode::Task => Arc::new(TaskPerConnection),
        ExecutionMode::Thread => Arc::new(ThreadPerConnection),
    }
}

/// Run a future on a new OS thread with its own current-thread runtime
///
/// `make` is called on that thread, so any I/O resource it registers belongs
/// to the thread's runtime. Resolves once the future completes; a panic on the
/// thread surfaces as an error.
pub async fn run_isolated<F, Fut, T>(name: String, make: F) -> io::Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T>,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let output = runtime.block_on(async move { make().await });
        let _ = tx.send(Ok(output));
    })?;

    rx.await
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "execution unit panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_isolated_returns_output() {
        let caller = std::thread::current().id();
        let (value, thread) = run_isolated("unit".to_string(), || async {
            tokio::task::yield_now().await;
            (42, std::thread::current().id())
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_ne!(thread, caller);
    }

    #[tokio::test]
    async fn test_run_isolated_contains_panic() {
        let result = run_isolated("panicking".to_string(), || async {
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(strategy_for(ExecutionMode::Task).name(), "task");
        assert_eq!(strategy_for(ExecutionMode::Thread).name(), "thread");
    }
}
