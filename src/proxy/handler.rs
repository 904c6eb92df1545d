//! Connection handler module
//!
//! Runs the probe, route and shovel pipeline for one accepted connection and
//! reports its fate through logs and metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, log, warn, Level};
use metrics::{counter, gauge};
use tokio::net::TcpStream;

use crate::common::{ProxyError, Result};
use crate::config::ExecutionMode;
use crate::protocol::ProtocolTable;

use super::forwarder::{shovel, RelayStats, ShovelOptions};
use super::router::{Router, RoutingDecision};
use super::strategy::run_isolated;

const ACTIVE_GAUGE: &str = "portshare_connections_active";

/// Everything a connection needs, shared read-only by all of them
#[derive(Debug)]
pub struct ConnectionContext {
    pub router: Router,
    pub shovel: ShovelOptions,
    /// How connections are already isolated; `fork` entries only add a thread under `Task`
    pub execution: ExecutionMode,
}

impl ConnectionContext {
    pub fn new(table: Arc<ProtocolTable>, shovel: ShovelOptions, execution: ExecutionMode) -> Self {
        Self {
            router: Router::new(table),
            shovel,
            execution,
        }
    }
}

/// Handle a single client connection
pub async fn handle_connection(mut client: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    counter!("portshare_connections_total").increment(1);
    let _active = ActiveConnection::open();

    let decision = match ctx.router.route(&mut client).await {
        Ok(decision) => decision,
        Err(e) => {
            report_drop(peer, &e);
            return;
        }
    };

    let entry = Arc::clone(&decision.protocol);
    let level = if entry.log_level >= 1 { Level::Info } else { Level::Debug };
    log!(level, "{}: {}", peer, decision);
    counter!("portshare_protocol_selected_total", "protocol" => entry.name.clone()).increment(1);

    let result = if entry.flags.fork && ctx.execution == ExecutionMode::Task {
        relay_forked(client, decision, peer, ctx.shovel).await
    } else {
        shovel(client, decision, peer, &ctx.shovel).await
    };

    match result {
        Ok(stats) => log!(level, "{} ({}): closed cleanly, {}", peer, entry.name, describe(&stats)),
        Err(e @ ProxyError::RoutingFailure { .. }) => {
            report_drop(peer, &e);
        }
        Err(e) => {
            counter!("portshare_connections_dropped_total", "reason" => e.status()).increment(1);
            log!(level, "{} ({}): {}: {}", peer, entry.name, e.status(), e);
        }
    }
}

/// Holds one slot of the active-connections gauge
///
/// Released on every exit path, including a panic or an aborted task.
struct ActiveConnection;

impl ActiveConnection {
    fn open() -> Self {
        gauge!(ACTIVE_GAUGE).increment(1.0);
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        gauge!(ACTIVE_GAUGE).decrement(1.0);
    }
}

/// Run the relay phase on a dedicated OS thread
async fn relay_forked(
    client: TcpStream,
    decision: RoutingDecision,
    peer: SocketAddr,
    options: ShovelOptions,
) -> Result<RelayStats> {
    let client = client.into_std()?;
    let name = format!("portshare-{}", decision.protocol.name);

    run_isolated(name, move || async move {
        let client = TcpStream::from_std(client)?;
        shovel(client, decision, peer, &options).await
    })
    .await?
}

fn report_drop(peer: SocketAddr, error: &ProxyError) {
    counter!("portshare_connections_dropped_total", "reason" => error.status()).increment(1);
    match error {
        // port scanners and health checks
        ProxyError::ClientClosed(0) => debug!("{}: {}", peer, error.status()),
        ProxyError::RoutingFailure { .. } => warn!("{}: {}: {}", peer, error.status(), error),
        _ => info!("{}: {}: {}", peer, error.status(), error),
    }
}

fn describe(stats: &RelayStats) -> String {
    format!(
        "{} bytes replayed, {} bytes client -> backend, {} bytes backend -> client",
        stats.replayed, stats.client_to_backend, stats.backend_to_client
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

    use crate::protocol::{Backend, EntryFlags, Probe, ProtocolEntry, Signature};

    async fn run_one(flags: EntryFlags) {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let entry = ProtocolEntry::new(
            "ssh",
            Probe::Signature(Signature::Ssh),
            Backend::Resolved(backend.local_addr().unwrap()),
        )
        .with_flags(flags);
        let table = Arc::new(ProtocolTable::new(vec![entry], Duration::from_secs(2), 1024).unwrap());
        let ctx = Arc::new(ConnectionContext::new(table, ShovelOptions::default(), ExecutionMode::Task));

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let serving = tokio::spawn(async move {
            let (stream, peer) = front.accept().await.unwrap();
            handle_connection(stream, peer, ctx).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"SSH-2.0-test\r\n").await.unwrap();

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut banner = [0u8; 14];
        upstream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-test\r\n");

        upstream.write_all(b"SSH-2.0-server\r\n").await.unwrap();
        drop(upstream);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"SSH-2.0-server\r\n");

        drop(client);
        serving.await.unwrap();
    }

    /// Records the active-connections gauge, ignoring everything else
    #[derive(Default)]
    struct ActiveRecorder {
        gauge: Arc<GaugeCell>,
    }

    #[derive(Default)]
    struct GaugeCell {
        /// (current, peak)
        value: Mutex<(f64, f64)>,
    }

    impl GaugeFn for GaugeCell {
        fn increment(&self, value: f64) {
            let mut v = self.value.lock().unwrap();
            v.0 += value;
            v.1 = v.1.max(v.0);
        }

        fn decrement(&self, value: f64) {
            self.value.lock().unwrap().0 -= value;
        }

        fn set(&self, value: f64) {
            self.value.lock().unwrap().0 = value;
        }
    }

    impl Recorder for ActiveRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            if key.name() == ACTIVE_GAUGE {
                Gauge::from_arc(Arc::clone(&self.gauge))
            } else {
                Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_active_gauge_released_on_panic() {
        let recorder = ActiveRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            let unit = std::panic::catch_unwind(|| {
                let _active = ActiveConnection::open();
                panic!("connection failed mid-relay");
            });
            assert!(unit.is_err());

            drop(ActiveConnection::open());
        });

        let (current, peak) = *recorder.gauge.value.lock().unwrap();
        assert_eq!(peak, 1.0);
        assert_eq!(current, 0.0);
    }

    #[tokio::test]
    async fn test_handle_connection() {
        run_one(EntryFlags::default()).await;
    }

    #[tokio::test]
    async fn test_handle_connection_forked() {
        run_one(EntryFlags {
            fork: true,
            keepalive: true,
            ..EntryFlags::default()
        })
        .await;
    }
}
