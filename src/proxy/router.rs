//! Router
//!
//! Reads the client's first bytes into a [`ConnectionBuffer`], evaluates the
//! protocol table in order on every growth of the buffer and produces the
//! routing decision, applying the timeout and fallback policy.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use tokio::io::AsyncRead;
use tokio::time::{timeout_at, Instant};

use crate::common::{ProxyError, Result};
use crate::protocol::{ConnectionBuffer, ProbeResult, ProtocolEntry, ProtocolTable};

/// Where a connection goes, created once and consumed by the shoveler
#[derive(Debug)]
pub struct RoutingDecision {
    /// Selected entry
    pub protocol: Arc<ProtocolEntry>,
    /// Every byte read from the client so far, to be sent first
    pub replay: Bytes,
    /// Resolved backend address
    pub backend: SocketAddr,
    /// Selected by the timeout/exhaustion path rather than a probe match
    pub via_fallback: bool,
}

impl RoutingDecision {
    /// Protocol name as shown in connection logs
    pub fn describe(&self) -> String {
        if self.via_fallback {
            format!("fallback: {}", self.protocol.name)
        } else {
            self.protocol.name.clone()
        }
    }
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.describe(), self.backend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Rejected,
}

/// Result of one evaluation pass over the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Index of the first entry that matched
    Matched(usize),
    /// At least one non-fallback entry needs more data
    Pending,
    /// Every non-fallback entry has rejected the connection
    Exhausted,
}

/// Per-connection probe state over a shared table
#[derive(Debug)]
pub struct ProbeSession<'t> {
    table: &'t ProtocolTable,
    states: Vec<EntryState>,
}

impl<'t> ProbeSession<'t> {
    pub fn new(table: &'t ProtocolTable) -> Self {
        Self {
            table,
            states: vec![EntryState::Pending; table.len()],
        }
    }

    /// Evaluate the still-pending entries, in table order, against `data`
    ///
    /// Accept-all probes are skipped: the fallback is only ever chosen by the router.
    pub fn evaluate(&mut self, data: &[u8]) -> Verdict {
        for (i, entry) in self.table.entries().iter().enumerate() {
            if self.states[i] == EntryState::Rejected || entry.probe.is_accept_all() {
                continue;
            }
            match entry.probe.evaluate(data) {
                ProbeResult::Matched => return Verdict::Matched(i),
                ProbeResult::Rejected => {
                    trace!("{} rejected after {} bytes", entry.name, data.len());
                    self.states[i] = EntryState::Rejected;
                }
                ProbeResult::NeedMoreData => {}
            }
        }

        let pending = self
            .table
            .entries()
            .iter()
            .zip(&self.states)
            .any(|(entry, state)| !entry.fallback && *state == EntryState::Pending);
        if pending {
            Verdict::Pending
        } else {
            Verdict::Exhausted
        }
    }

    /// Reject every entry still waiting for data
    pub fn reject_pending(&mut self) {
        self.states.fill(EntryState::Rejected);
    }

    /// Number of entries not yet rejected
    pub fn pending(&self) -> usize {
        self.states.iter().filter(|s| **s == EntryState::Pending).count()
    }
}

/// Drives probing for one connection at a time over a shared table
#[derive(Debug, Clone)]
pub struct Router {
    table: Arc<ProtocolTable>,
}

impl Router {
    pub fn new(table: Arc<ProtocolTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<ProtocolTable> {
        &self.table
    }

    /// Probe `client` until a protocol is selected or the connection is dropped
    ///
    /// The deadline starts now.
    pub async fn route<R>(&self, client: &mut R) -> Result<RoutingDecision>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.route_until(client, Instant::now() + self.table.timeout()).await
    }

    /// Probe `client` with an explicit deadline
    ///
    /// # Parameters
    ///
    /// * `client` - Stream to read the first bytes from
    /// * `deadline` - Instant at which pending probing gives way to the fallback
    ///
    /// # Returns
    ///
    /// The routing decision, or the reason the connection is dropped:
    /// `ProtocolUnknown`, `ProbeTimeout`, `ProbeOverflow`, `ClientClosed`
    /// or `RoutingFailure`.
    pub async fn route_until<R>(&self, client: &mut R, deadline: Instant) -> Result<RoutingDecision>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = ConnectionBuffer::new(self.table.buffer_capacity());
        let mut session = ProbeSession::new(&self.table);

        loop {
            let outcome = timeout_at(deadline, buffer.fill_from(&mut *client)).await;
            let read = match outcome {
                Ok(read) => read?,
                Err(_) => {
                    debug!("Probe timeout with {} bytes, {} entries pending", buffer.len(), session.pending());
                    let timeout_ms = self.table.timeout().as_millis() as u64;
                    return self.fall_back(buffer, ProxyError::ProbeTimeout(timeout_ms)).await;
                }
            };

            if read == 0 {
                if buffer.is_empty() {
                    return Err(ProxyError::ClientClosed(0));
                }
                debug!("Client closed during probing after {} bytes", buffer.len());
                session.reject_pending();
                let len = buffer.len();
                return self.fall_back(buffer, ProxyError::ClientClosed(len)).await;
            }

            match session.evaluate(buffer.as_slice()) {
                Verdict::Matched(i) => {
                    let entry = Arc::clone(&self.table.entries()[i]);
                    return self.decide(entry, buffer, false).await;
                }
                Verdict::Exhausted => {
                    return self.fall_back(buffer, ProxyError::ProtocolUnknown).await;
                }
                Verdict::Pending if buffer.is_full() => {
                    session.reject_pending();
                    let capacity = buffer.capacity();
                    return self.fall_back(buffer, ProxyError::ProbeOverflow { capacity }).await;
                }
                Verdict::Pending => {}
            }
        }
    }

    /// Select the fallback entry, or fail with `otherwise` when there is none
    async fn fall_back(&self, buffer: ConnectionBuffer, otherwise: ProxyError) -> Result<RoutingDecision> {
        match self.table.fallback() {
            Some(entry) => self.decide(Arc::clone(entry), buffer, true).await,
            None => Err(otherwise),
        }
    }

    async fn decide(
        &self,
        protocol: Arc<ProtocolEntry>,
        buffer: ConnectionBuffer,
        via_fallback: bool,
    ) -> Result<RoutingDecision> {
        let backend = protocol
            .backend
            .resolve()
            .await
            .map_err(|e| ProxyError::routing(&protocol.name, e))?;

        Ok(RoutingDecision {
            protocol,
            replay: buffer.into_replay(),
            backend,
            via_fallback,
        })
    }
}
