//! Protocol detector
//!
//! Every probe kind is a pure classifier over the bytes received so far. The
//! `Probe` enum is the single dispatch point the router calls on each growth
//! of the connection buffer.

use std::fmt;

use super::pattern::PatternProbe;
use super::signature::Signature;
use super::tls::TlsProbe;

/// Outcome of evaluating one probe against the buffer contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The connection belongs to this protocol
    Matched,
    /// Too few bytes to confirm or deny
    NeedMoreData,
    /// The bytes prove this is not the protocol; final for the connection
    Rejected,
}

impl ProbeResult {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::NeedMoreData)
    }
}

/// Probe attached to a protocol entry
#[derive(Debug, Clone)]
pub enum Probe {
    /// Builtin fixed signature
    Signature(Signature),
    /// Administrator-defined regex pattern set
    Pattern(PatternProbe),
    /// TLS ClientHello inspection with optional SNI/ALPN allow-lists
    Tls(TlsProbe),
    /// Matches anything; only usable on the fallback entry
    AcceptAll,
}

impl Probe {
    /// Classify the bytes received so far
    pub fn evaluate(&self, data: &[u8]) -> ProbeResult {
        match self {
            Self::Signature(signature) => signature.probe(data),
            Self::Pattern(pattern) => pattern.probe(data),
            Self::Tls(tls) => tls.probe(data),
            Self::AcceptAll => ProbeResult::Matched,
        }
    }

    pub fn is_accept_all(&self) -> bool {
        matches!(self, Self::AcceptAll)
    }

    /// Short name of the probe kind, as used in configuration
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Signature(signature) => signature.name(),
            Self::Pattern(_) => "regex",
            Self::Tls(_) => "tls",
            Self::AcceptAll => "anyprot",
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(pattern) => write!(
                f,
                "regex({} patterns, {}, min {})",
                pattern.patterns().len(),
                pattern.mode(),
                pattern.min_length()
            ),
            Self::Tls(tls) if !tls.server_names().is_empty() || !tls.alpn_protocols().is_empty() => {
                write!(
                    f,
                    "tls(sni: [{}], alpn: [{}])",
                    tls.server_names().join(", "),
                    tls.alpn_protocols().join(", ")
                )
            }
            other => f.write_str(other.kind_name()),
        }
    }
}
