//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.
//! Only configuration errors are fatal; every other variant describes the fate of a
//! single connection.

use thiserror::Error;
use std::io;

/// Portshare error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The probe buffer filled up before any protocol matched
    #[error("probe buffer overflow: {capacity} bytes without a match")]
    ProbeOverflow {
        /// Buffer capacity that was exhausted
        capacity: usize,
    },

    /// Every probe rejected the connection and no fallback is configured
    #[error("protocol unknown")]
    ProtocolUnknown,

    /// The probing deadline elapsed and no fallback is configured
    #[error("probe timeout after {0} ms")]
    ProbeTimeout(u64),

    /// The client closed the connection before a protocol was selected
    #[error("client closed after {0} bytes, before a protocol was selected")]
    ClientClosed(usize),

    /// Backend address could not be resolved or reached
    #[error("routing failure for {protocol}: {cause}")]
    RoutingFailure {
        /// Name of the selected protocol
        protocol: String,
        /// What went wrong
        cause: String,
    },

    /// I/O failure on one of the legs while relaying
    #[error("relay error: {0}")]
    Relay(io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl ProxyError {
    /// Build a routing failure for the named protocol
    pub fn routing(protocol: impl Into<String>, cause: impl ToString) -> Self {
        Self::RoutingFailure {
            protocol: protocol.into(),
            cause: cause.to_string(),
        }
    }

    /// Short terminal status used in per-connection log events
    pub fn status(&self) -> &'static str {
        match self {
            Self::ProbeOverflow { .. } => "probe buffer overflow",
            Self::ProtocolUnknown => "dropped: unmatched",
            Self::ProbeTimeout(_) => "dropped: probe timeout",
            Self::ClientClosed(_) => "dropped: client closed",
            Self::RoutingFailure { .. } => "backend unreachable",
            Self::Relay(_) | Self::Io(_) => "I/O error",
            Self::Config(_) | Self::Other(_) => "error",
        }
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let proxy_err: ProxyError = io_err.into();

        match proxy_err {
            ProxyError::Io(_) => {}
            _ => panic!("Should convert to IO error"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ProxyError::Config("Invalid configuration".to_string());
        assert!(err.to_string().contains("Invalid configuration"));

        let err = ProxyError::routing("ssh", "connection refused");
        assert_eq!(err.to_string(), "routing failure for ssh: connection refused");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ProxyError::ProtocolUnknown.status(), "dropped: unmatched");
        assert_eq!(ProxyError::ProbeOverflow { capacity: 16 }.status(), "probe buffer overflow");
        assert_eq!(ProxyError::routing("tls", "refused").status(), "backend unreachable");
        let relay = ProxyError::Relay(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(relay.status(), "I/O error");
    }
}
