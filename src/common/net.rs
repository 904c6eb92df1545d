//! Network utility functions
//!
//! Address parsing and resolution helpers shared by configuration loading and
//! the router's lazy resolution path.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use log::debug;

use super::error::{ProxyError, Result};

/// Parse a socket address, resolving host names synchronously
///
/// # Arguments
///
/// * `addr` - The address string to parse (`ip:port` or `host:port`)
///
/// # Returns
///
/// The first resolved `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ProxyError::Config(format!("Address resolved to nothing: {}", addr))),
        Err(e) => Err(ProxyError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Resolve a `host:port` pair asynchronously
///
/// Used when backend addresses are resolved at routing time instead of at startup.
pub async fn resolve_socket_addr(addr: &str) -> std::io::Result<SocketAddr> {
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    let resolved = tokio::net::lookup_host(addr).await?.next();
    debug!("Resolved {} to {:?}", addr, resolved);
    resolved.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} resolved to no address", addr),
        )
    })
}

/// Join a host and port into a `host:port` string, bracketing bare IPv6 hosts
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
