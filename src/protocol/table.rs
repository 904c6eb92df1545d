//! Protocol table
//!
//! Immutable ordered list of protocol entries, built once at startup and
//! shared by every connection through an `Arc`. The fallback entry, if any,
//! always sits last.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::common::{parse_socket_addr, resolve_socket_addr};
use crate::config::{ConfigError, DemuxConfig, ProtocolConfig};

use super::detector::Probe;
use super::pattern::PatternProbe;
use super::signature::Signature;
use super::tls::TlsProbe;

/// Where a protocol's backend lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Resolved at startup
    Resolved(SocketAddr),
    /// `host:port` resolved for every routed connection
    Deferred(String),
}

impl Backend {
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            Self::Resolved(addr) => Ok(*addr),
            Self::Deferred(target) => resolve_socket_addr(target).await,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(addr) => write!(f, "{}", addr),
            Self::Deferred(target) => write!(f, "{} (resolved on forward)", target),
        }
    }
}

/// Per-entry socket and execution flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags {
    /// TCP keepalive on both legs
    pub keepalive: bool,
    /// Relay on a dedicated OS thread
    pub fork: bool,
    /// Bind the backend socket to the client's address
    pub transparent: bool,
}

/// One protocol the listener can route to
#[derive(Debug, Clone)]
pub struct ProtocolEntry {
    pub name: String,
    pub probe: Probe,
    pub backend: Backend,
    pub flags: EntryFlags,
    /// 0 logs connection events at debug, 1 and above at info
    pub log_level: u8,
    pub fallback: bool,
}

impl ProtocolEntry {
    pub fn new(name: impl Into<String>, probe: Probe, backend: Backend) -> Self {
        Self {
            name: name.into(),
            probe,
            backend,
            flags: EntryFlags::default(),
            log_level: crate::config::defaults::log_level_entry(),
            fallback: false,
        }
    }

    /// Mark as the fallback entry
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Compile one configured entry
    pub fn from_config(config: &ProtocolConfig, resolve_on_forward: bool) -> Result<Self, ConfigError> {
        let probe = compile_probe(config)?;
        let target = config.target();
        let backend = if resolve_on_forward {
            Backend::Deferred(target)
        } else {
            let addr = parse_socket_addr(&target).map_err(|e| ConfigError::Unresolvable {
                addr: target.clone(),
                cause: e.to_string(),
            })?;
            Backend::Resolved(addr)
        };

        Ok(Self {
            name: config.name.clone(),
            probe,
            backend,
            flags: EntryFlags {
                keepalive: config.keepalive,
                fork: config.fork,
                transparent: config.transparent,
            },
            log_level: config.log_level,
            fallback: config.fallback,
        })
    }
}

fn compile_probe(config: &ProtocolConfig) -> Result<Probe, ConfigError> {
    let probe = config.probe_name();
    match probe.to_ascii_lowercase().as_str() {
        "tls" => Ok(Probe::Tls(TlsProbe::new(&config.sni_hostnames, &config.alpn_protocols))),
        "anyprot" => Ok(Probe::AcceptAll),
        "regex" => {
            if config.regex_patterns.is_empty() {
                return Err(ConfigError::MissingPatterns(config.name.clone()));
            }
            PatternProbe::new(&config.regex_patterns, config.match_mode, config.min_length)
                .map(Probe::Pattern)
                .map_err(|e| ConfigError::InvalidPattern {
                    name: config.name.clone(),
                    pattern: e.pattern,
                    message: e.message,
                })
        }
        other => other
            .parse::<Signature>()
            .map(Probe::Signature)
            .map_err(|_| ConfigError::UnknownProbe {
                name: config.name.clone(),
                probe: probe.to_string(),
            }),
    }
}

/// Ordered, validated protocol entries plus the probing limits
#[derive(Debug)]
pub struct ProtocolTable {
    entries: Vec<Arc<ProtocolEntry>>,
    timeout: Duration,
    buffer_capacity: usize,
}

impl ProtocolTable {
    /// Build a table from entries in evaluation order
    ///
    /// The fallback entry is moved last.
    pub fn new(
        entries: Vec<ProtocolEntry>,
        timeout: Duration,
        buffer_capacity: usize,
    ) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        if buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "probe_buffer_size".to_string(),
                "Probe buffer size must be greater than 0".to_string(),
            ));
        }

        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(ConfigError::DuplicateName(entry.name.clone()));
            }
            if entry.probe.is_accept_all() && !entry.fallback {
                return Err(ConfigError::AcceptAllNotFallback(entry.name.clone()));
            }
        }

        let mut fallbacks = entries.iter().filter(|e| e.fallback);
        if let (Some(first), Some(second)) = (fallbacks.next(), fallbacks.next()) {
            return Err(ConfigError::MultipleFallbacks(first.name.clone(), second.name.clone()));
        }

        let (mut ordered, fallback): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| !e.fallback);
        ordered.extend(fallback);

        Ok(Self {
            entries: ordered.into_iter().map(Arc::new).collect(),
            timeout,
            buffer_capacity,
        })
    }

    /// Compile the table described by a configuration
    pub fn from_config(config: &DemuxConfig) -> Result<Self, ConfigError> {
        let fallback = config.fallback_name().map(str::to_string);
        if let Some(name) = &fallback {
            if !config.protocols.iter().any(|p| &p.name == name) {
                return Err(ConfigError::UnknownFallback(name.clone()));
            }
        }

        let mut entries = Vec::with_capacity(config.protocols.len());
        for p in &config.protocols {
            let mut entry = ProtocolEntry::from_config(p, config.resolve_on_forward)?;
            if fallback.as_deref() == Some(p.name.as_str()) {
                entry.fallback = true;
            }
            debug!("Protocol {} uses probe {} -> {}", entry.name, entry.probe, entry.backend);
            entries.push(entry);
        }

        Self::new(entries, config.timeout(), config.probe_buffer_size)
    }

    /// Entries in evaluation order
    pub fn entries(&self) -> &[Arc<ProtocolEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProtocolEntry>> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// The fallback entry, always the last one when present
    pub fn fallback(&self) -> Option<&Arc<ProtocolEntry>> {
        self.entries.last().filter(|e| e.fallback)
    }

    /// Probing deadline, measured from accept
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum bytes buffered while probing
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::Resolved("127.0.0.1:9".parse().unwrap())
    }

    fn entry(name: &str, signature: Signature) -> ProtocolEntry {
        ProtocolEntry::new(name, Probe::Signature(signature), backend())
    }

    #[test]
    fn test_fallback_moved_last() {
        let table = ProtocolTable::new(
            vec![
                entry("http", Signature::Http).with_fallback(),
                entry("ssh", Signature::Ssh),
                entry("openvpn", Signature::OpenVpn),
            ],
            Duration::from_secs(1),
            1024,
        )
        .unwrap();

        let names: Vec<&str> = table.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ssh", "openvpn", "http"]);
        assert_eq!(table.fallback().unwrap().name, "http");
    }

    #[test]
    fn test_invariants() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(
            ProtocolTable::new(vec![], timeout, 1024),
            Err(ConfigError::EmptyTable)
        ));
        assert!(matches!(
            ProtocolTable::new(vec![entry("a", Signature::Ssh), entry("a", Signature::Http)], timeout, 1024),
            Err(ConfigError::DuplicateName(_))
        ));
        assert!(matches!(
            ProtocolTable::new(
                vec![entry("a", Signature::Ssh).with_fallback(), entry("b", Signature::Http).with_fallback()],
                timeout,
                1024
            ),
            Err(ConfigError::MultipleFallbacks(_, _))
        ));
        assert!(matches!(
            ProtocolTable::new(vec![ProtocolEntry::new("any", Probe::AcceptAll, backend())], timeout, 1024),
            Err(ConfigError::AcceptAllNotFallback(_))
        ));
        assert!(ProtocolTable::new(
            vec![ProtocolEntry::new("any", Probe::AcceptAll, backend()).with_fallback()],
            timeout,
            1024
        )
        .is_ok());
    }

    #[test]
    fn test_no_fallback() {
        let table =
            ProtocolTable::new(vec![entry("ssh", Signature::Ssh)], Duration::from_secs(1), 64).unwrap();
        assert!(table.fallback().is_none());
        assert_eq!(table.len(), 1);
        assert!(table.get("ssh").is_some());
        assert!(table.get("http").is_none());
    }

    fn protocol(name: &str) -> ProtocolConfig {
        ProtocolConfig::builtin(name, "127.0.0.1:10").unwrap()
    }

    #[test]
    fn test_from_config() {
        let mut config = DemuxConfig::default();
        let mut tls = protocol("web");
        tls.probe = "tls".to_string();
        tls.sni_hostnames = vec!["example.com".to_string()];
        let mut custom = protocol("custom");
        custom.probe = "regex".to_string();
        custom.regex_patterns = vec!["^HELLO".to_string()];
        config.protocols = vec![protocol("ssh"), tls, custom, protocol("openvpn")];
        config.on_timeout = Some("ssh".to_string());

        let table = ProtocolTable::from_config(&config).unwrap();
        let names: Vec<&str> = table.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["web", "custom", "openvpn", "ssh"]);
        assert_eq!(table.fallback().unwrap().name, "ssh");
        assert_eq!(table.get("web").unwrap().probe.kind_name(), "tls");
        assert_eq!(table.get("custom").unwrap().probe.kind_name(), "regex");
        assert_eq!(
            table.get("ssh").unwrap().backend,
            Backend::Resolved("127.0.0.1:10".parse().unwrap())
        );
        assert_eq!(table.timeout(), config.timeout());
    }

    #[test]
    fn test_from_config_errors() {
        let mut config = DemuxConfig::default();
        config.protocols = vec![protocol("gopher")];
        assert!(matches!(ProtocolTable::from_config(&config), Err(ConfigError::UnknownProbe { .. })));

        let mut custom = protocol("custom");
        custom.probe = "regex".to_string();
        config.protocols = vec![custom.clone()];
        assert!(matches!(ProtocolTable::from_config(&config), Err(ConfigError::MissingPatterns(_))));

        custom.regex_patterns = vec!["(".to_string()];
        config.protocols = vec![custom];
        assert!(matches!(ProtocolTable::from_config(&config), Err(ConfigError::InvalidPattern { .. })));

        config.protocols = vec![protocol("ssh")];
        config.on_timeout = Some("http".to_string());
        assert!(matches!(ProtocolTable::from_config(&config), Err(ConfigError::UnknownFallback(_))));

        config.on_timeout = None;
        config.protocols = vec![protocol("anyprot")];
        assert!(matches!(
            ProtocolTable::from_config(&config),
            Err(ConfigError::AcceptAllNotFallback(_))
        ));
        config.on_timeout = Some("anyprot".to_string());
        assert!(ProtocolTable::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_resolve_on_forward() {
        let mut config = DemuxConfig::default();
        let mut ssh = protocol("ssh");
        ssh.host = "localhost".to_string();
        config.protocols = vec![ssh];
        config.resolve_on_forward = true;

        let table = ProtocolTable::from_config(&config).unwrap();
        let backend = &table.get("ssh").unwrap().backend;
        assert_eq!(backend, &Backend::Deferred("localhost:10".to_string()));

        let addr = backend.resolve().await.unwrap();
        assert_eq!(addr.port(), 10);
        assert!(addr.ip().is_loopback());
    }
}
