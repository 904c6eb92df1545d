//! Configuration module
//!
//! Global demultiplexer settings plus the ordered list of protocol entries.
//! Values are layered: defaults, then a JSON file, then `PORTSHARE_*`
//! environment variables, then command-line arguments (applied by the binary).

pub mod defaults;
mod error;
mod loader;
mod validator;

pub use self::defaults::{BUILTIN_PROBE, DEFAULT_CONFIG_FILE, ENV_PREFIX, LISTEN_STR, LOG_LEVEL_STR};
pub use self::error::{ConfigError, Result};
pub use self::loader::ConfigLoader;
pub use self::validator::{validate_config, ConfigValidator};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::common::join_host_port;
use crate::protocol::MatchMode;

/// How each accepted connection is isolated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One tokio task per connection
    #[default]
    Task,
    /// One OS thread with its own runtime per connection
    Thread,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "thread" => Ok(Self::Thread),
            _ => Err(ConfigError::InvalidValue(
                "execution".to_string(),
                format!("Invalid execution mode: {}. Valid values are: task, thread", s),
            )),
        }
    }
}

/// One protocol entry as written in the configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Unique entry name; also the builtin probe when `probe` is `builtin`
    pub name: String,

    /// Backend host
    pub host: String,

    /// Backend port
    pub port: u16,

    /// `builtin`, `regex`, `tls`, `anyprot` or a builtin signature name
    #[serde(default = "defaults::probe")]
    pub probe: String,

    /// Patterns for the regex probe
    #[serde(default)]
    pub regex_patterns: Vec<String>,

    /// Where regex patterns may match
    #[serde(default)]
    pub match_mode: MatchMode,

    /// Bytes to wait for before a regex probe may reject
    #[serde(default)]
    pub min_length: Option<usize>,

    /// SNI allow-list for the tls probe
    #[serde(default)]
    pub sni_hostnames: Vec<String>,

    /// ALPN allow-list for the tls probe
    #[serde(default)]
    pub alpn_protocols: Vec<String>,

    /// Enable TCP keepalive on both legs
    #[serde(default)]
    pub keepalive: bool,

    /// Relay on a dedicated OS thread
    #[serde(default)]
    pub fork: bool,

    /// Connect to the backend from the client's address
    #[serde(default)]
    pub transparent: bool,

    /// 0 logs connections at debug, 1 and above at info
    #[serde(default = "defaults::log_level_entry")]
    pub log_level: u8,

    /// Selected when probing times out or nothing else matches
    #[serde(default)]
    pub fallback: bool,
}

impl ProtocolConfig {
    /// Entry probed by the builtin signature of the same name
    ///
    /// `target` is a `host:port` string, as given on the command line.
    pub fn builtin(name: &str, target: &str) -> Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidValue(name.to_string(), format!("expected host:port, got {}", target)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("invalid port in {}: {}", target, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            probe: defaults::probe(),
            regex_patterns: Vec::new(),
            match_mode: MatchMode::default(),
            min_length: None,
            sni_hostnames: Vec::new(),
            alpn_protocols: Vec::new(),
            keepalive: false,
            fork: false,
            transparent: false,
            log_level: defaults::log_level_entry(),
            fallback: false,
        })
    }

    /// Backend as a `host:port` string
    pub fn target(&self) -> String {
        join_host_port(&self.host, &self.port.to_string())
    }

    /// Probe name after resolving `builtin` to the entry name
    pub fn probe_name(&self) -> &str {
        if self.probe.eq_ignore_ascii_case(BUILTIN_PROBE) {
            &self.name
        } else {
            &self.probe
        }
    }
}

/// Demultiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DemuxConfig {
    /// Addresses to accept connections on
    pub listen: Vec<String>,

    /// Probing deadline in milliseconds
    pub timeout_ms: u64,

    /// Entry selected when probing times out
    pub on_timeout: Option<String>,

    /// Resolve backend addresses per connection instead of at startup
    pub resolve_on_forward: bool,

    /// Maximum bytes held while probing
    pub probe_buffer_size: usize,

    /// Per-direction relay buffer
    pub transfer_buffer_size: usize,

    /// Backend connect timeout in seconds
    pub connect_timeout: u64,

    /// Execution strategy for accepted connections
    pub execution: ExecutionMode,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Ordered protocol entries
    pub protocols: Vec<ProtocolConfig>,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            timeout_ms: defaults::timeout_ms(),
            on_timeout: None,
            resolve_on_forward: false,
            probe_buffer_size: defaults::probe_buffer_size(),
            transfer_buffer_size: defaults::transfer_buffer_size(),
            connect_timeout: defaults::connect_timeout(),
            execution: ExecutionMode::default(),
            log_level: defaults::log_level(),
            protocols: Vec::new(),
        }
    }
}

impl DemuxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Name of the fallback entry, from `on_timeout` or an entry flag
    pub fn fallback_name(&self) -> Option<&str> {
        self.on_timeout
            .as_deref()
            .or_else(|| self.protocols.iter().find(|p| p.fallback).map(|p| p.name.as_str()))
    }
}

/// Log the effective settings
pub fn log_config(config: &DemuxConfig) {
    if !log::log_enabled!(log::Level::Info) {
        return;
    }

    info!("=== Final Configuration ===");
    info!("Listen addresses: {}", config.listen.join(", "));
    for p in &config.protocols {
        let flags: Vec<&str> = [
            (p.keepalive, "keepalive"),
            (p.fork, "fork"),
            (p.transparent, "transparent"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, flag)| *flag)
        .collect();

        info!(
            "{} addr: {}. probe: {} log_level: {} [{}]",
            p.name,
            p.target(),
            p.probe_name(),
            p.log_level,
            flags.join("] [")
        );
    }
    info!("timeout: {} ms", config.timeout_ms);
    info!("on-timeout: {}", config.fallback_name().unwrap_or("none"));
    info!("execution: {}", config.execution);
    info!("probe buffer: {} bytes, transfer buffer: {} bytes",
        config.probe_buffer_size, config.transfer_buffer_size);
    info!("resolve on forward: {}", config.resolve_on_forward);
    info!("==========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults_from_json() {
        let json = r#"{
            "listen": ["0.0.0.0:443"],
            "protocols": [
                { "name": "ssh", "host": "localhost", "port": 22 },
                { "name": "web", "host": "::1", "port": 8443, "probe": "tls",
                  "sni_hostnames": ["example.com"], "log_level": 1 }
            ]
        }"#;
        let config: DemuxConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.execution, ExecutionMode::Task);
        assert_eq!(config.protocols[0].probe_name(), "ssh");
        assert_eq!(config.protocols[0].match_mode, MatchMode::Anywhere);
        assert_eq!(config.protocols[1].probe_name(), "tls");
        assert_eq!(config.protocols[1].target(), "[::1]:8443");
        assert!(config.fallback_name().is_none());
    }

    #[test]
    fn test_entry_log_level_default() {
        let entry: ProtocolConfig =
            serde_json::from_str(r#"{ "name": "ssh", "host": "127.0.0.1", "port": 22 }"#).unwrap();
        assert_eq!(entry.log_level, 1);
        assert_eq!(entry.log_level, ProtocolConfig::builtin("ssh", "127.0.0.1:22").unwrap().log_level);

        let quiet: ProtocolConfig = serde_json::from_str(
            r#"{ "name": "ssh", "host": "127.0.0.1", "port": 22, "log_level": 0 }"#,
        )
        .unwrap();
        assert_eq!(quiet.log_level, 0);
    }

    #[test]
    fn test_fallback_name() {
        let mut config = DemuxConfig::default();
        config.protocols.push(ProtocolConfig::builtin("ssh", "127.0.0.1:22").unwrap());
        let mut http = ProtocolConfig::builtin("http", "127.0.0.1:80").unwrap();
        http.fallback = true;
        config.protocols.push(http);
        assert_eq!(config.fallback_name(), Some("http"));

        config.on_timeout = Some("ssh".to_string());
        assert_eq!(config.fallback_name(), Some("ssh"));
    }

    #[test]
    fn test_builtin_shorthand() {
        let entry = ProtocolConfig::builtin("openvpn", "[::1]:1194").unwrap();
        assert_eq!(entry.host, "::1");
        assert_eq!(entry.port, 1194);
        assert_eq!(entry.probe_name(), "openvpn");

        assert!(ProtocolConfig::builtin("ssh", "localhost").is_err());
        assert!(ProtocolConfig::builtin("ssh", "localhost:ssh").is_err());
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("THREAD".parse::<ExecutionMode>().unwrap(), ExecutionMode::Thread);
        assert!("process".parse::<ExecutionMode>().is_err());
    }
}
