//! Default configuration values
//!
//! Single source of truth for defaults, shared by serde and the command line.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "PORTSHARE";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "portshare.json";

/// Listen address suggested in help output
pub const LISTEN_STR: &str = "0.0.0.0:443";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Probe used when an entry does not name one: the entry name decides
pub const BUILTIN_PROBE: &str = "builtin";

/// Probing deadline in milliseconds
pub fn timeout_ms() -> u64 {
    5000
}

/// Capacity of the per-connection probe buffer
///
/// Large enough for a ClientHello in one full-size TLS record.
pub fn probe_buffer_size() -> usize {
    crate::protocol::tls::MAX_RECORD_FRAME
}

/// Per-direction relay buffer (8KB)
pub fn transfer_buffer_size() -> usize {
    8192
}

/// Backend connect timeout in seconds
pub fn connect_timeout() -> u64 {
    30
}

/// How long shutdown waits for in-flight connections, in seconds
pub fn shutdown_grace() -> u64 {
    30
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Connection events of an entry are logged at info
pub fn log_level_entry() -> u8 {
    1
}

/// Default probe name
pub fn probe() -> String {
    BUILTIN_PROBE.to_string()
}
