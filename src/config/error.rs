//! Configuration errors
//!
//! Every variant is fatal at startup.

use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No protocol entries at all
    #[error("At least one target protocol must be specified")]
    EmptyTable,

    /// Two entries share a name
    #[error("Duplicate protocol name: {0}")]
    DuplicateName(String),

    /// More than one entry claims to be the fallback
    #[error("Only one fallback protocol is allowed, found {0} and {1}")]
    MultipleFallbacks(String, String),

    /// `on_timeout` names no entry of the table
    #[error("on_timeout protocol '{0}' is not configured")]
    UnknownFallback(String),

    /// Probe name is not a builtin, `regex`, `tls` or `anyprot`
    #[error("{name}: probe unknown: {probe}")]
    UnknownProbe {
        /// Entry name
        name: String,
        /// Probe that was asked for
        probe: String,
    },

    /// A regex pattern failed to compile
    #[error("{name}: compiling pattern /{pattern}/: {message}")]
    InvalidPattern {
        /// Entry name
        name: String,
        /// Offending pattern
        pattern: String,
        /// Compiler message
        message: String,
    },

    /// A regex entry without any pattern
    #[error("{0}: regex probe needs at least one pattern")]
    MissingPatterns(String),

    /// The accept-unconditionally probe on an entry that is not the fallback
    #[error("{0}: anyprot probe is only allowed on the fallback protocol")]
    AcceptAllNotFallback(String),

    /// A backend or listen address could not be resolved
    #[error("cannot resolve {addr}: {cause}")]
    Unresolvable {
        /// The `host:port` string
        addr: String,
        /// Resolver message
        cause: String,
    },

    /// Invalid value for a configuration option
    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// File or environment could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

// Convert to crate's common error type
impl From<ConfigError> for crate::common::ProxyError {
    fn from(err: ConfigError) -> Self {
        crate::common::ProxyError::Config(err.to_string())
    }
}
