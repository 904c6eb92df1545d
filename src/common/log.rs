//! Logger setup
//!
//! The `log` facade is backed by `env_logger`; `RUST_LOG` wins over the configured level.

/// Initialize the logger
///
/// # Parameters
///
/// * `level` - Default log level when `RUST_LOG` is not set
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialization (tests, embedding) is not an error worth surfacing
    let _ = env_logger::Builder::from_env(env).try_init();
}
