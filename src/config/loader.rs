//! Configuration loader
//!
//! Layers, lowest priority first:
//! 1. Default values (serde defaults)
//! 2. JSON configuration file
//! 3. `PORTSHARE_*` environment variables
//!
//! Command-line values are applied on top by the binary.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use log::debug;

use super::defaults;
use super::error::Result;
use super::DemuxConfig;

/// Trait for loading configuration from different sources
pub trait ConfigLoader: Sized {
    /// Load configuration from a file, with environment overrides
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self>;

    /// Load configuration from an optional file, with environment overrides
    ///
    /// Without an explicit path the default file is used when it exists.
    fn load(path: Option<&Path>) -> Result<Self>;
}

fn environment() -> Environment {
    Environment::with_prefix(defaults::ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("listen")
}

impl ConfigLoader for DemuxConfig {
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(true))
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_path = Path::new(defaults::DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            return Self::from_file(default_path);
        }

        debug!("No configuration file, using defaults and environment");
        let config = Config::builder().add_source(environment()).build()?;
        Ok(config.try_deserialize()?)
    }
}
