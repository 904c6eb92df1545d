//! Configuration validator
//!
//! Structural checks that do not need probes compiled or addresses resolved.
//! Table construction repeats the checks that guard its own invariants.

use std::collections::HashSet;

use super::error::{ConfigError, Result};
use super::DemuxConfig;

/// Validate the configuration
pub fn validate_config(config: &DemuxConfig) -> Result<()> {
    validate_protocols(config)?;
    validate_general_settings(config)?;
    Ok(())
}

fn validate_protocols(config: &DemuxConfig) -> Result<()> {
    if config.protocols.is_empty() {
        return Err(ConfigError::EmptyTable);
    }

    let mut names = HashSet::new();
    for p in &config.protocols {
        if !names.insert(p.name.as_str()) {
            return Err(ConfigError::DuplicateName(p.name.clone()));
        }
    }

    let mut flagged = config.protocols.iter().filter(|p| p.fallback);
    if let (Some(first), Some(second)) = (flagged.next(), flagged.next()) {
        return Err(ConfigError::MultipleFallbacks(first.name.clone(), second.name.clone()));
    }

    if let Some(name) = &config.on_timeout {
        if !names.contains(name.as_str()) {
            return Err(ConfigError::UnknownFallback(name.clone()));
        }
        if let Some(flagged) = config.protocols.iter().find(|p| p.fallback && &p.name != name) {
            return Err(ConfigError::MultipleFallbacks(name.clone(), flagged.name.clone()));
        }
    }

    Ok(())
}

fn validate_general_settings(config: &DemuxConfig) -> Result<()> {
    if config.timeout_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "timeout_ms".to_string(),
            "Probe timeout must be greater than 0".to_string(),
        ));
    }

    if config.probe_buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "probe_buffer_size".to_string(),
            "Probe buffer size must be greater than 0".to_string(),
        ));
    }

    if config.transfer_buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "transfer_buffer_size".to_string(),
            "Transfer buffer size must be greater than 0".to_string(),
        ));
    }

    if config.connect_timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "connect_timeout".to_string(),
            "Connect timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Configuration validator trait
pub trait ConfigValidator {
    /// Check configuration for warnings
    fn check_warnings(&self) -> Vec<String>;
}

impl ConfigValidator for DemuxConfig {
    fn check_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            level => {
                warnings.push(format!("Invalid log level '{}', using default 'info'", level));
            }
        }

        if self.listen.is_empty() {
            warnings.push("No listening address specified".to_string());
        }

        if !cfg!(target_os = "linux") {
            for p in self.protocols.iter().filter(|p| p.transparent) {
                warnings.push(format!("{}: transparent proxying is only supported on Linux", p.name));
            }
        }

        // An unrestricted tls entry takes every ClientHello, so later tls entries never match
        let fallback = self.fallback_name();
        let mut open_tls: Option<&str> = None;
        for p in self.protocols.iter().filter(|p| Some(p.name.as_str()) != fallback) {
            if !p.probe_name().eq_ignore_ascii_case("tls") {
                continue;
            }
            if let Some(first) = open_tls {
                warnings.push(format!("{}: unreachable, {} accepts every TLS connection first", p.name, first));
            } else if p.sni_hostnames.is_empty() && p.alpn_protocols.is_empty() {
                open_tls = Some(&p.name);
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;

    fn config(names: &[&str]) -> DemuxConfig {
        let mut config = DemuxConfig::default();
        config.listen.push("127.0.0.1:4443".to_string());
        for name in names {
            config.protocols.push(ProtocolConfig::builtin(name, "127.0.0.1:1").unwrap());
        }
        config
    }

    #[test]
    fn test_valid() {
        assert!(validate_config(&config(&["ssh", "tls"])).is_ok());
    }

    #[test]
    fn test_empty_table() {
        assert!(matches!(validate_config(&config(&[])), Err(ConfigError::EmptyTable)));
    }

    #[test]
    fn test_duplicate_name() {
        assert!(matches!(
            validate_config(&config(&["ssh", "ssh"])),
            Err(ConfigError::DuplicateName(name)) if name == "ssh"
        ));
    }

    #[test]
    fn test_fallbacks() {
        let mut c = config(&["ssh", "http", "tls"]);
        c.protocols[1].fallback = true;
        c.protocols[2].fallback = true;
        assert!(matches!(validate_config(&c), Err(ConfigError::MultipleFallbacks(_, _))));

        let mut c = config(&["ssh", "http"]);
        c.on_timeout = Some("nope".to_string());
        assert!(matches!(validate_config(&c), Err(ConfigError::UnknownFallback(_))));

        c.on_timeout = Some("ssh".to_string());
        assert!(validate_config(&c).is_ok());
        c.protocols[1].fallback = true;
        assert!(matches!(validate_config(&c), Err(ConfigError::MultipleFallbacks(_, _))));

        // naming the flagged entry twice is still one fallback
        c.on_timeout = Some("http".to_string());
        assert!(validate_config(&c).is_ok());
    }

    #[test]
    fn test_zero_values() {
        let mut c = config(&["ssh"]);
        c.timeout_ms = 0;
        assert!(matches!(validate_config(&c), Err(ConfigError::InvalidValue(key, _)) if key == "timeout_ms"));

        let mut c = config(&["ssh"]);
        c.probe_buffer_size = 0;
        assert!(validate_config(&c).is_err());
    }

    #[test]
    fn test_warnings() {
        let mut c = config(&["tls"]);
        c.log_level = "loud".to_string();
        let mut restricted = ProtocolConfig::builtin("web", "127.0.0.1:2").unwrap();
        restricted.probe = "tls".to_string();
        restricted.sni_hostnames.push("example.com".to_string());
        c.protocols.push(restricted);

        let warnings = c.check_warnings();
        assert!(warnings.iter().any(|w| w.contains("log level")));
        assert!(warnings.iter().any(|w| w.starts_with("web: unreachable")));
    }
}
