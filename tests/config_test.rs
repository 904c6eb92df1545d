//! Configuration layering: defaults, JSON file, environment

use std::env;
use std::io::Write;

use serial_test::serial;
use tempfile::NamedTempFile;

use portshare::config::{validate_config, ConfigLoader, ConfigValidator, DemuxConfig, ExecutionMode};
use portshare::protocol::ProtocolTable;

const VARS: &[&str] = &[
    "PORTSHARE_LISTEN",
    "PORTSHARE_TIMEOUT_MS",
    "PORTSHARE_EXECUTION",
    "PORTSHARE_ON_TIMEOUT",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

const CONFIG: &str = r#"{
    "listen": ["127.0.0.1:4443"],
    "timeout_ms": 1500,
    "protocols": [
        { "name": "ssh", "host": "127.0.0.1", "port": 22 },
        { "name": "web", "host": "127.0.0.1", "port": 8443, "probe": "tls",
          "sni_hostnames": ["example.com", "*.example.org"], "alpn_protocols": ["h2"] },
        { "name": "anything", "host": "127.0.0.1", "port": 8080, "probe": "anyprot",
          "fallback": true, "log_level": 0 }
    ]
}"#;

#[test]
#[serial]
fn test_file_only() {
    clear_env();
    let file = write_config(CONFIG);
    let config = DemuxConfig::from_file(file.path()).unwrap();

    assert_eq!(config.listen, vec!["127.0.0.1:4443".to_string()]);
    assert_eq!(config.timeout_ms, 1500);
    assert_eq!(config.execution, ExecutionMode::Task);
    assert_eq!(config.fallback_name(), Some("anything"));
    validate_config(&config).unwrap();

    let table = ProtocolTable::from_config(&config).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.fallback().map(|e| e.name.as_str()), Some("anything"));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    env::set_var("PORTSHARE_LISTEN", "127.0.0.1:443,127.0.0.1:8443");
    env::set_var("PORTSHARE_TIMEOUT_MS", "2500");
    env::set_var("PORTSHARE_EXECUTION", "thread");

    let file = write_config(CONFIG);
    let config = DemuxConfig::from_file(file.path());
    clear_env();
    let config = config.unwrap();

    assert_eq!(
        config.listen,
        vec!["127.0.0.1:443".to_string(), "127.0.0.1:8443".to_string()]
    );
    assert_eq!(config.timeout_ms, 2500);
    assert_eq!(config.execution, ExecutionMode::Thread);
    assert_eq!(config.protocols.len(), 3);
}

#[test]
#[serial]
fn test_conflicting_fallbacks_rejected() {
    clear_env();
    env::set_var("PORTSHARE_ON_TIMEOUT", "ssh");

    let file = write_config(CONFIG);
    let config = DemuxConfig::from_file(file.path());
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.on_timeout.as_deref(), Some("ssh"));
    assert!(validate_config(&config).is_err());
    assert!(ProtocolTable::from_config(&config).is_err());
}

#[test]
#[serial]
fn test_unknown_probe_rejected() {
    clear_env();
    let file = write_config(
        r#"{
            "listen": ["127.0.0.1:4443"],
            "protocols": [ { "name": "gopher", "host": "127.0.0.1", "port": 70 } ]
        }"#,
    );
    let config = DemuxConfig::from_file(file.path()).unwrap();
    assert!(ProtocolTable::from_config(&config).is_err());
}

#[test]
#[serial]
fn test_warnings_for_shadowed_tls_entry() {
    clear_env();
    let file = write_config(
        r#"{
            "listen": ["127.0.0.1:4443"],
            "protocols": [
                { "name": "any-tls", "host": "127.0.0.1", "port": 8443, "probe": "tls" },
                { "name": "mail", "host": "127.0.0.1", "port": 9443, "probe": "tls",
                  "sni_hostnames": ["mail.example.com"] }
            ]
        }"#,
    );
    let config = DemuxConfig::from_file(file.path()).unwrap();
    let warnings = config.check_warnings();
    assert!(warnings.iter().any(|w| w.contains("mail")));
}
