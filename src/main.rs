//! Portshare command line tool
//!
//! Loads the configuration, builds the protocol table and serves the listening
//! ports until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use portshare::common::{init_logger, ProxyError, Result};
use portshare::config::{
    log_config, validate_config, ConfigLoader, ConfigValidator, DemuxConfig, ExecutionMode, ProtocolConfig,
};
use portshare::protocol::ProtocolTable;
use portshare::proxy::{strategy_for, ConnectionContext, Server, ShovelOptions};
use portshare::{APP_NAME, VERSION};

/// Portshare: share one port between SSH, TLS, HTTP, OpenVPN and more
#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, env = "PORTSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (host:port), may be repeated
    #[arg(short = 'p', long = "listen", value_name = "HOST:PORT")]
    listen: Vec<String>,

    /// Probing deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Protocol to use when probing times out
    #[arg(long, value_name = "NAME")]
    on_timeout: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Per-connection isolation (task, thread)
    #[arg(long)]
    execution: Option<ExecutionMode>,

    /// Resolve backend names on each connection instead of at startup
    #[arg(long)]
    resolve_on_forward: bool,

    /// Print the effective configuration as JSON before starting
    #[arg(long)]
    verbose_config: bool,

    /// SSH backend
    #[arg(long, value_name = "HOST:PORT")]
    ssh: Option<String>,

    /// OpenVPN backend
    #[arg(long, value_name = "HOST:PORT")]
    openvpn: Option<String>,

    /// tinc backend
    #[arg(long, value_name = "HOST:PORT")]
    tinc: Option<String>,

    /// XMPP backend
    #[arg(long, value_name = "HOST:PORT")]
    xmpp: Option<String>,

    /// Plain HTTP backend
    #[arg(long, value_name = "HOST:PORT")]
    http: Option<String>,

    /// TLS backend (any ClientHello)
    #[arg(long, value_name = "HOST:PORT")]
    tls: Option<String>,

    /// Android debug bridge backend
    #[arg(long, value_name = "HOST:PORT")]
    adb: Option<String>,

    /// SOCKS5 backend
    #[arg(long, value_name = "HOST:PORT")]
    socks5: Option<String>,

    /// Syslog backend
    #[arg(long, value_name = "HOST:PORT")]
    syslog: Option<String>,

    /// Backend for anything else, selected on timeout or when nothing matches
    #[arg(long, value_name = "HOST:PORT")]
    anyprot: Option<String>,
}

impl Args {
    /// Builtin shorthands in evaluation order
    fn shorthands(&self) -> [(&'static str, &Option<String>); 10] {
        [
            ("ssh", &self.ssh),
            ("openvpn", &self.openvpn),
            ("tinc", &self.tinc),
            ("xmpp", &self.xmpp),
            ("http", &self.http),
            ("tls", &self.tls),
            ("adb", &self.adb),
            ("socks5", &self.socks5),
            ("syslog", &self.syslog),
            ("anyprot", &self.anyprot),
        ]
    }

    /// Apply command-line values on top of file and environment values
    fn apply(&self, config: &mut DemuxConfig) -> Result<()> {
        if !self.listen.is_empty() {
            config.listen = self.listen.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(name) = &self.on_timeout {
            config.on_timeout = Some(name.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(execution) = self.execution {
            config.execution = execution;
        }
        if self.resolve_on_forward {
            config.resolve_on_forward = true;
        }

        for (name, target) in self.shorthands() {
            if let Some(target) = target {
                config.protocols.push(ProtocolConfig::builtin(name, target)?);
            }
        }

        if self.anyprot.is_some() && config.fallback_name().is_none() {
            config.on_timeout = Some("anyprot".to_string());
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DemuxConfig::load(args.config.as_deref())?;
    args.apply(&mut config)?;

    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    for warning in config.check_warnings() {
        warn!("{}", warning);
    }

    if let Err(e) = validate_config(&config) {
        error!("{}", e);
        return Err(e.into());
    }

    if args.verbose_config {
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| ProxyError::Other(format!("Failed to serialize configuration: {}", e)))?;
        println!("{}", json);
    }
    log_config(&config);

    let table = match ProtocolTable::from_config(&config) {
        Ok(table) => Arc::new(table),
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let shovel = ShovelOptions {
        connect_timeout: config.connect_timeout(),
        transfer_buffer_size: config.transfer_buffer_size,
    };
    let ctx = Arc::new(ConnectionContext::new(table, shovel, config.execution));
    let server = Server::bind(&config.listen, ctx, strategy_for(config.execution)).await?;
    let (handle, task) = server.start();

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    handle.shutdown().await?;

    task.await
        .map_err(|e| ProxyError::Other(format!("Server task failed: {}", e)))?
}
