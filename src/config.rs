use std::{fs::read_to_string, net::UdpSocket};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Environment variable carrying the metadata-store connection string when
/// the config file does not set one.
pub const STORAGE_ENV: &str = "CRA_STORAGE_CONN_STRING";

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

/// Optional config file contents; everything positional comes from the
/// command line.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    ///
    /// metadata-store connection string
    ///
    /// Takes precedence over the CRA_STORAGE_CONN_STRING environment
    /// variable when both are set.
    ///
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Instance name this worker registers under
    ///
    instance: String,
    ///
    /// Control port the worker listens on and advertises
    ///
    port: u16,
    ///
    /// Address to advertise; omitted or the literal "null" auto-detects
    /// the host's first IPv4 address
    ///
    address: Option<String>,
    ///
    /// Specify the configuration file path
    ///
    #[arg(long, short)]
    config: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub instance: String,
    pub port: u16,
    pub address: String,
    pub storage: String,
    pub log: Log,
}

impl Config {
    ///
    /// Load configuration from the command line, the optional config file,
    /// and the environment.
    ///
    pub fn load() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => toml::from_str::<FileConfig>(
                &read_to_string(path).with_context(|| format!("read config file: {}", path))?,
            )?,
            None => FileConfig::default(),
        };

        let storage = file
            .storage
            .or_else(|| std::env::var(STORAGE_ENV).ok())
            .with_context(|| {
                format!(
                    "storage connection string missing: set `storage` in the config file or {}",
                    STORAGE_ENV
                )
            })?;

        let address = match cli.address.as_deref() {
            None | Some("null") => detect_ipv4(),
            Some(address) => address.to_string(),
        };

        Ok(Self {
            instance: cli.instance,
            port: cli.port,
            address,
            storage,
            log: file.log,
        })
    }
}

/// First routable IPv4 address of the host, found by the UDP-connect trick
/// (no packet is sent). Falls back to loopback on isolated hosts.
fn detect_ipv4() -> String {
    let detected = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });

    match detected {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}
