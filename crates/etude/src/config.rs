// src/config.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{EtudeError, EtudeResult};

/// Size of each connection's read buffer.
pub const READ_BUF_SIZE: usize = 2048;
/// Size of each connection's response header buffer.
pub const WRITE_BUF_SIZE: usize = 1024;
/// Longest resolved file path (document root + URL) we are willing to stat.
pub const MAX_PATH_LEN: usize = 200;

pub const DEFAULT_MAX_QUEUE: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Command line of the `etude` binary. Every flag can also come from the
/// environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(name = "etude", version, about = "Serve static files over HTTP/1.1")]
pub struct Cli {
    /// Port to listen on.
    pub port: u16,

    /// Address to bind.
    #[arg(long, env = "ETUDE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory that request URLs are resolved against.
    #[arg(long = "root", env = "ETUDE_DOC_ROOT", default_value = "./www")]
    pub doc_root: PathBuf,

    /// Worker threads (defaults to the number of CPUs).
    #[arg(long, env = "ETUDE_THREADS")]
    pub threads: Option<usize>,

    /// Maximum number of connections waiting for a worker.
    #[arg(long, env = "ETUDE_MAX_QUEUE", default_value_t = DEFAULT_MAX_QUEUE)]
    pub max_queue: usize,

    /// Maximum number of live client connections.
    #[arg(long, env = "ETUDE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Timer unit in seconds. Idle connections expire after three units.
    #[arg(long = "timeout", env = "ETUDE_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Pin worker threads to CPU cores.
    #[arg(long, env = "ETUDE_PIN_WORKERS")]
    pub pin_workers: bool,

    /// Log output format.
    #[arg(long, env = "ETUDE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Server configuration shared (read-only) by every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub doc_root: PathBuf,
    pub threads: usize,
    pub max_queue: usize,
    pub max_connections: usize,
    /// One timer unit. Connections idle for three units are evicted and the
    /// timer list is swept once per unit.
    pub timeout_unit: Duration,
    pub pin_workers: bool,
    pub log_format: LogFormat,
}

impl Config {
    /// Defaults for everything but the port and document root.
    pub fn new(port: u16, doc_root: impl Into<PathBuf>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            doc_root: doc_root.into(),
            threads: num_cpus::get(),
            max_queue: DEFAULT_MAX_QUEUE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout_unit: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            pin_workers: false,
            log_format: LogFormat::Compact,
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn timeout_unit(mut self, unit: Duration) -> Self {
        self.timeout_unit = unit;
        self
    }

    /// How long a connection may stay silent before the next tick evicts it.
    pub fn idle_timeout(&self) -> Duration {
        self.timeout_unit * 3
    }

    pub fn listen_addr(&self) -> EtudeResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| EtudeError::Config(format!("bad listen address: {e}")))
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.threads == 0 {
            return Err(EtudeError::Config("threads must be at least 1".into()));
        }
        if self.max_queue == 0 {
            return Err(EtudeError::Config("max_queue must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config("max_connections must be at least 1".into()));
        }
        if self.timeout_unit.is_zero() {
            return Err(EtudeError::Config("timeout unit must be non-zero".into()));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        self.listen_addr().map(|_| ())
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let mut config = Config::new(cli.port, cli.doc_root)
            .host(&cli.host)
            .max_queue(cli.max_queue)
            .max_connections(cli.max_connections)
            .timeout_unit(Duration::from_secs(cli.timeout_secs));
        if let Some(threads) = cli.threads {
            config.threads = threads;
        }
        config.pin_workers = cli.pin_workers;
        config.log_format = cli.log_format;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_requires_port() {
        assert!(Cli::try_parse_from(["etude"]).is_err());
        assert!(Cli::try_parse_from(["etude", "http"]).is_err());
    }

    #[test]
    fn cli_into_config() {
        let cli = Cli::try_parse_from([
            "etude", "8080", "--root", "/srv", "--threads", "3", "--timeout", "2",
        ])
        .unwrap();
        let config = Config::from(cli);
        assert_eq!(config.port, 8080);
        assert_eq!(config.doc_root, PathBuf::from("/srv"));
        assert_eq!(config.threads, 3);
        assert_eq!(config.idle_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let dir = std::env::temp_dir();
        assert!(Config::new(0, &dir).validate().is_ok());
        assert!(Config::new(0, &dir).threads(0).validate().is_err());
        assert!(Config::new(0, &dir).max_queue(0).validate().is_err());
        assert!(
            Config::new(0, &dir)
                .timeout_unit(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(Config::new(0, "/definitely/not/here").validate().is_err());
    }
}
