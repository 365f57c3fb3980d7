//! Server configuration, parsed from the command line.

use crate::{DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// TallyKV server options.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "tallykv", author, version, about, long_about = None)]
pub struct Config {
    /// Host to bind to.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Append-only file used for persistence and startup replay.
    #[arg(long = "aof", value_name = "PATH", default_value = "tallykv.aof")]
    pub aof_path: PathBuf,

    /// Run purely in memory: nothing is replayed or logged.
    #[arg(long, conflicts_with = "aof_path")]
    pub no_aof: bool,

    /// Milliseconds between background fsyncs of the append-only file.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub fsync_interval_ms: u64,

    /// Seconds a connection may stay silent before it is closed.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout_secs: u64,

    /// Default log filter; `RUST_LOG` takes precedence when set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `None` when persistence is disabled.
    pub fn aof(&self) -> Option<&PathBuf> {
        (!self.no_aof).then_some(&self.aof_path)
    }

    pub fn fsync_interval(&self) -> Duration {
        Duration::from_millis(self.fsync_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["tallykv"])
    }
}
