//! Configuration parsing and validation for the proxy server
//!
//! This module handles command-line argument parsing and validation using clap.
//! It defines the main configuration structure used throughout the application.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, env = "SHOAL_PORT", default_value_t = 11434)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The file from which to read the fleet of backends.
    #[arg(short = 'f', long, env = "SHOAL_FLEET", default_value = "fleet.json")]
    pub fleet: PathBuf,

    /// The inventory file maintained by the fleet poller.
    #[arg(long, default_value = "data/inventory.json")]
    pub inventory: PathBuf,

    /// The user file maintained by the auth subsystem.
    #[arg(long, default_value = "data/users.json")]
    pub users: PathBuf,

    /// The append-only request log, one JSON object per line.
    #[arg(long, default_value = "data/requests.jsonl")]
    pub request_log: PathBuf,

    /// How long (in seconds) a fleet snapshot stays fresh before the
    /// inventory store is re-read.
    #[arg(long, default_value_t = 3)]
    pub snapshot_ttl_secs: u64,

    /// How long (in seconds) an unconfirmed model placement is believed
    /// before routing falls back to poller data alone.
    #[arg(long, default_value_t = 30)]
    pub optimistic_ttl_secs: u64,

    /// How long (in seconds) the API key cache serves without re-reading
    /// the user store.
    #[arg(long, default_value_t = 30)]
    pub key_cache_ttl_secs: u64,

    /// Ceiling (in seconds) on waiting for an upstream response head.
    /// Generation requests legitimately take minutes.
    #[arg(long, default_value_t = 300)]
    pub upstream_timeout_secs: u64,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "shoal")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    /// Higher values improve performance under load by reusing connections.
    /// - Fan-out scenarios (many upstreams): 100-300
    /// - Single upstream scenarios: 1000-2000
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    /// 90s balances connection reuse with avoiding stale connections.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.fleet.exists() {
            return Err(anyhow!(
                "Fleet config file '{}' does not exist",
                self.fleet.display()
            ));
        }
        Ok(self)
    }
}
