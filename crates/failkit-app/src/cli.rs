//! Command-line and environment configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use failkit_core::settings::{
    default_target_hosts, parse_host_list, DEFAULT_API_PORT, DEFAULT_MAX_RECEIPTS,
    DEFAULT_PROXY_PORT, DEFAULT_RECOVERY_LIMIT,
};
use failkit_core::{HashAlgorithm, ProxySettings};
use failkit_storage::ReceiptStore;

/// FAIL Kit - receipt-producing interception proxy for AI agents
#[derive(Parser, Debug)]
#[command(name = "failkit", version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to bind the proxy and API listeners to
    #[arg(long, env = "FAILKIT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Proxy listener port
    #[arg(long, env = "FAILKIT_PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    /// Optional second listener (e.g. 8443) for clients that only CONNECT
    #[arg(long, env = "FAILKIT_TUNNEL_PORT")]
    pub tunnel_port: Option<u16>,

    /// Inspection API port
    #[arg(long, env = "FAILKIT_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Receipt directory (default: app data dir)
    #[arg(long, env = "FAILKIT_RECEIPTS_DIR")]
    pub receipts_dir: Option<PathBuf>,

    /// Comma-separated hosts to instrument (`*.domain` and `*` supported)
    #[arg(long, env = "FAILKIT_TARGET_HOSTS", value_delimiter = ',')]
    pub target_hosts: Vec<String>,

    /// Keep redacted headers and base64 bodies on receipts
    #[arg(long, env = "FAILKIT_INCLUDE_BODIES")]
    pub include_bodies: bool,

    /// Digest for input/output hashes (sha256, sha512)
    #[arg(long, env = "FAILKIT_HASH_ALGORITHM", default_value = "sha256")]
    pub hash_algorithm: HashAlgorithm,

    /// POST every receipt to this URL
    #[arg(long, env = "FAILKIT_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Receipts kept in memory before the oldest are evicted
    #[arg(long, env = "FAILKIT_MAX_RECEIPTS", default_value_t = DEFAULT_MAX_RECEIPTS)]
    pub max_receipts: usize,

    /// Receipts reloaded from disk on startup
    #[arg(long, env = "FAILKIT_RECOVERY_LIMIT", default_value_t = DEFAULT_RECOVERY_LIMIT)]
    pub recovery_limit: usize,

    /// Seconds to wait for in-flight exchanges on shutdown
    #[arg(long, env = "FAILKIT_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, env = "FAILKIT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write daily-rotated log files here
    #[arg(long, env = "FAILKIT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate receipt files and re-check their hashes
    Verify {
        /// Receipt JSON files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl Args {
    /// Effective log level.
    pub fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Resolves the arguments into the settings the services run with.
    pub fn to_settings(&self) -> anyhow::Result<ProxySettings> {
        let receipts_dir = match &self.receipts_dir {
            Some(dir) => dir.clone(),
            None => ReceiptStore::default_dir()?,
        };

        let mut target_hosts: Vec<String> = self
            .target_hosts
            .iter()
            .flat_map(|raw| parse_host_list(raw))
            .collect();
        if target_hosts.is_empty() {
            target_hosts = default_target_hosts();
        }

        let webhook_url = self
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        Ok(ProxySettings {
            host: self.host.clone(),
            proxy_port: self.proxy_port,
            tunnel_port: self.tunnel_port,
            api_port: self.api_port,
            receipts_dir,
            target_hosts,
            include_bodies: self.include_bodies,
            hash_algorithm: self.hash_algorithm,
            webhook_url,
            max_receipts: self.max_receipts,
            recovery_limit: self.recovery_limit,
            shutdown_grace_secs: self.shutdown_grace_secs,
            log_level: self.log_level().to_string(),
        })
    }
}
