//! Effective runtime settings.
//!
//! The binary resolves these from CLI flags and `FAILKIT_*` environment
//! variables; the inspection API exposes them read-only.

use std::path::PathBuf;

use serde::{Serialize, Serializer};
use url::Url;

use crate::receipt::HashAlgorithm;

/// Default plain-HTTP proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default inspection API port.
pub const DEFAULT_API_PORT: u16 = 8081;

/// Default in-memory receipt capacity.
pub const DEFAULT_MAX_RECEIPTS: usize = 10_000;

/// Default number of receipts reloaded from disk at startup.
pub const DEFAULT_RECOVERY_LIMIT: usize = 1_000;

/// Hosts instrumented when no allow-list is configured.
pub const DEFAULT_TARGET_HOSTS: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "generativelanguage.googleapis.com",
    "api.mistral.ai",
    "api.cohere.ai",
    "api.groq.com",
    "api.stripe.com",
    "api.paypal.com",
    "api.sendgrid.com",
    "api.mailgun.net",
    "api.postmarkapp.com",
    "api.resend.com",
    "*.s3.amazonaws.com",
    "storage.googleapis.com",
    "*.blob.core.windows.net",
    "slack.com",
    "api.twilio.com",
];

/// Resolved configuration of a running proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySettings {
    pub host: String,
    pub proxy_port: u16,
    pub tunnel_port: Option<u16>,
    pub api_port: u16,
    pub receipts_dir: PathBuf,
    pub target_hosts: Vec<String>,
    pub include_bodies: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Only scheme and host are exposed; paths often embed tokens.
    #[serde(serialize_with = "serialize_webhook")]
    pub webhook_url: Option<String>,
    pub max_receipts: usize,
    pub recovery_limit: usize,
    pub shutdown_grace_secs: u64,
    pub log_level: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            tunnel_port: None,
            api_port: DEFAULT_API_PORT,
            receipts_dir: PathBuf::from("receipts"),
            target_hosts: default_target_hosts(),
            include_bodies: false,
            hash_algorithm: HashAlgorithm::default(),
            webhook_url: None,
            max_receipts: DEFAULT_MAX_RECEIPTS,
            recovery_limit: DEFAULT_RECOVERY_LIMIT,
            shutdown_grace_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

/// Returns the bundled allow-list as owned strings.
pub fn default_target_hosts() -> Vec<String> {
    DEFAULT_TARGET_HOSTS.iter().map(|h| h.to_string()).collect()
}

/// Splits a comma-separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

fn serialize_webhook<S: Serializer>(url: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match url {
        Some(raw) => {
            let shown = Url::parse(raw)
                .ok()
                .and_then(|u| u.host_str().map(|h| format!("{}://{}", u.scheme(), h)))
                .unwrap_or_else(|| "[configured]".to_string());
            s.serialize_some(&shown)
        }
        None => s.serialize_none(),
    }
}
