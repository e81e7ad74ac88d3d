//! Receipt generation.
//!
//! [`ReceiptGenerator::generate`] turns a completed [`Exchange`] into a
//! [`Receipt`]. It performs no I/O and never fails: malformed URLs fall back to
//! a placeholder host and every outcome is encoded in the receipt status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::classify::classify_host;
use crate::hashing::{canonical_input, canonical_output, digest, encode_body, sanitize_headers};
use crate::receipt::{
    HashAlgorithm, Receipt, ReceiptMetadata, ReceiptStatus, RequestSummary, ResponseSummary,
};

/// Host recorded when the request URL cannot be parsed.
pub const PLACEHOLDER_HOST: &str = "unknown-host";

/// Version stamped into receipt metadata by default.
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The request half of an observed exchange.
#[derive(Debug, Clone, Default)]
pub struct ObservedRequest {
    pub method: String,
    pub url: String,
    /// Raw headers in arrival order (redaction happens during generation).
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// The response half of an observed exchange.
#[derive(Debug, Clone, Default)]
pub struct ObservedResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// A completed request/response exchange plus timing.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: ObservedRequest,
    /// `None` when no response was ever received.
    pub response: Option<ObservedResponse>,
    /// When the first request byte was sent upstream.
    pub started_at: DateTime<Utc>,
    /// When the last response byte was received.
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Generator settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub hash_algorithm: HashAlgorithm,
    /// Retain redacted headers and base64 bodies on the receipt.
    pub include_bodies: bool,
    pub proxy_version: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::default(),
            include_bodies: false,
            proxy_version: PROXY_VERSION.to_string(),
        }
    }
}

/// Stateless receipt generator.
#[derive(Debug, Clone, Default)]
pub struct ReceiptGenerator {
    config: GeneratorConfig,
}

impl ReceiptGenerator {
    /// Creates a generator with the given settings.
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Returns the generator settings.
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Produces the receipt for a completed exchange.
    pub fn generate(&self, exchange: &Exchange) -> Receipt {
        let algorithm = self.config.hash_algorithm;
        let req = &exchange.request;
        let (host, path) = split_url(&req.url);
        let class = classify_host(&host);

        let req_headers = sanitize_headers(header_pairs(&req.headers));
        let req_body = encode_body(req.body.as_deref());
        let input_hash = digest(
            algorithm,
            &canonical_input(&req.method, &req.url, &req_headers, req_body.as_deref()),
        );

        let status_code = exchange.response.as_ref().map(|r| r.status_code);
        let (res_headers, res_body, res_len) = match &exchange.response {
            Some(res) => (
                sanitize_headers(header_pairs(&res.headers)),
                encode_body(res.body.as_deref()),
                content_length(&res.headers, res.body.as_deref()),
            ),
            None => (Default::default(), None, 0),
        };
        let output_hash = digest(
            algorithm,
            &canonical_output(status_code, &res_headers, res_body.as_deref()),
        );

        let request = RequestSummary {
            method: req.method.clone(),
            url: req.url.clone(),
            content_type: req_headers.get("content-type").cloned(),
            content_length: content_length(&req.headers, req.body.as_deref()),
            host,
            path,
            headers: None,
            body: None,
        };
        let response = ResponseSummary {
            status_code,
            content_type: res_headers.get("content-type").cloned(),
            content_length: res_len,
            headers: None,
            body: None,
        };
        let (request, response) = if self.config.include_bodies {
            (
                RequestSummary {
                    headers: Some(req_headers),
                    body: req_body,
                    ..request
                },
                ResponseSummary {
                    headers: Some(res_headers),
                    body: res_body,
                    ..response
                },
            )
        } else {
            (request, response)
        };

        Receipt {
            action_id: new_action_id(&class.tool_category, exchange.completed_at),
            tool_name: class.tool_name,
            tool_category: class.tool_category,
            timestamp: exchange.completed_at,
            duration_ms: u64::try_from(exchange.duration.as_millis()).unwrap_or(u64::MAX),
            status: ReceiptStatus::from_status_code(status_code),
            status_code,
            input_hash,
            output_hash,
            request,
            response,
            metadata: ReceiptMetadata {
                proxy_version: self.config.proxy_version.clone(),
                hash_algorithm: algorithm,
                intercepted_at: exchange.started_at,
            },
        }
    }
}

fn header_pairs(headers: &[(String, String)]) -> impl Iterator<Item = (&str, &str)> {
    headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
}

/// Declared `content-length`, or the observed body size when absent.
fn content_length(headers: &[(String, String)], body: Option<&[u8]>) -> u64 {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or_else(|| body.map(|b| b.len() as u64).unwrap_or(0))
}

/// Splits a URL into `(host, path)`, falling back to a placeholder host.
pub fn split_url(raw: &str) -> (String, String) {
    match Url::parse(raw) {
        Ok(url) => {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .unwrap_or(PLACEHOLDER_HOST)
                .to_string();
            (host, url.path().to_string())
        }
        Err(_) => (PLACEHOLDER_HOST.to_string(), "/".to_string()),
    }
}

/// Builds an action id: category prefix, millisecond timestamp, random tail.
pub fn new_action_id(category: &str, at: DateTime<Utc>) -> String {
    let prefix: String = category
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let prefix = if prefix.is_empty() { "act" } else { &prefix };
    let millis = at.timestamp_millis().max(0);
    format!("{}_{:013x}{:016x}", prefix, millis, rand::random::<u64>())
}
