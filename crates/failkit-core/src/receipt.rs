//! Receipt data model.
//!
//! A [`Receipt`] is the proof that a network exchange actually happened. The
//! serialized field names are consumed verbatim by the dashboard, the
//! enforcement gates and the static-analysis tooling, so renaming any of them
//! is a breaking change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome classification of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Upstream answered with a non-error status.
    Success,
    /// Upstream answered with a 5xx, or never answered.
    Failure,
    /// Upstream answered 408 or 504.
    Timeout,
}

impl ReceiptStatus {
    /// Derives the status from the upstream status code.
    ///
    /// 408 and 504 map to `Timeout` before the generic `>= 500` rule, so a
    /// gateway timeout is never reported as a plain failure. A missing code
    /// means the exchange never completed.
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(408) | Some(504) => ReceiptStatus::Timeout,
            Some(c) if c >= 500 => ReceiptStatus::Failure,
            Some(_) => ReceiptStatus::Success,
            None => ReceiptStatus::Failure,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Success => "success",
            ReceiptStatus::Failure => "failure",
            ReceiptStatus::Timeout => "timeout",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(ReceiptStatus::Success),
            "failure" => Some(ReceiptStatus::Failure),
            "timeout" => Some(ReceiptStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest used for `input_hash` / `output_hash`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Name used as the digest prefix and in receipt metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex digest this algorithm produces.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    /// Recovers the algorithm from a prefixed digest such as `sha256:ab12...`.
    pub fn from_digest(digest: &str) -> Option<Self> {
        let (prefix, _) = digest.split_once(':')?;
        prefix.parse().ok()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown hash algorithm name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported hash algorithm: {0} (expected sha256 or sha512)")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Request side of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub content_type: Option<String>,
    pub content_length: u64,
    /// Redacted headers, only kept when body inclusion is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Base64 body, only kept when body inclusion is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response side of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Fixed provenance block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMetadata {
    pub proxy_version: String,
    pub hash_algorithm: HashAlgorithm,
    pub intercepted_at: DateTime<Utc>,
}

/// An immutable record asserting that a network exchange occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub action_id: String,
    pub tool_name: String,
    pub tool_category: String,
    /// Completion time of the exchange.
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ReceiptStatus,
    pub status_code: Option<u16>,
    pub input_hash: String,
    pub output_hash: String,
    pub request: RequestSummary,
    pub response: ResponseSummary,
    pub metadata: ReceiptMetadata,
}

impl Receipt {
    /// Returns true when the receipt retains enough data to recompute hashes.
    pub fn retains_payloads(&self) -> bool {
        self.request.headers.is_some() && self.response.headers.is_some()
    }
}
