//! Header redaction, canonical serialization and content hashing.
//!
//! Redaction always runs before canonicalization, and the redacted header map
//! is the same one that gets stored on a receipt, so re-hashing stored data
//! reproduces the original digest.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};

use crate::receipt::HashAlgorithm;

/// Value that replaces sensitive header values.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Header names (lower-case) whose values never leave the proxy.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "api-key",
    "apikey",
    "x-api-key",
    "x-goog-api-key",
    "x-auth-token",
];

/// Returns true if the header value must be redacted.
pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&name.as_str())
}

/// Lower-cases header names, redacts sensitive values and folds repeated
/// headers into one comma-separated value (in arrival order).
pub fn sanitize_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out: BTreeMap<String, String> = BTreeMap::new();

    for (name, value) in headers {
        let name = name.trim().to_ascii_lowercase();
        let value = if is_sensitive_header(&name) {
            REDACTION_MARKER
        } else {
            value
        };

        out.entry(name)
            .and_modify(|existing| {
                if existing != REDACTION_MARKER {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
            })
            .or_insert_with(|| value.to_string());
    }

    out
}

/// Encodes a body for canonical form and storage. Empty bodies are absent.
pub fn encode_body(body: Option<&[u8]>) -> Option<String> {
    body.filter(|b| !b.is_empty()).map(|b| BASE64.encode(b))
}

// Field order is alphabetical so the serialized form is stable without
// relying on map ordering.
#[derive(Serialize)]
struct CanonicalInput<'a> {
    body: Option<&'a str>,
    headers: &'a BTreeMap<String, String>,
    method: &'a str,
    url: &'a str,
}

#[derive(Serialize)]
struct CanonicalOutput<'a> {
    body: Option<&'a str>,
    headers: &'a BTreeMap<String, String>,
    status: Option<u16>,
}

/// Canonical string for the request side of an exchange.
pub fn canonical_input(
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: Option<&str>,
) -> String {
    to_canonical(&CanonicalInput {
        body,
        headers,
        method,
        url,
    })
}

/// Canonical string for the response side of an exchange.
pub fn canonical_output(
    status: Option<u16>,
    headers: &BTreeMap<String, String>,
    body: Option<&str>,
) -> String {
    to_canonical(&CanonicalOutput {
        body,
        headers,
        status,
    })
}

fn to_canonical<T: Serialize>(value: &T) -> String {
    // Only strings, integers, nulls and string maps are serialized here, none
    // of which can fail.
    serde_json::to_string(value).unwrap_or_default()
}

/// Hashes a canonical string and prefixes the digest with the algorithm name.
pub fn digest(algorithm: HashAlgorithm, canonical: &str) -> String {
    let hex = match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(canonical.as_bytes())),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(canonical.as_bytes())),
    };
    format!("{}:{}", algorithm.as_str(), hex)
}
