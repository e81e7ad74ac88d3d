//! Receipt validation and verification.
//!
//! Validation checks a receipt's shape (the same checks the receipt SDKs
//! apply). Verification goes further and recomputes both digests from the
//! retained headers and bodies.

use serde::Serialize;

use crate::hashing::{canonical_input, canonical_output, digest};
use crate::receipt::{HashAlgorithm, Receipt, ReceiptStatus};

/// Outcome of [`validate_receipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Checks required fields, id charset and digest format.
pub fn validate_receipt(receipt: &Receipt) -> ValidationReport {
    let mut errors = Vec::new();

    if receipt.action_id.is_empty() {
        errors.push("missing action_id".to_string());
    } else if !receipt
        .action_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push("invalid action_id format".to_string());
    }
    if receipt.tool_name.is_empty() {
        errors.push("missing tool_name".to_string());
    }
    if receipt.tool_category.is_empty() {
        errors.push("missing tool_category".to_string());
    }

    let algorithm = receipt.metadata.hash_algorithm;
    for (field, value) in [
        ("input_hash", &receipt.input_hash),
        ("output_hash", &receipt.output_hash),
    ] {
        if value.is_empty() {
            errors.push(format!("missing {field}"));
        } else if !is_well_formed_digest(value, algorithm) {
            errors.push(format!(
                "invalid {field} format (expected {}:<{} hex chars>)",
                algorithm,
                algorithm.hex_len()
            ));
        }
    }

    if receipt.status != ReceiptStatus::from_status_code(receipt.status_code) {
        errors.push(format!(
            "status {} does not match status_code {:?}",
            receipt.status, receipt.status_code
        ));
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn is_well_formed_digest(value: &str, algorithm: HashAlgorithm) -> bool {
    match value.split_once(':') {
        Some((prefix, hex)) => {
            prefix == algorithm.as_str()
                && hex.len() == algorithm.hex_len()
                && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        }
        None => false,
    }
}

/// Returns true when two receipts fingerprint the same exchange for the same tool.
pub fn receipts_match(a: &Receipt, b: &Receipt) -> bool {
    a.tool_name == b.tool_name && a.input_hash == b.input_hash && a.output_hash == b.output_hash
}

/// Returns true when the receipt proves a successful call to `tool_name`.
pub fn proves_action(receipt: &Receipt, tool_name: &str) -> bool {
    receipt.tool_name == tool_name
        && receipt.status == ReceiptStatus::Success
        && validate_receipt(receipt).valid
}

/// Result of recomputing a receipt's digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Verification {
    /// Both digests reproduce.
    Verified,
    /// At least one digest differs from the retained payload.
    Mismatch { input_ok: bool, output_ok: bool },
    /// Headers and bodies were not retained; only the format can be checked.
    Unverifiable,
}

/// Recomputes `input_hash` and `output_hash` from retained payloads.
pub fn verify_receipt(receipt: &Receipt) -> Verification {
    let (Some(req_headers), Some(res_headers)) =
        (&receipt.request.headers, &receipt.response.headers)
    else {
        return Verification::Unverifiable;
    };

    let algorithm = receipt.metadata.hash_algorithm;
    let input = digest(
        algorithm,
        &canonical_input(
            &receipt.request.method,
            &receipt.request.url,
            req_headers,
            receipt.request.body.as_deref(),
        ),
    );
    let output = digest(
        algorithm,
        &canonical_output(
            receipt.response.status_code,
            res_headers,
            receipt.response.body.as_deref(),
        ),
    );

    let input_ok = input == receipt.input_hash;
    let output_ok = output == receipt.output_hash;
    if input_ok && output_ok {
        Verification::Verified
    } else {
        Verification::Mismatch {
            input_ok,
            output_ok,
        }
    }
}
