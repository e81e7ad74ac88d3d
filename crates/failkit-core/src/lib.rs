//! FAIL Kit Core - receipt model, generation and validation.
//!
//! A receipt is the independently generated proof that an agent's outbound
//! call (model API, payment, email, storage) actually happened and how it
//! ended. This crate holds everything about receipts that needs no I/O:
//!
//! - [`receipt`]: the stable receipt record and its status/hash enums
//! - [`classify`]: host → `(tool_name, tool_category)` classification
//! - [`hashing`]: header redaction, canonical serialization, digests
//! - [`generator`]: [`ReceiptGenerator::generate`] for completed exchanges
//! - [`validation`]: shape validation and digest verification
//! - [`settings`]: the effective runtime configuration record
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use chrono::Utc;
//! use failkit_core::{Exchange, ObservedRequest, ObservedResponse, ReceiptGenerator, ReceiptStatus};
//!
//! let now = Utc::now();
//! let receipt = ReceiptGenerator::default().generate(&Exchange {
//!     request: ObservedRequest {
//!         method: "POST".into(),
//!         url: "https://api.stripe.com/v1/charges".into(),
//!         headers: vec![],
//!         body: Some(b"amount=100".to_vec()),
//!     },
//!     response: Some(ObservedResponse { status_code: 200, headers: vec![], body: None }),
//!     started_at: now,
//!     completed_at: now,
//!     duration: Duration::from_millis(80),
//! });
//!
//! assert_eq!(receipt.tool_category, "payment");
//! assert_eq!(receipt.status, ReceiptStatus::Success);
//! ```

pub mod classify;
pub mod generator;
pub mod hashing;
pub mod receipt;
pub mod settings;
pub mod validation;

pub use classify::{classify_host, normalize_host, ToolClass};
pub use generator::{
    Exchange, GeneratorConfig, ObservedRequest, ObservedResponse, ReceiptGenerator, PROXY_VERSION,
};
pub use hashing::{sanitize_headers, REDACTION_MARKER};
pub use receipt::{
    HashAlgorithm, Receipt, ReceiptMetadata, ReceiptStatus, RequestSummary, ResponseSummary,
    UnknownAlgorithm,
};
pub use settings::ProxySettings;
pub use validation::{
    proves_action, receipts_match, validate_receipt, verify_receipt, ValidationReport,
    Verification,
};
