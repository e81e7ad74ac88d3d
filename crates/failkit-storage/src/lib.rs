//! FAIL Kit Storage - receipt persistence layer.
//!
//! Receipts are kept in a bounded in-memory index for fast queries and
//! written to disk as one JSON file per receipt, grouped into per-day
//! directories. It handles:
//!
//! - Best-effort durable saves (disk failures degrade to memory-only)
//! - Oldest-first eviction when the index is full
//! - Filtered, paginated queries and aggregate statistics
//! - Bounded recovery of recent receipts on startup
//! - Optional webhook push of every saved receipt
//!
//! # Example
//!
//! ```no_run
//! use failkit_storage::{ReceiptFilter, ReceiptStore, StoreConfig};
//!
//! let store = ReceiptStore::open(StoreConfig::new("./receipts")).unwrap();
//! let recent = store.query(&ReceiptFilter {
//!     tool_category: Some("llm".to_string()),
//!     limit: Some(10),
//!     ..Default::default()
//! });
//! println!("{} llm receipts", recent.len());
//! ```

pub mod error;
pub mod models;
pub mod partition;
mod store;
pub mod webhook;

pub use error::{Result, StorageError};
pub use models::{
    Durability, ReceiptFilter, StoreConfig, StoreStats, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT,
};
pub use store::ReceiptStore;
pub use webhook::WebhookNotifier;
