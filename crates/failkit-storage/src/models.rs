//! Data models for the receipt store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use failkit_core::settings::{DEFAULT_MAX_RECEIPTS, DEFAULT_RECOVERY_LIMIT};
use failkit_core::{Receipt, ReceiptStatus};
use serde::Serialize;

/// Default page size for queries.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Upper bound on any single query page.
pub const MAX_QUERY_LIMIT: usize = 1_000;

/// Share of the index evicted when it is full.
pub const EVICTION_FRACTION: f64 = 0.2;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding the per-day partitions.
    pub dir: PathBuf,
    /// Maximum receipts kept in the in-memory index.
    pub max_receipts: usize,
    /// Maximum receipts reloaded from disk on startup.
    pub recovery_limit: usize,
    /// Optional sink that receives every saved receipt.
    pub webhook_url: Option<String>,
}

impl StoreConfig {
    /// Creates a config rooted at `dir` with default limits.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_receipts: DEFAULT_MAX_RECEIPTS,
            recovery_limit: DEFAULT_RECOVERY_LIMIT,
            webhook_url: None,
        }
    }

    /// Sets the in-memory capacity.
    pub fn with_max_receipts(mut self, max: usize) -> Self {
        self.max_receipts = max.max(1);
        self
    }

    /// Sets the startup recovery bound.
    pub fn with_recovery_limit(mut self, limit: usize) -> Self {
        self.recovery_limit = limit;
        self
    }

    /// Sets the webhook sink.
    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }
}

/// Filter and pagination for [`crate::ReceiptStore::query`].
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub tool_name: Option<String>,
    pub tool_category: Option<String>,
    pub status: Option<ReceiptStatus>,
    /// Inclusive lower bound on `timestamp`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    /// Page size; `None` means [`DEFAULT_QUERY_LIMIT`], capped at [`MAX_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

impl ReceiptFilter {
    /// Returns true if the receipt passes every set criterion.
    pub fn matches(&self, receipt: &Receipt) -> bool {
        if let Some(ref name) = self.tool_name {
            if &receipt.tool_name != name {
                return false;
            }
        }
        if let Some(ref category) = self.tool_category {
            if &receipt.tool_category != category {
                return false;
            }
        }
        if let Some(status) = self.status {
            if receipt.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if receipt.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if receipt.timestamp > to {
                return false;
            }
        }
        true
    }

    /// Effective page size.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

/// How durable a save turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    /// Written to the given day-partition file.
    Persisted(PathBuf),
    /// Disk write failed; the receipt lives only in memory.
    MemoryOnly,
}

impl Durability {
    /// Returns true when the receipt reached disk.
    pub fn is_persisted(&self) -> bool {
        matches!(self, Durability::Persisted(_))
    }
}

/// Aggregate statistics over the in-memory index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_receipts: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_tool: BTreeMap<String, usize>,
    pub avg_duration_ms: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub max_receipts: usize,
    pub evicted_total: u64,
    pub disk_write_failures: u64,
    pub webhook_failures: u64,
    pub storage_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_bounded() {
        let mut filter = ReceiptFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_QUERY_LIMIT);
        filter.limit = Some(50_000);
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);
        filter.limit = Some(0);
        assert_eq!(filter.effective_limit(), 1);
    }

    #[test]
    fn config_builder() {
        let config = StoreConfig::new("/tmp/r")
            .with_max_receipts(0)
            .with_recovery_limit(5)
            .with_webhook("http://localhost:9/hook");
        assert_eq!(config.max_receipts, 1);
        assert_eq!(config.recovery_limit, 5);
        assert!(config.webhook_url.is_some());
    }
}
