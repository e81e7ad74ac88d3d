//! The receipt store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use directories::ProjectDirs;
use failkit_core::Receipt;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StorageError};
use crate::models::{Durability, ReceiptFilter, StoreConfig, StoreStats, EVICTION_FRACTION};
use crate::partition;
use crate::webhook::WebhookNotifier;

/// Durable, queryable repository of receipts.
///
/// Writes go to an in-memory index (bounded by `max_receipts`) and to a
/// per-day partition on disk. Disk failures degrade to memory-only storage
/// instead of failing the save.
#[derive(Debug)]
pub struct ReceiptStore {
    config: StoreConfig,
    index: RwLock<HashMap<String, Receipt>>,
    webhook: Option<WebhookNotifier>,
    disk_failures: AtomicU64,
    evicted: AtomicU64,
}

impl ReceiptStore {
    /// Opens a store rooted at `config.dir` and reloads recent receipts.
    pub fn open(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        info!("Opening receipt store at: {:?}", config.dir);

        let webhook = config.webhook_url.as_deref().map(WebhookNotifier::new);
        let store = Self {
            config,
            index: RwLock::new(HashMap::new()),
            webhook,
            disk_failures: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        };

        let loaded = store.reload();
        info!(loaded, "Receipt store ready");
        Ok(store)
    }

    /// Get the default receipts directory.
    pub fn default_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "failkit", "failkit").ok_or_else(|| {
            StorageError::Config("Could not determine app data directory".into())
        })?;

        Ok(proj_dirs.data_dir().join("receipts"))
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reloads the most recent receipts from disk into the index.
    ///
    /// Already-indexed receipts are replaced rather than duplicated, so calling
    /// this repeatedly is harmless. Returns the number of receipts read.
    pub fn reload(&self) -> usize {
        let limit = self.config.recovery_limit.min(self.config.max_receipts);
        let report = match partition::load_recent(&self.config.dir, limit) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Receipt recovery failed, starting with an empty index");
                return 0;
            }
        };

        if report.skipped > 0 {
            warn!(skipped = report.skipped, "Skipped malformed receipt files");
        }

        let loaded = report.receipts.len();
        let mut index = self.index.write();
        for receipt in report.receipts {
            if index.len() >= self.config.max_receipts && !index.contains_key(&receipt.action_id) {
                self.evict_oldest(&mut index);
            }
            index.insert(receipt.action_id.clone(), receipt);
        }
        debug!(loaded, indexed = index.len(), "Reloaded receipts from disk");
        loaded
    }

    /// Saves a receipt.
    ///
    /// The in-memory insert always succeeds. The disk write and webhook push
    /// are best effort: their failures are logged and reflected in the
    /// returned [`Durability`] and in [`StoreStats::disk_write_failures`] /
    /// [`StoreStats::webhook_failures`].
    pub fn save(&self, receipt: Receipt) -> Durability {
        {
            let mut index = self.index.write();
            if index.len() >= self.config.max_receipts && !index.contains_key(&receipt.action_id)
            {
                self.evict_oldest(&mut index);
            }
            index.insert(receipt.action_id.clone(), receipt.clone());
        }

        let durability = match partition::write_receipt(&self.config.dir, &receipt) {
            Ok(path) => {
                debug!(action_id = %receipt.action_id, path = ?path, "Receipt persisted");
                Durability::Persisted(path)
            }
            Err(e) => {
                self.disk_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    action_id = %receipt.action_id,
                    error = %e,
                    "Failed to persist receipt, keeping it in memory only"
                );
                Durability::MemoryOnly
            }
        };

        if let Some(ref webhook) = self.webhook {
            webhook.notify(&receipt);
        }

        durability
    }

    /// Removes the oldest share of the index. Caller holds the write lock.
    fn evict_oldest(&self, index: &mut HashMap<String, Receipt>) {
        if index.is_empty() {
            return;
        }

        let count = ((index.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(chrono::DateTime<chrono::Utc>, String)> = index
            .values()
            .map(|r| (r.timestamp, r.action_id.clone()))
            .collect();
        by_age.sort();

        for (_, id) in by_age.into_iter().take(count) {
            index.remove(&id);
        }
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, remaining = index.len(), "Evicted oldest receipts");
    }

    /// Looks up a receipt by action id.
    pub fn get(&self, action_id: &str) -> Option<Receipt> {
        self.index.read().get(action_id).cloned()
    }

    /// Returns a page of matching receipts, newest first.
    pub fn query(&self, filter: &ReceiptFilter) -> Vec<Receipt> {
        let mut matched: Vec<Receipt> = self
            .index
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_newest_first(&mut matched);

        matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect()
    }

    /// Counts matching receipts, ignoring pagination.
    pub fn count(&self, filter: &ReceiptFilter) -> usize {
        self.index
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .count()
    }

    /// Every indexed receipt, newest first. Bounded by the index capacity.
    pub fn all(&self) -> Vec<Receipt> {
        let mut receipts: Vec<Receipt> = self.index.read().values().cloned().collect();
        sort_newest_first(&mut receipts);
        receipts
    }

    /// Number of receipts in the in-memory index.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the in-memory index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Aggregate statistics over the in-memory index.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        let mut stats = StoreStats {
            total_receipts: index.len(),
            max_receipts: self.config.max_receipts,
            evicted_total: self.evicted.load(Ordering::Relaxed),
            disk_write_failures: self.disk_failures.load(Ordering::Relaxed),
            webhook_failures: self.webhook.as_ref().map_or(0, WebhookNotifier::failures),
            storage_dir: self.config.dir.clone(),
            ..StoreStats::default()
        };

        let mut total_duration: u128 = 0;
        for receipt in index.values() {
            *stats
                .by_category
                .entry(receipt.tool_category.clone())
                .or_default() += 1;
            *stats
                .by_status
                .entry(receipt.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_tool.entry(receipt.tool_name.clone()).or_default() += 1;
            total_duration += u128::from(receipt.duration_ms);

            stats.oldest = Some(match stats.oldest {
                Some(t) if t <= receipt.timestamp => t,
                _ => receipt.timestamp,
            });
            stats.newest = Some(match stats.newest {
                Some(t) if t >= receipt.timestamp => t,
                _ => receipt.timestamp,
            });
        }

        if !index.is_empty() {
            stats.avg_duration_ms = total_duration as f64 / index.len() as f64;
        }
        stats
    }
}

fn sort_newest_first(receipts: &mut [Receipt]) {
    receipts.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.action_id.cmp(&a.action_id))
    });
}
