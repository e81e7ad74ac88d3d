//! Lock-free proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide proxy counters, shared by every connection task.
#[derive(Debug)]
pub struct ProxyStats {
    requests_total: AtomicU64,
    requests_intercepted: AtomicU64,
    requests_passed_through: AtomicU64,
    tunnels_opened: AtomicU64,
    receipts_generated: AtomicU64,
    errors: AtomicU64,
    bytes_transferred: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_intercepted: AtomicU64::new(0),
            requests_passed_through: AtomicU64::new(0),
            tunnels_opened: AtomicU64::new(0),
            receipts_generated: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intercepted(&self) {
        self.requests_intercepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_passed_through(&self) {
        self.requests_passed_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel(&self) {
        self.tunnels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receipt(&self) {
        self.receipts_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    /// When the proxy started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        let now = Utc::now();
        ProxyStatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_intercepted: self.requests_intercepted.load(Ordering::Relaxed),
            requests_passed_through: self.requests_passed_through.load(Ordering::Relaxed),
            tunnels_opened: self.tunnels_opened.load(Ordering::Relaxed),
            receipts_generated: self.receipts_generated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

/// Serializable view of [`ProxyStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    pub requests_total: u64,
    pub requests_intercepted: u64,
    pub requests_passed_through: u64,
    pub tunnels_opened: u64,
    pub receipts_generated: u64,
    pub errors: u64,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ProxyStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_intercepted();
        stats.record_passed_through();
        stats.record_receipt();
        stats.record_error();
        stats.add_bytes(512);
        stats.add_bytes(8);

        let snap = stats.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_intercepted, 1);
        assert_eq!(snap.requests_passed_through, 1);
        assert_eq!(snap.tunnels_opened, 0);
        assert_eq!(snap.receipts_generated, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.bytes_transferred, 520);
        assert_eq!(snap.started_at, stats.started_at());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(ProxyStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_request();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().requests_total, 4_000);
    }
}
