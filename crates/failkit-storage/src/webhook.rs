//! Fire-and-forget receipt notification.
//!
//! Each saved receipt is POSTed as JSON to the configured URL from a spawned
//! task. Delivery is best effort: there are no retries, failures are logged
//! and never reach the caller, and pushes may arrive out of order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use failkit_core::Receipt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Pushes receipts to an external sink.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    failures: Arc<AtomicU64>,
}

impl WebhookNotifier {
    /// Creates a notifier for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of deliveries that failed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Sends the receipt in the background and returns immediately.
    ///
    /// Returns `None` when called outside a tokio runtime, in which case the
    /// push is skipped.
    pub fn notify(&self, receipt: &Receipt) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            debug!(action_id = %receipt.action_id, "No runtime available, skipping webhook");
            return None;
        };

        let this = self.clone();
        let receipt = receipt.clone();
        Some(handle.spawn(async move {
            if let Err(e) = this.deliver(&receipt).await {
                this.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    action_id = %receipt.action_id,
                    url = %this.url,
                    error = %e,
                    "Webhook delivery failed"
                );
            }
        }))
    }

    async fn deliver(&self, receipt: &Receipt) -> Result<()> {
        self.client
            .post(&self.url)
            .json(receipt)
            .send()
            .await?
            .error_for_status()?;
        debug!(action_id = %receipt.action_id, "Webhook delivered");
        Ok(())
    }
}
