//! Application state for the API server.

use std::sync::Arc;

use failkit_core::ProxySettings;
use failkit_proxy::ProxyStats;
use failkit_storage::ReceiptStore;

/// Shared application state. Everything here is read-only to the API.
#[derive(Clone)]
pub struct AppState {
    /// Receipt store shared with the proxy.
    pub store: Arc<ReceiptStore>,
    /// Live proxy counters.
    pub proxy_stats: Arc<ProxyStats>,
    /// Effective configuration.
    pub settings: Arc<ProxySettings>,
}

impl AppState {
    /// Creates application state over a running proxy's store and counters.
    pub fn new(
        store: Arc<ReceiptStore>,
        proxy_stats: Arc<ProxyStats>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            store,
            proxy_stats,
            settings: Arc::new(settings),
        }
    }
}
