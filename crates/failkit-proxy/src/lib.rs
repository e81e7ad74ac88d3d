//! FAIL Kit Proxy - receipt-producing interception proxy.
//!
//! An explicit (or transparent) HTTP proxy that forwards agent traffic to its
//! real destination and, for allow-listed hosts, records a cryptographic
//! [`Receipt`](failkit_core::Receipt) proving the exchange happened.
//!
//! ## Features
//!
//! - Absolute-form (`GET http://host/path`) and origin-form (`Host:` header)
//!   requests
//! - Allow-listed hosts are buffered, forwarded and receipted
//! - Other hosts are streamed through untouched
//! - `CONNECT` tunnels are relayed blind (no receipt, no TLS termination)
//! - `GET /__proxy/health` and `GET /__proxy/stats` on the proxy port
//! - Requests that would loop back into the proxy are refused (508)
//! - Graceful shutdown with a bounded grace period
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy → CONNECT? ──yes──→ TCP splice (no receipt)
//!                             │ no
//!                             ▼
//!                      Resolve target (400 if none)
//!                             │
//!                      Own listener? ──yes──→ 508
//!                             │ no
//!            ┌────────────────┴────────────────┐
//!            │ allow-listed                    │ other
//!            ▼                                 ▼
//!    Buffer + forward                    Stream forward
//!            │
//!            ▼
//!    Tee response → client
//!            │
//!            ▼
//!    Generate receipt → ReceiptStore
//! ```

use std::time::Duration;

mod error;
mod handler;
mod hosts;
mod proxy;
mod stats;
mod upstream;

pub use error::{ProxyError, Result};
pub use handler::{
    is_own_listener, resolve_target, strip_hop_by_hop, BoxError, HandlerConfig, ProxyBody,
    ProxyHandler, BUILTIN_PREFIX, HOP_BY_HOP_HEADERS,
};
pub use hosts::HostMatcher;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
pub use upstream::{upstream_client, UpstreamClient, UpstreamResolver};

/// Default time shutdown waits for in-flight exchanges.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
