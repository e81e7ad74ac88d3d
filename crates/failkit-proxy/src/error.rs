//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error (binding or accepting).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream HTTP client error.
    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// TLS configuration for upstream connections failed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The target resolves back to one of the proxy's own listeners.
    #[error("Request loops back to the proxy at {0}")]
    Loop(std::net::SocketAddr),

    /// The inbound request does not name a usable target.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
