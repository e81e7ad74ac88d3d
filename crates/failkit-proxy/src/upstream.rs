//! Upstream connection pool.
//!
//! Requests are forwarded with hyper's pooled client, which sends exactly the
//! headers it is given (plus `Host` when absent). Name resolution goes through
//! [`UpstreamResolver`] so fixed host overrides and self-loop checks share one
//! code path.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::Result;
use crate::handler::ProxyBody;

/// Pooled HTTP/HTTPS client used for every forwarded request.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector<UpstreamResolver>>, ProxyBody>;

/// DNS resolver with optional fixed overrides, like `/etc/hosts` entries.
///
/// Override ports are ignored; the connector always uses the port from the
/// request URI.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResolver {
    overrides: Arc<HashMap<String, SocketAddr>>,
}

impl UpstreamResolver {
    pub fn new(overrides: HashMap<String, SocketAddr>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(host, addr)| (host.to_ascii_lowercase(), addr))
            .collect();
        Self {
            overrides: Arc::new(overrides),
        }
    }

    /// Resolves `host:port` to socket addresses.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Some(addr) = self.overrides.get(&host.to_ascii_lowercase()) {
            return Ok(vec![SocketAddr::new(addr.ip(), port)]);
        }
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

impl tower::Service<Name> for UpstreamResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            // The connector overwrites the port with the one from the URI.
            let addrs = resolver.resolve(name.as_str(), 0).await?;
            Ok(addrs.into_iter())
        })
    }
}

/// Builds the upstream client.
///
/// Redirects are returned to the caller, no default headers are added and
/// system proxy variables are ignored so the proxy never loops through itself.
pub fn upstream_client(resolver: UpstreamResolver) -> Result<UpstreamClient> {
    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new()).build(https))
}
