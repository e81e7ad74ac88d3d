//! Proxy server.
//!
//! Binds the proxy listeners, runs one task per accepted connection and
//! coordinates graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use failkit_core::{GeneratorConfig, ProxySettings, ReceiptGenerator};
use failkit_storage::ReceiptStore;

use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::hosts::HostMatcher;
use crate::stats::ProxyStats;
use crate::upstream::{upstream_client, UpstreamResolver};
use crate::DEFAULT_SHUTDOWN_GRACE;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address of the main proxy listener.
    pub addr: SocketAddr,
    /// Optional second listener running the same handler.
    pub tunnel_addr: Option<SocketAddr>,
    /// Allow-list of instrumented hosts.
    pub target_hosts: Vec<String>,
    pub generator: GeneratorConfig,
    /// How long shutdown waits for in-flight work.
    pub shutdown_grace: Duration,
    /// Fixed upstream addresses by host name, bypassing DNS.
    pub resolve_overrides: HashMap<String, SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], failkit_core::settings::DEFAULT_PROXY_PORT)),
            tunnel_addr: None,
            target_hosts: failkit_core::settings::default_target_hosts(),
            generator: GeneratorConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            resolve_overrides: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Builds the proxy configuration from resolved settings.
    pub fn from_settings(settings: &ProxySettings) -> Result<Self> {
        let addr = socket_addr(&settings.host, settings.proxy_port)?;
        let tunnel_addr = settings
            .tunnel_port
            .map(|port| socket_addr(&settings.host, port))
            .transpose()?;

        Ok(Self {
            addr,
            tunnel_addr,
            target_hosts: settings.target_hosts.clone(),
            generator: GeneratorConfig {
                hash_algorithm: settings.hash_algorithm,
                include_bodies: settings.include_bodies,
                ..GeneratorConfig::default()
            },
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            resolve_overrides: HashMap::new(),
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Adds the second listener.
    pub fn with_tunnel_addr(mut self, addr: SocketAddr) -> Self {
        self.tunnel_addr = Some(addr);
        self
    }

    /// Replaces the host allow-list.
    pub fn with_target_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the receipt generator settings.
    pub fn with_generator(mut self, generator: GeneratorConfig) -> Self {
        self.generator = generator;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sends traffic for `host` to `addr` instead of resolving it. The port
    /// still comes from the request.
    pub fn with_resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.resolve_overrides.insert(host.into(), addr);
        self
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip = host
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid listen host: {host}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Receipt-producing interception proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    store: Arc<ReceiptStore>,
    stats: Arc<ProxyStats>,
}

impl ProxyServer {
    /// Creates a new proxy server writing receipts into `store`.
    pub fn new(config: ProxyConfig, store: Arc<ReceiptStore>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(ProxyStats::new()),
        }
    }

    /// Shares externally owned counters (e.g. with the inspection API).
    pub fn with_stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Returns the shared counters.
    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Binds every configured listener and starts serving.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let local_addr = listener.local_addr()?;
        let tunnel_listener = match self.config.tunnel_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let tunnel_addr = tunnel_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let resolver = UpstreamResolver::new(self.config.resolve_overrides.clone());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let handler = ProxyHandler::new(HandlerConfig {
            generator: ReceiptGenerator::new(self.config.generator.clone()),
            store: self.store,
            targets: HostMatcher::new(&self.config.target_hosts),
            stats: self.stats,
            client: upstream_client(resolver.clone())?,
            resolver,
            listeners: std::iter::once(local_addr).chain(tunnel_addr).collect(),
            tracker: tracker.clone(),
        });

        tracing::info!("Proxy listening on {}", local_addr);
        let mut loops = vec![tokio::spawn(accept_loop(
            listener,
            handler.clone(),
            tracker.clone(),
            cancel.clone(),
        ))];

        if let (Some(listener), Some(bound)) = (tunnel_listener, tunnel_addr) {
            tracing::info!("Tunnel listener on {}", bound);
            loops.push(tokio::spawn(accept_loop(
                listener,
                handler,
                tracker.clone(),
                cancel.clone(),
            )));
        }

        Ok(ProxyHandle {
            local_addr,
            tunnel_addr,
            cancel,
            tracker,
            loops,
            grace: self.config.shutdown_grace,
        })
    }

    /// Runs until `signal` resolves, then shuts down gracefully.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.start().await?;
        signal.await;
        handle.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a running proxy.
#[derive(Debug)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    tunnel_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    loops: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl ProxyHandle {
    /// Address the main listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the tunnel listener is bound to, if configured.
    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel_addr
    }

    /// Stops accepting, then waits up to the grace period for in-flight
    /// connections and receipt tasks. Anything still running is abandoned.
    pub async fn shutdown(self) {
        tracing::info!("Proxy shutting down");
        self.cancel.cancel();
        for handle in self.loops {
            if let Err(e) = handle.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Shutdown grace period elapsed, abandoning in-flight work"
            );
        } else {
            tracing::info!("Proxy stopped");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ProxyHandler,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            },
            _ = cancel.cancelled() => break,
        };

        let handler = handler.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { handler.handle(req).await }
            });

            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            let mut conn = std::pin::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        });
    }
}
