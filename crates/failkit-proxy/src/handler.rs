//! Per-request proxy logic.
//!
//! Every inbound request takes one of four routes: a built-in endpoint, a
//! CONNECT tunnel, an instrumented forward (allow-listed host, produces a
//! receipt) or a streaming pass-through (everything else). Targets that
//! resolve back to one of the proxy's own listeners are refused with 508.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue, ALLOW, CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use url::Url;

use failkit_core::{Exchange, ObservedRequest, ObservedResponse, ReceiptGenerator, PROXY_VERSION};
use failkit_storage::ReceiptStore;

use crate::error::ProxyError;
use crate::hosts::HostMatcher;
use crate::stats::ProxyStats;
use crate::upstream::{UpstreamClient, UpstreamResolver};

/// Boxed error carried by response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used for responses and forwarded requests.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Headers that only make sense on a single hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Prefix of the proxy's own endpoints on origin-form requests.
pub const BUILTIN_PREFIX: &str = "/__proxy/";

const TEE_CHANNEL_CAPACITY: usize = 16;

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    pub generator: ReceiptGenerator,
    pub store: Arc<ReceiptStore>,
    pub targets: HostMatcher,
    pub stats: Arc<ProxyStats>,
    pub client: UpstreamClient,
    /// Same resolver the client uses; consulted for loop detection.
    pub resolver: UpstreamResolver,
    /// Bound proxy listeners. Requests aimed at these are refused.
    pub listeners: Vec<SocketAddr>,
    /// Tracks receipt and tunnel tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("generator", &self.generator)
            .field("store", &self.store.config().dir)
            .field("targets", &self.targets.patterns())
            .field("listeners", &self.listeners)
            .field("tracked_tasks", &self.tracker.len())
            .finish()
    }
}

/// HTTP handler shared by every connection.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    config: Arc<HandlerConfig>,
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.config.stats
    }

    /// Handles a single request. Never fails; errors become 4xx/5xx responses.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        if req.uri().scheme().is_none() && req.uri().path().starts_with(BUILTIN_PREFIX) {
            return Ok(self.builtin(req.method(), req.uri().path()));
        }

        self.config.stats.record_request();

        if req.method() == Method::CONNECT {
            return Ok(self.tunnel(req).await);
        }

        let target = match resolve_target(&req) {
            Ok(target) => target,
            Err(e) => {
                self.config.stats.record_error();
                tracing::warn!(uri = %req.uri(), error = %e, "Rejecting request");
                return Ok(text_response(StatusCode::BAD_REQUEST, e.to_string()));
            }
        };

        let host = target.host_str().unwrap_or_default();
        let port = target.port_or_known_default().unwrap_or(80);
        if let Err(e) = self.check_loop(host, port).await {
            return Ok(self.loop_detected(e));
        }

        if self.config.targets.is_match(host) {
            tracing::debug!("Instrumenting request to {}", host);
            self.config.stats.record_intercepted();
            Ok(self.intercept(req, target).await)
        } else {
            self.config.stats.record_passed_through();
            Ok(self.pass_through(req, target).await)
        }
    }

    fn builtin(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        if method != Method::GET {
            let mut response =
                text_response(StatusCode::METHOD_NOT_ALLOWED, "proxy endpoints are read-only");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET"));
            return response;
        }

        match path.trim_start_matches(BUILTIN_PREFIX) {
            "health" => json_response(
                StatusCode::OK,
                &serde_json::json!({ "status": "ok", "version": PROXY_VERSION }),
            ),
            "stats" => json_response(StatusCode::OK, &self.config.stats.snapshot()),
            _ => text_response(StatusCode::NOT_FOUND, "unknown proxy endpoint"),
        }
    }

    /// Fails when `host:port` resolves to one of the proxy's own listeners.
    ///
    /// Resolution errors are not loops; the forward reports them as 502.
    async fn check_loop(&self, host: &str, port: u16) -> Result<(), ProxyError> {
        if !self.config.listeners.iter().any(|l| l.port() == port) {
            return Ok(());
        }

        let Ok(addrs) = self.config.resolver.resolve(host, port).await else {
            return Ok(());
        };
        match addrs
            .into_iter()
            .find(|addr| is_own_listener(*addr, &self.config.listeners))
        {
            Some(addr) => Err(ProxyError::Loop(addr)),
            None => Ok(()),
        }
    }

    fn loop_detected(&self, e: ProxyError) -> Response<ProxyBody> {
        self.config.stats.record_error();
        tracing::warn!(error = %e, "Refusing request aimed at the proxy itself");
        text_response(StatusCode::LOOP_DETECTED, e.to_string())
    }

    /// Buffers the request, forwards it, and tees the response to the client
    /// while capturing a copy for the receipt.
    async fn intercept(&self, req: Request<Incoming>, target: Url) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.config.stats.record_error();
                tracing::warn!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };
        self.config.stats.add_bytes(body.len() as u64);

        let headers = strip_hop_by_hop(&parts.headers);
        let observed = ObservedRequest {
            method: parts.method.to_string(),
            url: target.to_string(),
            headers: header_pairs(&headers),
            body: (!body.is_empty()).then(|| body.to_vec()),
        };

        let upstream_body = if body.is_empty() {
            empty_body()
        } else {
            full_body(body)
        };
        let upstream_req = match upstream_request(parts.method, &target, headers, upstream_body) {
            Ok(req) => req,
            Err(e) => return self.bad_target(e),
        };

        let started_at = Utc::now();
        let start = Instant::now();
        let upstream = match self.config.client.request(upstream_req).await {
            Ok(upstream) => upstream,
            Err(e) => return self.upstream_failed(&target, e),
        };

        let (head, mut upstream_body) = upstream.into_parts();
        let response_headers = strip_hop_by_hop(&head.headers);
        let recorded_headers = header_pairs(&response_headers);
        let status = head.status;

        let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(TEE_CHANNEL_CAPACITY);
        let config = self.config.clone();
        self.config.tracker.spawn(async move {
            let mut captured = Vec::new();
            let mut client_open = true;

            while let Some(frame) = upstream_body.frame().await {
                let chunk = match frame {
                    Ok(frame) => match frame.into_data() {
                        Ok(chunk) => chunk,
                        // Trailers are not part of the receipt.
                        Err(_) => continue,
                    },
                    Err(e) => {
                        tracing::warn!(url = %target, error = %e, "Upstream body failed mid-stream");
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };

                config.stats.add_bytes(chunk.len() as u64);
                captured.extend_from_slice(&chunk);
                if client_open && tx.send(Ok(chunk)).await.is_err() {
                    client_open = false;
                    tracing::debug!(url = %target, "Client went away, draining upstream");
                }
            }
            drop(tx);

            let exchange = Exchange {
                request: observed,
                response: Some(ObservedResponse {
                    status_code: status.as_u16(),
                    headers: recorded_headers,
                    body: (!captured.is_empty()).then_some(captured),
                }),
                started_at,
                completed_at: Utc::now(),
                duration: start.elapsed(),
            };
            record(&config, exchange).await;
        });

        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item.map(Frame::data), rx))
        });
        let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    /// Streams the request and response through untouched apart from
    /// hop-by-hop headers. No receipt.
    async fn pass_through(&self, req: Request<Incoming>, target: Url) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let stats = self.config.stats.clone();
        let body = body
            .map_frame(move |frame| {
                if let Some(data) = frame.data_ref() {
                    stats.add_bytes(data.len() as u64);
                }
                frame
            })
            .map_err(BoxError::from)
            .boxed_unsync();

        let headers = strip_hop_by_hop(&parts.headers);
        let upstream_req = match upstream_request(parts.method, &target, headers, body) {
            Ok(req) => req,
            Err(e) => return self.bad_target(e),
        };

        let upstream = match self.config.client.request(upstream_req).await {
            Ok(upstream) => upstream,
            Err(e) => return self.upstream_failed(&target, e),
        };

        let (head, body) = upstream.into_parts();
        let stats = self.config.stats.clone();
        let body = body
            .map_frame(move |frame| {
                if let Some(data) = frame.data_ref() {
                    stats.add_bytes(data.len() as u64);
                }
                frame
            })
            .map_err(move |e| {
                tracing::warn!(url = %target, error = %e, "Upstream body failed mid-stream");
                BoxError::from(e)
            })
            .boxed_unsync();

        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = strip_hop_by_hop(&head.headers);
        response
    }

    /// Opens a raw TCP tunnel. Encrypted traffic is relayed blind.
    async fn tunnel(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            self.config.stats.record_error();
            tracing::warn!(uri = %req.uri(), "CONNECT without authority");
            return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(443);

        if let Err(e) = self.check_loop(&host, port).await {
            return self.loop_detected(e);
        }

        if self.config.targets.is_match(&host) {
            tracing::info!(
                host = %host,
                port,
                "Tunnel to allow-listed host, encrypted traffic is not receipted"
            );
        } else {
            tracing::debug!("Tunneling to {}:{}", host, port);
        }

        let upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.config.stats.record_error();
                tracing::warn!(host = %host, port, error = %e, "Tunnel connect failed");
                return text_response(StatusCode::BAD_GATEWAY, format!("connect failed: {e}"));
            }
        };
        self.config.stats.record_tunnel();

        let stats = self.config.stats.clone();
        self.config.tracker.spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    let mut upstream = upstream;
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((sent, received)) => {
                            stats.add_bytes(sent + received);
                            tracing::debug!(host = %host, sent, received, "Tunnel closed");
                        }
                        Err(e) => tracing::debug!(host = %host, error = %e, "Tunnel ended"),
                    }
                }
                Err(e) => tracing::warn!(host = %host, error = %e, "Tunnel upgrade failed"),
            }
        });

        empty_response(StatusCode::OK)
    }

    fn bad_target(&self, e: ProxyError) -> Response<ProxyBody> {
        self.config.stats.record_error();
        tracing::warn!(error = %e, "Rejecting request");
        text_response(StatusCode::BAD_REQUEST, e.to_string())
    }

    fn upstream_failed(
        &self,
        target: &Url,
        e: hyper_util::client::legacy::Error,
    ) -> Response<ProxyBody> {
        self.config.stats.record_error();
        tracing::warn!(url = %target, error = %e, "Upstream request failed");
        text_response(StatusCode::BAD_GATEWAY, format!("upstream request failed: {e}"))
    }
}

/// Generates and stores the receipt for a finished exchange.
async fn record(config: &HandlerConfig, exchange: Exchange) {
    let receipt = config.generator.generate(&exchange);
    let action_id = receipt.action_id.clone();
    let tool_name = receipt.tool_name.clone();
    let status = receipt.status;
    let duration_ms = receipt.duration_ms;

    let store = config.store.clone();
    match tokio::task::spawn_blocking(move || store.save(receipt)).await {
        Ok(durability) => {
            config.stats.record_receipt();
            tracing::info!(
                action_id = %action_id,
                tool = %tool_name,
                status = %status,
                duration_ms,
                persisted = durability.is_persisted(),
                "Receipt generated"
            );
        }
        Err(e) => {
            config.stats.record_error();
            tracing::error!(action_id = %action_id, error = %e, "Receipt save task failed");
        }
    }
}

/// Works out the upstream URL from an absolute-form URI or from the Host
/// header of an origin-form request.
pub fn resolve_target<B>(req: &Request<B>) -> Result<Url, ProxyError> {
    let uri = req.uri();

    if uri.scheme().is_some() {
        let url = Url::parse(&uri.to_string())
            .map_err(|e| ProxyError::InvalidTarget(format!("{uri}: {e}")))?;
        return match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(ProxyError::InvalidTarget(format!("unsupported target {url}"))),
        };
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::InvalidTarget("missing Host header".to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Url::parse(&format!("http://{host}{path}"))
        .map_err(|e| ProxyError::InvalidTarget(format!("{host}{path}: {e}")))
}

/// True when connecting to `addr` would reach one of `listeners`.
///
/// Loopback and unspecified addresses all count as this machine.
pub fn is_own_listener(addr: SocketAddr, listeners: &[SocketAddr]) -> bool {
    let local = |ip: IpAddr| ip.is_loopback() || ip.is_unspecified();
    listeners.iter().any(|listener| {
        listener.port() == addr.port()
            && (listener.ip() == addr.ip() || (local(listener.ip()) && local(addr.ip())))
    })
}

/// Copies `headers` minus hop-by-hop headers and anything `Connection` names.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP_HEADERS.contains(&name) && !named.iter().any(|n| n == name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn upstream_request(
    method: Method,
    target: &Url,
    headers: HeaderMap,
    body: ProxyBody,
) -> Result<Request<ProxyBody>, ProxyError> {
    let uri: Uri = target
        .as_str()
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{target}: {e}")))?;

    let mut req = Request::new(body);
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.headers_mut() = headers;
    Ok(req)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = text_response(status, json);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
