//! End-to-end tests: a real upstream, the proxy, and a proxied client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use failkit_core::{validate_receipt, ReceiptStatus};
use failkit_proxy::{ProxyConfig, ProxyHandle, ProxyServer, ProxyStats, ProxyStatsSnapshot};
use failkit_storage::{ReceiptStore, StoreConfig};

const LLM_HOST: &str = "api.openai.example";
const OTHER_HOST: &str = "api.unlisted.example";

struct Harness {
    upstream: SocketAddr,
    proxy: ProxyHandle,
    store: Arc<ReceiptStore>,
    stats: Arc<ProxyStats>,
    _dir: TempDir,
}

impl Harness {
    fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.proxy.local_addr())).unwrap())
            .build()
            .unwrap()
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.upstream.port(), path)
    }
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(|_body: Bytes| async {
                tokio::time::sleep(Duration::from_millis(240)).await;
                (
                    StatusCode::OK,
                    [("content-type", "application/json")],
                    r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hi"}}]}"#,
                )
            }),
        )
        .route(
            "/v1/fail",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
        )
        .route("/v1/models", get(|| async { r#"{"data":[]}"# }))
        .route(
            "/inspect",
            post(|headers: HeaderMap, body: Bytes| async move {
                let mut seen: Vec<(String, String)> = headers
                    .iter()
                    .map(|(name, value)| {
                        let value = value.to_str().unwrap_or_default();
                        (name.as_str().to_string(), value.to_string())
                    })
                    .collect();
                seen.sort();
                axum::Json(serde_json::json!({
                    "headers": seen,
                    "body": String::from_utf8_lossy(&body),
                }))
            }),
        )
        .route(
            "/echo",
            post(|body: Bytes| async move { (StatusCode::CREATED, [("x-upstream", "echo")], body) }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn harness() -> Harness {
    let upstream = spawn_upstream().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ReceiptStore::open(StoreConfig::new(dir.path())).unwrap());

    let config = ProxyConfig::default()
        .with_port(0)
        .with_target_hosts([LLM_HOST, "127.0.0.1"])
        .with_shutdown_grace(Duration::from_secs(5))
        .with_resolve(LLM_HOST, upstream)
        .with_resolve(OTHER_HOST, upstream);
    let server = ProxyServer::new(config, store.clone());
    let stats = server.stats();
    let proxy = server.start().await.unwrap();

    Harness {
        upstream,
        proxy,
        store,
        stats,
        _dir: dir,
    }
}

async fn wait_for_receipts(store: &ReceiptStore, n: usize) {
    for _ in 0..250 {
        if store.len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {n} receipts, found {}", store.len());
}

async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn instrumented_request_produces_receipt() {
    let h = harness().await;

    let response = h
        .client()
        .post(h.url(LLM_HOST, "/v1/chat/completions"))
        .header("authorization", "Bearer sk-live-secret")
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("chatcmpl-1"));

    wait_for_receipts(&h.store, 1).await;
    let receipt = h.store.all().remove(0);

    assert_eq!(receipt.tool_name, "openai");
    assert_eq!(receipt.tool_category, "llm");
    assert_eq!(receipt.status, ReceiptStatus::Success);
    assert_eq!(receipt.status_code, Some(200));
    assert!(receipt.duration_ms >= 240, "duration {}", receipt.duration_ms);
    assert!(receipt.duration_ms < 5_000, "duration {}", receipt.duration_ms);
    assert_ne!(receipt.input_hash, receipt.output_hash);
    assert_eq!(receipt.request.method, "POST");
    assert_eq!(receipt.request.host, LLM_HOST);
    assert_eq!(receipt.request.path, "/v1/chat/completions");
    assert_eq!(receipt.response.content_type.as_deref(), Some("application/json"));
    assert!(validate_receipt(&receipt).valid);

    let persisted = serde_json::to_string(&receipt).unwrap();
    assert!(!persisted.contains("sk-live-secret"));

    let snap = h.stats.snapshot();
    assert_eq!(snap.requests_intercepted, 1);
    assert_eq!(snap.receipts_generated, 1);
    assert!(snap.bytes_transferred > 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_server_error_is_a_failure_receipt() {
    let h = harness().await;

    let response = h
        .client()
        .post(h.url(LLM_HOST, "/v1/fail"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "upstream exploded");

    wait_for_receipts(&h.store, 1).await;
    let receipt = h.store.all().remove(0);
    assert_eq!(receipt.status, ReceiptStatus::Failure);
    assert_eq!(receipt.status_code, Some(500));
    assert_eq!(h.stats.snapshot().errors, 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn pass_through_is_transparent_and_unreceipted() {
    let h = harness().await;
    let payload = "x".repeat(64 * 1024);

    let response = h
        .client()
        .post(h.url(OTHER_HOST, "/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["x-upstream"], "echo");
    assert_eq!(response.text().await.unwrap(), payload);

    let seen: serde_json::Value = h
        .client()
        .post(h.url(OTHER_HOST, "/inspect"))
        .header("x-trace-id", "trace-9")
        .body(payload.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let headers = seen["headers"].as_array().unwrap();
    assert!(headers.contains(&serde_json::json!(["x-trace-id", "trace-9"])));
    assert!(headers.contains(&serde_json::json!(["content-length", "65536"])));
    assert!(headers
        .iter()
        .all(|pair| !pair[0].as_str().unwrap().starts_with("proxy-")));
    assert_eq!(seen["body"], payload);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.is_empty());

    let snap = h.stats.snapshot();
    assert_eq!(snap.requests_passed_through, 2);
    assert_eq!(snap.requests_intercepted, 0);
    assert_eq!(snap.receipts_generated, 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn destination_receives_exactly_what_the_client_sent() {
    let h = harness().await;

    for host in [LLM_HOST, OTHER_HOST] {
        let authority = format!("{host}:{}", h.upstream.port());
        let request = format!(
            "POST http://{authority}/inspect HTTP/1.1\r\n\
             Host: {authority}\r\n\
             Content-Type: application/json\r\n\
             X-Trace-Id: trace-7\r\n\
             Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
             Proxy-Connection: keep-alive\r\n\
             Content-Length: 7\r\n\
             Connection: close\r\n\r\n\
             {{\"n\":1}}"
        );

        let response = raw_exchange(h.proxy.local_addr(), &request).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let seen: serde_json::Value = serde_json::from_str(body).unwrap();

        assert_eq!(
            seen["headers"],
            serde_json::json!([
                ["content-length", "7"],
                ["content-type", "application/json"],
                ["host", authority],
                ["x-trace-id", "trace-7"],
            ]),
            "headers seen upstream via {host}"
        );
        assert_eq!(seen["body"], r#"{"n":1}"#);
    }

    wait_for_receipts(&h.store, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.len(), 1);
    let receipt = h.store.all().remove(0);
    assert_eq!(receipt.request.host, LLM_HOST);

    let snap = h.stats.snapshot();
    assert_eq!(snap.requests_intercepted, 1);
    assert_eq!(snap.requests_passed_through, 1);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn requests_aimed_at_the_proxy_are_refused() {
    let h = harness().await;
    let proxy = h.proxy.local_addr();

    let builtin_post = format!(
        "POST /__proxy/stats HTTP/1.1\r\nHost: {proxy}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    let response = raw_exchange(proxy, &builtin_post).await;
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");

    let origin_form = format!("GET /anything HTTP/1.1\r\nHost: {proxy}\r\nConnection: close\r\n\r\n");
    let response = raw_exchange(proxy, &origin_form).await;
    assert!(response.starts_with("HTTP/1.1 508"), "{response}");

    let by_name = format!(
        "GET http://localhost:{port}/x HTTP/1.1\r\nHost: localhost:{port}\r\nConnection: close\r\n\r\n",
        port = proxy.port()
    );
    let response = raw_exchange(proxy, &by_name).await;
    assert!(response.starts_with("HTTP/1.1 508"), "{response}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = h.stats.snapshot();
    assert_eq!(snap.requests_total, 2);
    assert_eq!(snap.errors, 2);
    assert_eq!(snap.requests_intercepted, 0);
    assert_eq!(snap.requests_passed_through, 0);
    assert!(h.store.is_empty());

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn origin_form_request_uses_host_header() {
    let h = harness().await;
    let request = format!(
        "GET /v1/models HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        LLM_HOST,
        h.upstream.port()
    );

    let response = raw_exchange(h.proxy.local_addr(), &request).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"data":[]}"#));

    wait_for_receipts(&h.store, 1).await;
    assert_eq!(h.store.all()[0].request.path, "/v1/models");

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn connect_tunnel_relays_bytes_without_receipt() {
    let h = harness().await;
    let echo = spawn_tcp_echo().await;

    let mut stream = TcpStream::connect(h.proxy.local_addr()).await.unwrap();
    let connect = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    stream.write_all(b"ping through the tunnel").await.unwrap();
    let mut echoed = [0u8; 23];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");
    drop(stream);

    assert_eq!(h.stats.snapshot().tunnels_opened, 1);
    assert!(h.store.is_empty());

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn connect_to_closed_port_is_bad_gateway() {
    let h = harness().await;
    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };

    let request = format!("CONNECT {closed} HTTP/1.1\r\nHost: {closed}\r\nConnection: close\r\n\r\n");
    let response = raw_exchange(h.proxy.local_addr(), &request).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert_eq!(h.stats.snapshot().errors, 1);
    assert_eq!(h.stats.snapshot().tunnels_opened, 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn missing_host_is_bad_request() {
    let h = harness().await;

    let response = raw_exchange(h.proxy.local_addr(), "GET /nowhere HTTP/1.0\r\n\r\n").await;
    assert!(response.contains(" 400 "), "{response}");
    assert_eq!(h.stats.snapshot().errors, 1);
    assert!(h.store.is_empty());

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway_without_receipt() {
    let h = harness().await;
    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };

    let response = h
        .client()
        .post(format!("http://{LLM_HOST}:{}/v1/chat/completions", closed.port()))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.is_empty());
    let snap = h.stats.snapshot();
    assert_eq!(snap.errors, 1);
    assert_eq!(snap.receipts_generated, 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn builtin_endpoints() {
    let h = harness().await;
    let direct = reqwest::Client::builder().no_proxy().build().unwrap();
    let base = format!("http://{}", h.proxy.local_addr());

    let health: serde_json::Value = direct
        .get(format!("{base}/__proxy/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: ProxyStatsSnapshot = direct
        .get(format!("{base}/__proxy/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.requests_total, 0);

    let missing = direct
        .get(format!("{base}/__proxy/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_pending_receipts() {
    let h = harness().await;

    let response = h
        .client()
        .post(h.url(LLM_HOST, "/v1/chat/completions"))
        .body("{}")
        .send()
        .await
        .unwrap();
    response.bytes().await.unwrap();

    let store = h.store.clone();
    h.proxy.shutdown().await;
    assert_eq!(store.len(), 1);
}
