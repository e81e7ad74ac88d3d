//! FAIL Kit Server - read-only inspection API.
//!
//! Exposes the receipt store and live proxy counters over HTTP for
//! dashboards, audits and enforcement gates. Nothing here mutates state.
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /api/stats` - Proxy counters and store aggregates
//! - `GET /api/receipts` - Filter and paginate receipts
//! - `GET /api/receipts/{action_id}` - Single receipt
//! - `GET /api/receipts/{action_id}/verify` - Validate and re-hash a receipt
//! - `GET /api/store/stats` - Store aggregates
//! - `GET /api/export?format=json|csv` - Export every indexed receipt
//! - `GET /api/config` - Effective configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use failkit_core::ProxySettings;
//! use failkit_proxy::ProxyStats;
//! use failkit_server::{AppState, Server, ServerConfig};
//! use failkit_storage::{ReceiptStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(ReceiptStore::open(StoreConfig::new("./receipts")).unwrap());
//!     let state = AppState::new(store, Arc::new(ProxyStats::new()), ProxySettings::default());
//!     let server = Server::new(ServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = failkit_core::settings::DEFAULT_API_PORT;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8081).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router over the given state.
pub fn router(state: AppState) -> Router {
    // Dashboards read the API from the browser.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/receipts", get(handlers::list_receipts))
        .route("/api/receipts/{action_id}", get(handlers::get_receipt))
        .route("/api/receipts/{action_id}/verify", get(handlers::verify))
        .route("/api/store/stats", get(handlers::get_store_stats))
        .route("/api/export", get(handlers::export))
        .route("/api/config", get(handlers::get_config))
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server with the given application state.
    pub fn new(config: ServerConfig, state: AppState) -> std::result::Result<Self, ServerError> {
        let ip: std::net::IpAddr = config
            .host
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;
        let addr = SocketAddr::new(ip, config.port);

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `signal` resolves, then drains open requests.
    pub async fn run_until<F>(self, signal: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind()?;
        info!("Starting FAIL Kit API server on {}", self.addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("API server stopped");
        Ok(())
    }

    fn bind(&self) -> std::result::Result<tokio::net::TcpListener, ServerError> {
        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        // Create socket with SO_REUSEADDR to allow binding even when sockets are lingering
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Set non-blocking for tokio
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use failkit_core::{
        Exchange, GeneratorConfig, ObservedRequest, ObservedResponse, ProxySettings, Receipt,
        ReceiptGenerator,
    };
    use failkit_proxy::ProxyStats;
    use failkit_storage::{ReceiptStore, StoreConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    struct TestApp {
        router: Router,
        receipts: Vec<Receipt>,
        _dir: TempDir,
    }

    fn exchange(host: &str, status: u16, minute: u32) -> Exchange {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, minute, 0).unwrap();
        Exchange {
            request: ObservedRequest {
                method: "POST".into(),
                url: format!("https://{host}/v1/op"),
                headers: vec![
                    ("content-type".into(), "application/json".into()),
                    ("authorization".into(), "Bearer sk-secret".into()),
                ],
                body: Some(br#"{"op":1}"#.to_vec()),
            },
            response: Some(ObservedResponse {
                status_code: status,
                headers: vec![("content-type".into(), "application/json".into())],
                body: Some(br#"{"ok":true}"#.to_vec()),
            }),
            started_at: at,
            completed_at: at,
            duration: Duration::from_millis(120),
        }
    }

    fn create_test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ReceiptStore::open(StoreConfig::new(dir.path())).unwrap());
        let generator = ReceiptGenerator::new(GeneratorConfig {
            include_bodies: true,
            ..GeneratorConfig::default()
        });

        let receipts: Vec<Receipt> = [
            ("api.openai.com", 200, 1),
            ("api.stripe.com", 500, 2),
            ("api.openai.com", 504, 3),
        ]
        .into_iter()
        .map(|(host, status, minute)| {
            let receipt = generator.generate(&exchange(host, status, minute));
            store.save(receipt.clone());
            receipt
        })
        .collect();

        let settings = ProxySettings {
            webhook_url: Some("https://hooks.example.com/T000/secret-token".into()),
            ..ProxySettings::default()
        };
        let state = AppState::new(store, Arc::new(ProxyStats::new()), settings);

        TestApp {
            router: router(state),
            receipts,
            _dir: dir,
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_test_app();
        let (status, json) = get_json(app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_receipts() {
        let app = create_test_app();
        let (status, json) = get_json(app.router, "/api/receipts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 3);
        assert_eq!(json["offset"], 0);
        assert_eq!(json["limit"], 100);

        let receipts = json["receipts"].as_array().unwrap();
        assert_eq!(receipts.len(), 3);
        // Newest first.
        assert_eq!(receipts[0]["status"], "timeout");
        assert_eq!(receipts[2]["status"], "success");
    }

    #[tokio::test]
    async fn test_list_receipts_filtered() {
        let app = create_test_app();
        let (status, json) = get_json(
            app.router.clone(),
            "/api/receipts?tool_category=llm&status=success",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["receipts"][0]["tool_name"], "openai");

        let (_, json) = get_json(
            app.router.clone(),
            "/api/receipts?from=2026-10-19T09:02:00Z&to=2026-10-19T09:03:00Z",
        )
        .await;
        assert_eq!(json["total"], 2);

        let (_, json) = get_json(app.router, "/api/receipts?offset=1&limit=1").await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["limit"], 1);
        assert_eq!(json["receipts"].as_array().unwrap().len(), 1);
        assert_eq!(json["receipts"][0]["tool_name"], "stripe");
    }

    #[tokio::test]
    async fn test_unknown_status_is_bad_request() {
        let app = create_test_app();
        let (status, json) = get_json(app.router, "/api/receipts?status=exploded").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_get_receipt() {
        let app = create_test_app();
        let id = app.receipts[0].action_id.clone();

        let (status, json) = get_json(app.router.clone(), &format!("/api/receipts/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["action_id"], id.as_str());
        assert_eq!(json["request"]["headers"]["authorization"], "[REDACTED]");

        let (status, json) = get_json(app.router, "/api/receipts/missing_receipt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn test_verify_receipt() {
        let app = create_test_app();
        let id = app.receipts[1].action_id.clone();

        let (status, json) =
            get_json(app.router, &format!("/api/receipts/{id}/verify")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["valid"], true);
        assert_eq!(json["errors"].as_array().unwrap().len(), 0);
        assert_eq!(json["verification"]["result"], "verified");
    }

    #[tokio::test]
    async fn test_stats() {
        let app = create_test_app();
        let (status, json) = get_json(app.router.clone(), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["proxy"]["requests_total"], 0);
        assert_eq!(json["store"]["total_receipts"], 3);

        let (status, json) = get_json(app.router, "/api/store/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["by_category"]["llm"], 2);
        assert_eq!(json["by_status"]["failure"], 1);
        assert_eq!(json["disk_write_failures"], 0);
        assert_eq!(json["webhook_failures"], 0);
    }

    #[tokio::test]
    async fn test_export_json() {
        let app = create_test_app();
        let (status, json) = get_json(app.router, "/api/export").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_export_csv() {
        let app = create_test_app();
        let request = Request::builder()
            .uri("/api/export?format=csv")
            .body(Body::empty())
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        assert!(response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("receipts.csv"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("action_id,tool_name,tool_category"));
        assert!(text.contains(&app.receipts[0].action_id));
    }

    #[tokio::test]
    async fn test_config_masks_webhook() {
        let app = create_test_app();
        let (status, json) = get_json(app.router, "/api/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["proxy_port"], 8080);
        assert_eq!(json["webhook_url"], "https://hooks.example.com");
        assert!(!json.to_string().contains("secret-token"));
    }

    #[test]
    fn test_invalid_address() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ReceiptStore::open(StoreConfig::new(dir.path())).unwrap());
        let state = AppState::new(store, Arc::new(ProxyStats::new()), ProxySettings::default());
        let config = ServerConfig::default().with_host("not a host");
        assert!(matches!(
            Server::new(config, state),
            Err(ServerError::Runtime(_))
        ));
    }
}
