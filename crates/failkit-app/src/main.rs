//! FAIL Kit - receipt-producing interception proxy.
//!
//! This is the main binary that runs:
//! - The interception proxy (receipts for allow-listed hosts)
//! - The read-only inspection API
//!
//! `failkit verify <files>` checks receipt files offline instead.

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use failkit_core::{validate_receipt, verify_receipt, ProxySettings, Verification, PROXY_VERSION};
use failkit_proxy::{ProxyConfig, ProxyServer};
use failkit_server::{AppState, Server, ServerConfig};
use failkit_storage::{partition, ReceiptStore, StoreConfig};
use tokio::sync::oneshot;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Args, Command};

/// Initialize logging, with daily file rotation when a log directory is set.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("failkit={},warn", args.log_level())));

    if let Some(ref log_dir) = args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("failkit")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Runs the proxy and the inspection API until a shutdown signal arrives.
async fn serve(settings: ProxySettings) -> anyhow::Result<()> {
    let mut store_config = StoreConfig::new(&settings.receipts_dir)
        .with_max_receipts(settings.max_receipts)
        .with_recovery_limit(settings.recovery_limit);
    if let Some(ref url) = settings.webhook_url {
        store_config = store_config.with_webhook(url.clone());
    }
    let store = Arc::new(ReceiptStore::open(store_config)?);
    tracing::info!(
        receipts = store.len(),
        dir = ?settings.receipts_dir,
        "Receipt store opened"
    );

    let proxy = ProxyServer::new(ProxyConfig::from_settings(&settings)?, store.clone());
    let stats = proxy.stats();
    let proxy = proxy.start().await?;

    let api_config = ServerConfig::default()
        .with_host(settings.host.clone())
        .with_port(settings.api_port);
    let api = Server::new(api_config, AppState::new(store, stats, settings))?;
    let (api_stop, api_stopped) = oneshot::channel::<()>();
    let mut api_task = tokio::spawn(api.run_until(async move {
        let _ = api_stopped.await;
    }));

    let api_exited = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
            None
        }
        result = &mut api_task => Some(result),
    };

    proxy.shutdown().await;
    match api_exited {
        // The API only exits on its own after an error.
        Some(result) => {
            result??;
            anyhow::bail!("API server stopped unexpectedly");
        }
        None => {
            let _ = api_stop.send(());
            api_task.await??;
        }
    }
    Ok(())
}

/// Validates receipt files and re-checks their hashes where payloads were kept.
fn verify_files(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut failed = 0;
    for path in files {
        if !check_file(path) {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} receipts failed verification", failed, files.len());
    }
    Ok(())
}

fn check_file(path: &Path) -> bool {
    let receipt = match partition::read_receipt(path) {
        Ok(receipt) => receipt,
        Err(e) => {
            println!("{}: unreadable ({})", path.display(), e);
            return false;
        }
    };

    let report = validate_receipt(&receipt);
    let verification = verify_receipt(&receipt);
    let ok = report.valid && !matches!(verification, Verification::Mismatch { .. });

    let summary = serde_json::json!({
        "file": path.display().to_string(),
        "action_id": receipt.action_id,
        "valid": report.valid,
        "errors": report.errors,
        "verification": verification,
    });
    println!("{summary}");
    ok
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&args);

    if let Some(Command::Verify { ref files }) = args.command {
        return verify_files(files);
    }

    tracing::info!("Starting FAIL Kit receipt proxy v{}", PROXY_VERSION);
    let settings = args.to_settings()?;
    tracing::info!("Configuration: {}", serde_json::to_string(&settings)?);

    serve(settings).await?;

    tracing::info!("FAIL Kit shutting down");
    Ok(())
}
