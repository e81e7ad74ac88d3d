//! API route handlers.

use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use failkit_core::{validate_receipt, verify_receipt, ProxySettings, PROXY_VERSION};
use failkit_storage::{ReceiptFilter, StoreStats};

use crate::error::{ApiError, Result};
use crate::models::{
    csv_row, ExportFormat, ExportQuery, HealthResponse, ReceiptsQuery, ReceiptsResponse,
    StatsResponse, VerifyResponse, CSV_HEADER,
};
use crate::state::AppState;

/// GET /health - Liveness.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: PROXY_VERSION.to_string(),
        uptime_secs: state.proxy_stats.snapshot().uptime_secs,
    })
}

/// GET /api/stats - Proxy counters plus store aggregates.
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        proxy: state.proxy_stats.snapshot(),
        store: state.store.stats(),
    })
}

/// GET /api/store/stats - Store aggregates only.
pub async fn get_store_stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.store.stats())
}

/// GET /api/receipts - Filtered, paginated listing.
pub async fn list_receipts(
    State(state): State<AppState>,
    Query(query): Query<ReceiptsQuery>,
) -> Result<Json<ReceiptsResponse>> {
    let filter = ReceiptFilter::try_from(query)?;
    debug!(?filter, "Listing receipts");

    let total = state.store.count(&filter);
    let receipts = state.store.query(&filter);

    Ok(Json(ReceiptsResponse {
        receipts,
        total,
        offset: filter.offset,
        limit: filter.effective_limit(),
    }))
}

/// GET /api/receipts/{action_id} - Single receipt.
pub async fn get_receipt(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
) -> Result<Response> {
    state
        .store
        .get(&action_id)
        .map(|receipt| Json(receipt).into_response())
        .ok_or_else(|| ApiError::NotFound(format!("receipt {action_id}")))
}

/// GET /api/receipts/{action_id}/verify - Validation and hash verification.
pub async fn verify(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
) -> Result<Json<VerifyResponse>> {
    let receipt = state
        .store
        .get(&action_id)
        .ok_or_else(|| ApiError::NotFound(format!("receipt {action_id}")))?;

    Ok(Json(VerifyResponse {
        validation: validate_receipt(&receipt),
        verification: verify_receipt(&receipt),
        action_id,
    }))
}

/// GET /api/export - Every indexed receipt as JSON or CSV.
pub async fn export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let receipts = state.store.all();
    debug!(count = receipts.len(), format = ?query.format, "Exporting receipts");

    match query.format {
        ExportFormat::Json => Ok(Json(receipts).into_response()),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(CSV_HEADER)?;
            for receipt in &receipts {
                writer.write_record(csv_row(receipt))?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            Ok((
                [
                    (CONTENT_TYPE, "text/csv; charset=utf-8"),
                    (CONTENT_DISPOSITION, "attachment; filename=\"receipts.csv\""),
                ],
                bytes,
            )
                .into_response())
        }
    }
}

/// GET /api/config - Effective configuration.
pub async fn get_config(State(state): State<AppState>) -> Json<ProxySettings> {
    Json(state.settings.as_ref().clone())
}
