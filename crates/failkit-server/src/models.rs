//! API request and response models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use failkit_core::{Receipt, ReceiptStatus, ValidationReport, Verification};
use failkit_proxy::ProxyStatsSnapshot;
use failkit_storage::{ReceiptFilter, StoreStats};

use crate::error::ApiError;

/// Response body for GET /health.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Query parameters for GET /api/receipts.
#[derive(Debug, Default, Deserialize)]
pub struct ReceiptsQuery {
    pub tool_name: Option<String>,
    pub tool_category: Option<String>,
    /// `success`, `failure` or `timeout`.
    pub status: Option<String>,
    /// RFC 3339, inclusive.
    pub from: Option<DateTime<Utc>>,
    /// RFC 3339, inclusive.
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TryFrom<ReceiptsQuery> for ReceiptFilter {
    type Error = ApiError;

    fn try_from(query: ReceiptsQuery) -> Result<Self, Self::Error> {
        let status = match query.status.as_deref() {
            Some(raw) => Some(ReceiptStatus::parse(raw).ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "unknown status '{raw}', expected success, failure or timeout"
                ))
            })?),
            None => None,
        };

        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(ApiError::BadRequest("'from' is after 'to'".to_string()));
            }
        }

        Ok(ReceiptFilter {
            tool_name: query.tool_name,
            tool_category: query.tool_category,
            status,
            from: query.from,
            to: query.to,
            offset: query.offset,
            limit: query.limit,
        })
    }
}

/// Response body for GET /api/receipts.
#[derive(Debug, Serialize)]
pub struct ReceiptsResponse {
    pub receipts: Vec<Receipt>,
    /// Matches before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Response body for GET /api/receipts/{action_id}/verify.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub action_id: String,
    #[serde(flatten)]
    pub validation: ValidationReport,
    pub verification: Verification,
}

/// Response body for GET /api/stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub proxy: ProxyStatsSnapshot,
    pub store: StoreStats,
}

/// Export formats for GET /api/export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Query parameters for GET /api/export.
#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

/// CSV columns, in order.
pub const CSV_HEADER: [&str; 12] = [
    "action_id",
    "tool_name",
    "tool_category",
    "timestamp",
    "duration_ms",
    "status",
    "status_code",
    "method",
    "url",
    "input_hash",
    "output_hash",
    "proxy_version",
];

/// Flattens a receipt into a CSV row matching [`CSV_HEADER`].
pub fn csv_row(receipt: &Receipt) -> [String; 12] {
    [
        receipt.action_id.clone(),
        receipt.tool_name.clone(),
        receipt.tool_category.clone(),
        receipt.timestamp.to_rfc3339(),
        receipt.duration_ms.to_string(),
        receipt.status.to_string(),
        receipt
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_default(),
        receipt.request.method.clone(),
        receipt.request.url.clone(),
        receipt.input_hash.clone(),
        receipt.output_hash.clone(),
        receipt.metadata.proxy_version.clone(),
    ]
}
