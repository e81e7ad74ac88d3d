//! On-disk layout: one directory per UTC day, one JSON file per receipt.
//!
//! ```text
//! <root>/2026-10-19/llm_0192a4c1e2f3b5d6e7f8091a2b3c4d.json
//! <root>/2026-10-20/payment_...json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use failkit_core::Receipt;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

const DAY_FORMAT: &str = "%Y-%m-%d";
const EXTENSION: &str = "json";
const STAMP_LEN: usize = 13;

/// Directory for the day a receipt completed on.
pub fn partition_dir(root: &Path, receipt: &Receipt) -> PathBuf {
    root.join(receipt.timestamp.format(DAY_FORMAT).to_string())
}

/// Writes a receipt into its day partition, creating the directory if needed.
///
/// The record is written to a temporary file and renamed into place so a
/// crash never leaves a half-written receipt behind.
pub fn write_receipt(root: &Path, receipt: &Receipt) -> Result<PathBuf> {
    let dir = partition_dir(root, receipt);
    fs::create_dir_all(&dir)?;

    let path = dir.join(format!("{}.{}", receipt.action_id, EXTENSION));
    let tmp = dir.join(format!(".{}.tmp", receipt.action_id));
    let json = serde_json::to_vec_pretty(receipt)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;

    Ok(path)
}

/// Reads and parses a single receipt file.
pub fn read_receipt(path: &Path) -> Result<Receipt> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Day partitions under `root`, newest first. Non-date directories are ignored.
pub fn day_partitions(root: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut days: Vec<(NaiveDate, PathBuf)> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let date = NaiveDate::parse_from_str(name.to_str()?, DAY_FORMAT).ok()?;
            Some((date, entry.path()))
        })
        .collect();

    days.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(days)
}

fn receipt_files(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION))
        .collect())
}

/// Hex millisecond stamp embedded in a receipt file name, or "" if absent.
///
/// `llm_0192a4c1e2f3b5d6e7f8091a2b3c4d.json` -> `0192a4c1e2f3b`
fn file_stamp(path: &Path) -> &str {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit_once('_'))
        .and_then(|(_, suffix)| suffix.get(..STAMP_LEN))
        .unwrap_or_default()
}

/// Receipt files in a partition, newest stamp first.
fn newest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = receipt_files(dir)?;
    files.sort_by(|a, b| file_stamp(b).cmp(file_stamp(a)));
    Ok(files)
}

/// Outcome of scanning the partitions.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Parsed receipts, newest first, at most the requested limit.
    pub receipts: Vec<Receipt>,
    /// Files that could not be read or parsed.
    pub skipped: usize,
}

/// Loads up to `limit` of the most recent receipts.
///
/// Days are scanned newest first and files within a day by the timestamp
/// embedded in their name, so reading stops once `limit` receipts are in
/// hand. Malformed files are skipped with a warning.
pub fn load_recent(root: &Path, limit: usize) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    if limit == 0 {
        return Ok(report);
    }

    'days: for (date, dir) in day_partitions(root)? {
        let files = match newest_files(&dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(partition = %date, error = %e, "Skipping unreadable partition");
                continue;
            }
        };

        for path in files {
            if report.receipts.len() >= limit {
                break 'days;
            }
            match read_receipt(&path) {
                Ok(receipt) => report.receipts.push(receipt),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping malformed receipt file");
                    report.skipped += 1;
                }
            }
        }

        debug!(partition = %date, loaded = report.receipts.len(), "Scanned partition");
    }

    report
        .receipts
        .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(report)
}

/// Counts receipt artifacts across all partitions.
#[cfg(test)]
pub(crate) fn count_files(root: &Path) -> Result<usize> {
    let mut total = 0;
    for (_, dir) in day_partitions(root)? {
        total += receipt_files(&dir)?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use failkit_core::{Exchange, ObservedRequest, ReceiptGenerator};
    use tempfile::TempDir;

    use super::*;

    fn receipt_at(host: &str, second: u32) -> Receipt {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, second).unwrap();
        ReceiptGenerator::default().generate(&Exchange {
            request: ObservedRequest {
                method: "GET".into(),
                url: format!("https://{host}/status"),
                ..Default::default()
            },
            response: None,
            started_at: at,
            completed_at: at,
            duration: Duration::ZERO,
        })
    }

    #[test]
    fn file_stamp_reads_hex_millis() {
        let path = Path::new("/r/2026-10-19/llm_0192a4c1e2f3b5d6e7f8091a2b3c4d.json");
        assert_eq!(file_stamp(path), "0192a4c1e2f3b");
        assert_eq!(file_stamp(Path::new("/r/garbage.json")), "");
    }

    #[test]
    fn load_recent_stops_at_limit() {
        let dir = TempDir::new().unwrap();
        // Mixed categories so name order differs from time order.
        let hosts = ["api.stripe.com", "api.openai.com", "s3.amazonaws.com"];
        for second in 0..30 {
            write_receipt(dir.path(), &receipt_at(hosts[second as usize % 3], second)).unwrap();
        }
        // Older than everything else; never reached when the limit is small.
        let day = dir.path().join("2026-10-19");
        fs::write(day.join("llm_0000000000001ffffffffffffffff.json"), b"{not json").unwrap();

        let report = load_recent(dir.path(), 5).unwrap();
        assert_eq!(report.skipped, 0);
        let seconds: Vec<u32> = report
            .receipts
            .iter()
            .map(|r| r.timestamp.timestamp() as u32 % 60)
            .collect();
        assert_eq!(seconds, vec![29, 28, 27, 26, 25]);

        let report = load_recent(dir.path(), 100).unwrap();
        assert_eq!(report.receipts.len(), 30);
        assert_eq!(report.skipped, 1);
    }
}
