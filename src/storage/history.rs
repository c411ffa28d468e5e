use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use mediafetch_core::models::record::DownloadRecord;

use crate::error::{QueueError, Result};

const CSV_HEADER: &str = "ID,URL,Title,Status,Created,Completed,File Size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFormat {
    Json,
    Csv,
}

impl FromStr for HistoryFormat {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(HistoryFormat::Json),
            "csv" => Ok(HistoryFormat::Csv),
            other => Err(QueueError::invalid_input(format!(
                "unsupported history format '{}', expected json or csv",
                other
            ))),
        }
    }
}

impl HistoryFormat {
    /// Guesses the format from a file extension, defaulting to JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => HistoryFormat::Csv,
            _ => HistoryFormat::Json,
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn to_csv(records: &[DownloadRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for r in records {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            csv_field(&r.id),
            csv_field(&r.url),
            csv_field(&r.title),
            r.status,
            csv_time(&r.created_at),
            r.completed_at.as_ref().map(csv_time).unwrap_or_default(),
            r.file_size_bytes.map(|b| b.to_string()).unwrap_or_default(),
        );
    }
    out
}

pub fn export(path: &Path, format: HistoryFormat, records: &[DownloadRecord]) -> Result<()> {
    let body = match format {
        HistoryFormat::Json => serde_json::to_string_pretty(records)?,
        HistoryFormat::Csv => to_csv(records),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)?;
    Ok(())
}

/// Reads a JSON export. CSV is write-only.
pub fn import(path: &Path) -> Result<Vec<DownloadRecord>> {
    if HistoryFormat::from_path(path) == HistoryFormat::Csv {
        return Err(QueueError::invalid_input(
            "only JSON history files can be imported",
        ));
    }
    let content = std::fs::read_to_string(path)?;
    let records: Vec<DownloadRecord> = serde_json::from_str(&content)?;
    Ok(records)
}
