//! Per-entry transfer records.
//!
//! Every file or directory a run lands at the destination produces one
//! [`TransferRecord`]. [`JsonLinesReporter`] appends them to a writer as one
//! JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BundleError;

/// How an entry reached the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferMethod {
    /// Created in place, without moving data.
    Put,
    /// Moved by the bundle pipeline.
    Bput,
}

/// One landed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub method: TransferMethod,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub source_path: PathBuf,
    pub dest_path: String,
    pub source_size: i64,
    pub dest_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_checksum: Option<String>,
    /// Free-form tags such as `bundle_idx:3`.
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Receives a record for every landed entry. Called from pipeline tasks.
pub trait TransferReporter: Send + Sync {
    fn record(&self, record: &TransferRecord) -> Result<(), BundleError>;
}

/// Discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl TransferReporter for NoopReporter {
    fn record(&self, _record: &TransferRecord) -> Result<(), BundleError> {
        Ok(())
    }
}

/// Writes each record as a JSON line and flushes it.
pub struct JsonLinesReporter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JsonLinesReporter<BufWriter<File>> {
    /// Appends to `path`, creating it if needed.
    pub fn append(path: &Path) -> Result<Self, BundleError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> TransferReporter for JsonLinesReporter<W> {
    fn record(&self, record: &TransferRecord) -> Result<(), BundleError> {
        let line = serde_json::to_string(record)?;
        let mut out = self.out.lock().unwrap();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(dest: &str, notes: &[&str]) -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            method: TransferMethod::Bput,
            start_at: now,
            end_at: now,
            source_path: PathBuf::from("/data/run01.dat"),
            dest_path: dest.into(),
            source_size: 12,
            dest_size: 12,
            source_checksum: None,
            dest_checksum: None,
            notes: notes.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[test]
    fn records_are_written_one_per_line() {
        let reporter = JsonLinesReporter::new(Vec::new());
        reporter.record(&record("/zone/a", &["no-bundle", "bundle_idx:0"])).unwrap();
        reporter.record(&record("/zone/b", &["bundle_extracted"])).unwrap();

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["method"], "BPUT");
        assert_eq!(first["dest_path"], "/zone/a");
        assert_eq!(first["notes"][1], "bundle_idx:0");
        assert!(first.get("dest_checksum").is_none());

        let second: TransferRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.method, TransferMethod::Bput);
        assert_eq!(second.source_path, PathBuf::from("/data/run01.dat"));
        assert_eq!(second.notes, vec!["bundle_extracted".to_string()]);
    }

    #[test]
    fn append_keeps_earlier_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.jsonl");
        for dest in ["/zone/a", "/zone/b"] {
            let reporter = JsonLinesReporter::append(&path).unwrap();
            reporter.record(&record(dest, &[])).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.contains("\"method\":\"BPUT\"")));
    }
}
