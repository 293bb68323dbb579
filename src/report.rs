//! Delivery report export
//!
//! Renders the event log as delimited text (CSV by default). Quoting follows
//! RFC 4180: a field containing the delimiter, a double quote, CR or LF is
//! wrapped in quotes with inner quotes doubled.

use crate::error::{Error, Result};
use crate::progress::EventLogEntry;
use chrono::{NaiveDate, SecondsFormat};
use std::path::{Path, PathBuf};

/// Column header, in record order
pub const COLUMNS: [&str; 7] = [
    "id",
    "recipient",
    "address",
    "status",
    "error",
    "confirmation",
    "timestamp",
];

/// Rendered report ready to be saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub file_name: String,
    pub contents: String,
    records: usize,
}

impl Report {
    /// Build a report for `entries`, named after `date`.
    pub fn new(entries: &[EventLogEntry], delimiter: char, date: NaiveDate) -> Self {
        Self {
            file_name: file_name(date),
            contents: export(entries, delimiter),
            records: entries.len(),
        }
    }

    /// Number of data records (excluding the header). Quoted fields may
    /// span several lines, so this is not a line count.
    pub fn record_count(&self) -> usize {
        self.records
    }
}

/// `send-report-YYYY-MM-DD.csv`
pub fn file_name(date: NaiveDate) -> String {
    format!("send-report-{}.csv", date.format("%Y-%m-%d"))
}

/// Render entries as delimited text. Empty input yields the header only.
pub fn export(entries: &[EventLogEntry], delimiter: char) -> String {
    let sep = delimiter.to_string();
    let mut out = COLUMNS.join(&sep);
    out.push('\n');

    for entry in entries {
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        let status = entry.status.to_string();
        let id = entry.id.to_string();
        let fields = [
            id.as_str(),
            entry.recipient_label.as_str(),
            entry.address.as_str(),
            status.as_str(),
            entry.error.as_deref().unwrap_or(""),
            entry.confirmation_meta.as_deref().unwrap_or(""),
            timestamp.as_str(),
        ];
        let record: Vec<String> = fields.iter().map(|f| quote(f, delimiter)).collect();
        out.push_str(&record.join(&sep));
        out.push('\n');
    }
    out
}

fn quote(field: &str, delimiter: char) -> String {
    let needs_quotes = field
        .chars()
        .any(|c| c == delimiter || c == '"' || c == '\r' || c == '\n');
    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write `report` into `dir`, creating the directory if needed.
pub async fn write_to_dir(dir: &Path, report: &Report) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::Report(format!(
            "Failed to create report directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    let path = dir.join(&report.file_name);
    tokio::fs::write(&path, report.contents.as_bytes())
        .await
        .map_err(|e| Error::Report(format!("Failed to write {}: {}", path.display(), e)))?;
    tracing::info!(path = %path.display(), records = report.record_count(), "Report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessageStatus;
    use crate::batch::MessageId;
    use chrono::{TimeZone, Utc};

    fn entry(label: &str, status: MessageStatus, error: Option<&str>) -> EventLogEntry {
        EventLogEntry {
            id: MessageId::new(),
            recipient_label: label.to_string(),
            address: "+5215550000".to_string(),
            status,
            error: error.map(str::to_string),
            confirmation_meta: None,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap(),
        }
    }

    #[test]
    fn test_empty_is_header_only() {
        assert_eq!(
            export(&[], ','),
            "id,recipient,address,status,error,confirmation,timestamp\n"
        );
    }

    #[test]
    fn test_plain_record() {
        let e = entry("Ana", MessageStatus::Success, None);
        let csv = export(std::slice::from_ref(&e), ',');
        let record = csv.lines().nth(1).unwrap();
        assert_eq!(
            record,
            format!("{},Ana,+5215550000,success,,,2024-03-09T14:05:00Z", e.id)
        );
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn test_quoting() {
        let e = entry(
            "Pérez, Ana",
            MessageStatus::Failed,
            Some("agent said \"no\"\nretry later"),
        );
        let csv = export(&[e], ',');
        assert!(csv.contains(",\"Pérez, Ana\","));
        assert!(csv.contains("\"agent said \"\"no\"\"\nretry later\""));
    }

    #[test]
    fn test_custom_delimiter() {
        let e = entry("Pérez, Ana", MessageStatus::Success, None);
        let csv = export(&[e], ';');
        assert!(csv.starts_with("id;recipient;address;"));
        // comma no longer needs quoting
        assert!(csv.contains(";Pérez, Ana;"));
    }

    #[test]
    fn test_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(file_name(date), "send-report-2024-03-09.csv");
    }

    #[test]
    fn test_record_count() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let report = Report::new(
            &[
                entry("a", MessageStatus::Success, None),
                entry("b", MessageStatus::Failed, Some("x")),
            ],
            ',',
            date,
        );
        assert_eq!(report.record_count(), 2);
        assert_eq!(Report::new(&[], ',', date).record_count(), 0);
    }

    #[test]
    fn test_record_count_with_multiline_field() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let report = Report::new(
            &[entry("Ana", MessageStatus::Failed, Some("line one\nline two"))],
            ',',
            date,
        );
        assert_eq!(report.contents.lines().count(), 3);
        assert_eq!(report.record_count(), 1);
    }

    #[tokio::test]
    async fn test_write_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("reports");
        let report = Report::new(
            &[entry("Ana", MessageStatus::Success, None)],
            ',',
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
        );

        let path = write_to_dir(&dir, &report).await.unwrap();
        assert_eq!(path, dir.join("send-report-2024-03-09.csv"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, report.contents);
    }
}
