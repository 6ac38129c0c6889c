//! systemd journal reader.
//!
//! Reads via `journalctl --output=json`, one JSON object per line. Records
//! at or before the newest timestamp already returned for a unit are
//! skipped, so overlapping `--since` windows never yield the same record
//! twice.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, TelemetryError};
use crate::normalizer::{Origin, RawRecord, StructuredRecord};
use crate::source::LogSource;
use crate::traits::RecordReader;
use crate::types::SourceKind;

/// Runs a local CLI with a deadline and returns its captured output.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    deadline: Duration,
) -> Result<Output> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(deadline, child)
        .await
        .map_err(|_| TelemetryError::Command(format!("{program} timed out after {deadline:?}")))?
        .map_err(|e| TelemetryError::SourceUnavailable(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TelemetryError::Command(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(output)
}

/// One decoded journal record plus its realtime cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    /// `__REALTIME_TIMESTAMP`, microseconds since the epoch.
    pub realtime_us: u64,
    /// The record, ready for normalization.
    pub record: StructuredRecord,
}

/// Parses one line of `journalctl --output=json`.
///
/// Returns `None` for lines that are not objects or carry no message.
#[must_use]
pub fn parse_journal_line(line: &str) -> Option<JournalRecord> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let message = match obj.get("MESSAGE")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(bytes) => {
            let raw: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&raw).into_owned()
        }
        _ => return None,
    };

    let text = |key: &str| obj.get(key).and_then(serde_json::Value::as_str);

    let realtime_us = text("__REALTIME_TIMESTAMP")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let timestamp = i64::try_from(realtime_us)
        .ok()
        .filter(|us| *us > 0)
        .and_then(DateTime::from_timestamp_micros);
    let priority = text("PRIORITY").and_then(|s| s.parse::<u8>().ok());
    let unit = text("_SYSTEMD_UNIT");
    let identifier = text("SYSLOG_IDENTIFIER");

    let service = identifier
        .map(str::to_string)
        .or_else(|| unit.map(|u| u.trim_end_matches(".service").to_string()))
        .unwrap_or_else(|| "journal".to_string());
    let locator = unit.or(identifier).unwrap_or_default();

    let mut origin = Origin::new(SourceKind::Journal, locator, service);
    origin.pid = text("_PID").and_then(|s| s.parse().ok());

    let mut fields = BTreeMap::new();
    if let Some(unit) = unit {
        fields.insert("journal.unit".to_string(), serde_json::json!(unit));
    }
    if let Some(identifier) = identifier {
        fields.insert(
            "journal.identifier".to_string(),
            serde_json::json!(identifier),
        );
    }

    Some(JournalRecord {
        realtime_us,
        record: StructuredRecord {
            origin,
            timestamp,
            priority,
            message,
            fields,
        },
    })
}

/// Reads the systemd journal through `journalctl`.
#[derive(Debug, Clone)]
pub struct JournalReader {
    program: String,
    deadline: Duration,
    cursors: HashMap<String, u64>,
}

impl JournalReader {
    /// Creates a reader with the given per-invocation timeout.
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            program: "journalctl".to_string(),
            deadline,
            cursors: HashMap::new(),
        }
    }

    /// Overrides the binary name, for hosts with a non-standard install.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Builds the journalctl argument list.
    #[must_use]
    pub fn args_for(unit: &str, since: DateTime<Utc>) -> Vec<String> {
        let mut args = vec![
            "--output=json".to_string(),
            "--no-pager".to_string(),
            format!("--since=@{}", since.timestamp()),
        ];
        if !unit.is_empty() {
            args.push("-u".to_string());
            args.push(unit.to_string());
        }
        args
    }

    /// Parses journalctl stdout and advances the cursor for `unit`.
    pub fn ingest(&mut self, unit: &str, stdout: &str) -> Vec<RawRecord> {
        let cursor = self.cursors.get(unit).copied().unwrap_or(0);
        let mut newest = cursor;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let Some(parsed) = parse_journal_line(line) else {
                skipped += 1;
                continue;
            };
            if parsed.realtime_us != 0 && parsed.realtime_us <= cursor {
                continue;
            }
            newest = newest.max(parsed.realtime_us);
            records.push(RawRecord::Structured(parsed.record));
        }

        if skipped > 0 {
            debug!(unit, skipped, "skipped unparseable journal lines");
        }
        self.cursors.insert(unit.to_string(), newest);
        records
    }
}

impl RecordReader for JournalReader {
    fn read<'a>(
        &'a mut self,
        source: &'a LogSource,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let args = Self::args_for(&source.target, since);
            let output = run_command(&self.program, &args, self.deadline)
                .await
                .inspect_err(|e| warn!(unit = %source.target, error = %e, "journal read failed"))?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(self.ingest(&source.target, &stdout))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    const SAMPLE: &str = r#"{"__REALTIME_TIMESTAMP":"1700000000000000","PRIORITY":"3","_SYSTEMD_UNIT":"nginx.service","SYSLOG_IDENTIFIER":"nginx","_PID":"812","MESSAGE":"upstream timed out"}"#;

    fn line(realtime_us: u64, message: &str) -> String {
        format!(
            r#"{{"__REALTIME_TIMESTAMP":"{realtime_us}","PRIORITY":"6","_SYSTEMD_UNIT":"cron.service","MESSAGE":"{message}"}}"#
        )
    }

    // ===========================================
    // Parsing Tests
    // ===========================================

    #[test]
    fn parses_full_record() {
        let parsed = parse_journal_line(SAMPLE).unwrap();
        let record = parsed.record;

        assert_eq!(parsed.realtime_us, 1_700_000_000_000_000);
        assert_eq!(record.priority, Some(3));
        assert_eq!(record.message, "upstream timed out");
        assert_eq!(record.origin.service, "nginx");
        assert_eq!(record.origin.locator, "nginx.service");
        assert_eq!(record.origin.pid, Some(812));
        assert_eq!(
            record.timestamp,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(Severity::from_priority(3), Severity::Error);
    }

    #[test]
    fn byte_array_message_is_decoded() {
        let parsed =
            parse_journal_line(r#"{"MESSAGE":[104,105,255],"_SYSTEMD_UNIT":"x.service"}"#).unwrap();
        assert!(parsed.record.message.starts_with("hi"));
        assert_eq!(parsed.record.origin.service, "x");
        assert_eq!(parsed.record.timestamp, None);
    }

    #[test]
    fn rejects_non_records() {
        assert!(parse_journal_line("not json").is_none());
        assert!(parse_journal_line(r#"{"PRIORITY":"3"}"#).is_none());
        assert!(parse_journal_line("[1,2]").is_none());
    }

    #[test]
    fn args_include_unit_only_when_set() {
        let since = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let all = JournalReader::args_for("", since);
        assert!(all.contains(&"--since=@1700000000".to_string()));
        assert!(!all.contains(&"-u".to_string()));

        let one = JournalReader::args_for("sshd.service", since);
        assert_eq!(&one[one.len() - 2..], ["-u", "sshd.service"]);
    }

    // ===========================================
    // Cursor Tests
    // ===========================================

    #[test]
    fn overlapping_windows_do_not_repeat() {
        let mut reader = JournalReader::new(Duration::from_secs(1));
        let first = format!("{}\n{}\n", line(10, "a"), line(20, "b"));
        assert_eq!(reader.ingest("cron.service", &first).len(), 2);

        let second = format!("{}\n{}\n", line(20, "b"), line(30, "c"));
        let records = reader.ingest("cron.service", &second);
        assert_eq!(records.len(), 1);
        match &records[0] {
            RawRecord::Structured(r) => assert_eq!(r.message, "c"),
            RawRecord::Lines { .. } => panic!("journal yields structured records"),
        }
    }

    #[test]
    fn cursors_are_per_unit() {
        let mut reader = JournalReader::new(Duration::from_secs(1));
        reader.ingest("a.service", &line(50, "x"));
        assert_eq!(reader.ingest("b.service", &line(40, "y")).len(), 1);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut reader = JournalReader::new(Duration::from_secs(1));
        let stdout = format!("-- No entries --\n{}\n", line(1, "ok"));
        assert_eq!(reader.ingest("", &stdout).len(), 1);
    }

    #[tokio::test]
    async fn missing_binary_is_source_unavailable() {
        let mut reader = JournalReader::new(Duration::from_secs(5))
            .with_program("claw-telemetry-no-such-journalctl");
        let err = reader
            .read(&LogSource::journal(""), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::SourceUnavailable(_)));
    }
}
