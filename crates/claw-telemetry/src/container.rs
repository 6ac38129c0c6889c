//! Container runtime log reader.
//!
//! Lists running containers with `docker ps` and reads each one's output
//! with `docker logs --timestamps --since`. Lines keep the runtime's
//! timestamp so they are stitched and classified like file lines.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::journal::run_command;
use crate::multiline::RawLine;
use crate::normalizer::{Origin, RawRecord};
use crate::source::LogSource;
use crate::traits::RecordReader;
use crate::types::SourceKind;

/// A running container as reported by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
}

/// Parses `docker ps --format '{{.ID}} {{.Names}}'` output.
#[must_use]
pub fn parse_container_list(stdout: &str) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let name = parts.next().unwrap_or(id);
            Some(ContainerSummary {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Splits a `docker logs --timestamps` line into its timestamp and text.
#[must_use]
pub fn parse_docker_log_line(line: &str) -> RawLine {
    if let Some((stamp, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(stamp) {
            return RawLine::with_timestamp(rest, ts.with_timezone(&Utc));
        }
    }
    RawLine::new(line)
}

/// Reads container output through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct ContainerReader {
    program: String,
    deadline: Duration,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl ContainerReader {
    /// Creates a reader with the given per-invocation timeout.
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            program: "docker".to_string(),
            deadline,
            last_seen: HashMap::new(),
        }
    }

    /// Overrides the binary name.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Converts one container's output into a line record.
    ///
    /// Lines stamped at or before the newest line already returned for this
    /// container are dropped.
    pub fn ingest(&mut self, container: &ContainerSummary, output: &str) -> Option<RawRecord> {
        let cursor = self.last_seen.get(&container.id).copied();
        let lines: Vec<RawLine> = output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_docker_log_line)
            .filter(|l| match (l.timestamp, cursor) {
                (Some(ts), Some(cursor)) => ts > cursor,
                _ => true,
            })
            .collect();

        if let Some(newest) = lines.iter().filter_map(|l| l.timestamp).max() {
            self.last_seen.insert(container.id.clone(), newest);
        }
        if lines.is_empty() {
            return None;
        }

        Some(RawRecord::Lines {
            origin: Origin::new(
                SourceKind::Container,
                container.id.clone(),
                container.name.clone(),
            ),
            lines,
        })
    }

    /// Forgets cursors for containers missing from `live`.
    pub fn retain_live(&mut self, live: &[ContainerSummary]) {
        let before = self.last_seen.len();
        self.last_seen.retain(|id, _| live.iter().any(|c| &c.id == id));
        let forgotten = before - self.last_seen.len();
        if forgotten > 0 {
            debug!(forgotten, "dropped cursors for exited containers");
        }
    }

    async fn list(&mut self, name_filter: &str) -> Result<Vec<ContainerSummary>> {
        let args = ["ps", "--format", "{{.ID}} {{.Names}}"].map(str::to_string);
        let output = run_command(&self.program, &args, self.deadline).await?;
        let containers = parse_container_list(&String::from_utf8_lossy(&output.stdout));
        self.retain_live(&containers);
        Ok(containers
            .into_iter()
            .filter(|c| name_filter.is_empty() || c.name.contains(name_filter))
            .collect())
    }
}

impl RecordReader for ContainerReader {
    fn read<'a>(
        &'a mut self,
        source: &'a LogSource,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let containers = self.list(&source.target).await?;
            let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
            let mut records = Vec::new();

            for container in containers {
                let args = vec![
                    "logs".to_string(),
                    "--timestamps".to_string(),
                    "--since".to_string(),
                    since.clone(),
                    container.id.clone(),
                ];
                match run_command(&self.program, &args, self.deadline).await {
                    Ok(output) => {
                        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                        text.push('\n');
                        text.push_str(&String::from_utf8_lossy(&output.stderr));
                        records.extend(self.ingest(&container, &text));
                    }
                    Err(e) => {
                        warn!(container = %container.name, error = %e, "container log read failed");
                    }
                }
            }

            debug!(records = records.len(), "container read complete");
            Ok(records)
        })
    }
}
