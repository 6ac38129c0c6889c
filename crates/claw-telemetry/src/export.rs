//! Batch export to the remote collector.
//!
//! This module provides:
//! - [`Exporter`] - Encodes a batch and delivers it with bounded retry
//! - [`HttpTransport`] - The `reqwest`-backed [`Transport`]
//! - [`ExportError`] - Send-path failures
//!
//! Batches are shaped like OTLP/JSON `resourceLogs`, serialized with
//! `serde_json` and gzip-compressed before posting.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, TelemetryError};
use crate::traits::{ExportRequest, Transport};
use crate::types::LogEntry;

/// Name reported as the instrumentation scope and collector.
pub const COLLECTOR_NAME: &str = "claw-telemetry";

/// Version reported alongside [`COLLECTOR_NAME`].
pub const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors from sending a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// The collector refused the batch; retrying will not help.
    #[error("collector rejected batch with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// Every attempt failed with a retryable error.
    #[error("export failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Description of the final failure.
        last_error: String,
    },

    /// The batch could not be serialized or compressed.
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

// ===========================================
// Wire Envelope
// ===========================================

/// Top-level export payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// One resource block per batch.
    pub resource_logs: Vec<ResourceLogs>,
}

/// Logs grouped under one resource.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    /// Resource description.
    pub resource: Resource,
    /// Logs grouped by scope.
    pub scope_logs: Vec<ScopeLogs>,
}

/// Attributes describing the producing host and pipeline.
#[derive(Debug, Serialize)]
pub struct Resource {
    /// Resource attributes.
    pub attributes: Vec<KeyValue>,
}

/// Logs from one instrumentation scope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    /// Scope identity.
    pub scope: Scope,
    /// The records.
    pub log_records: Vec<LogRecord>,
}

/// Instrumentation scope.
#[derive(Debug, Serialize)]
pub struct Scope {
    /// Scope name.
    pub name: String,
    /// Scope version.
    pub version: String,
}

/// One exported log record.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Nanoseconds since the epoch, as a decimal string.
    pub time_unix_nano: String,
    /// OTLP severity number.
    pub severity_number: u8,
    /// OTLP severity text.
    pub severity_text: String,
    /// Message body.
    pub body: AnyValue,
    /// Record attributes.
    pub attributes: Vec<KeyValue>,
}

/// Attribute key/value pair.
#[derive(Debug, Serialize)]
pub struct KeyValue {
    /// Attribute name.
    pub key: String,
    /// Attribute value.
    pub value: AnyValue,
}

impl KeyValue {
    fn string(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: AnyValue::StringValue(value.into()),
        }
    }
}

/// Attribute or body value.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    /// A string.
    StringValue(String),
    /// A 64-bit integer, encoded as a string per OTLP/JSON.
    IntValue(String),
}

impl From<&LogEntry> for LogRecord {
    fn from(entry: &LogEntry) -> Self {
        let mut attributes = vec![
            KeyValue::string("log.source", entry.source.as_str()),
            KeyValue::string("log.file.path", entry.locator.as_str()),
            KeyValue::string("service.name", entry.service.as_str()),
        ];
        if let Some(id) = entry.container_id() {
            attributes.push(KeyValue::string("container.id", id));
        }
        if let Some(pid) = entry.pid {
            attributes.push(KeyValue {
                key: "process.pid".to_string(),
                value: AnyValue::IntValue(pid.to_string()),
            });
        }
        attributes.push(KeyValue::string("host.name", entry.host.as_str()));
        attributes.push(KeyValue::string("log.content_hash", entry.content_hash.as_str()));
        for (key, value) in &entry.fields {
            let text = value
                .as_str()
                .map_or_else(|| value.to_string(), str::to_string);
            attributes.push(KeyValue::string(key, text));
        }

        Self {
            time_unix_nano: entry
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
            severity_number: entry.severity.otlp_number(),
            severity_text: entry.severity.otlp_text().to_string(),
            body: AnyValue::StringValue(entry.message.clone()),
            attributes,
        }
    }
}

// ===========================================
// Exporter
// ===========================================

/// Sends batches to the collector with bounded exponential backoff.
pub struct Exporter {
    transport: Arc<dyn Transport>,
    endpoint: String,
    pipeline_id: String,
    api_key: String,
    host: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("endpoint", &self.endpoint)
            .field("pipeline_id", &self.pipeline_id)
            .field("host", &self.host)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    /// Creates an exporter from pipeline settings.
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        host: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            endpoint: config.endpoint.clone(),
            pipeline_id: config.pipeline_id.clone(),
            api_key: config.api_key.clone(),
            host: host.into(),
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }

    /// Builds the envelope for a batch.
    #[must_use]
    pub fn envelope(&self, entries: &[LogEntry]) -> Envelope {
        Envelope {
            resource_logs: vec![ResourceLogs {
                resource: Resource {
                    attributes: vec![
                        KeyValue::string("host.name", self.host.as_str()),
                        KeyValue::string("pipeline.id", self.pipeline_id.as_str()),
                        KeyValue::string("collector.name", COLLECTOR_NAME),
                        KeyValue::string("collector.version", COLLECTOR_VERSION),
                        KeyValue::string("collector.endpoint", self.endpoint.as_str()),
                    ],
                },
                scope_logs: vec![ScopeLogs {
                    scope: Scope {
                        name: COLLECTOR_NAME.to_string(),
                        version: COLLECTOR_VERSION.to_string(),
                    },
                    log_records: entries.iter().map(LogRecord::from).collect(),
                }],
            }],
        }
    }

    /// Serializes and gzips a batch into a ready-to-post request.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Encode`] if serialization or compression fails.
    pub fn build_request(
        &self,
        entries: &[LogEntry],
    ) -> std::result::Result<ExportRequest, ExportError> {
        let json = serde_json::to_vec(&self.envelope(entries))
            .map_err(|e| ExportError::Encode(e.to_string()))?;
        let body = gzip(&json).map_err(|e| ExportError::Encode(e.to_string()))?;

        Ok(ExportRequest {
            url: self.endpoint.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Encoding".to_string(), "gzip".to_string()),
                ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
                ("X-Pipeline-Id".to_string(), self.pipeline_id.clone()),
            ],
            body,
        })
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Sends a batch.
    ///
    /// 2xx is success. 4xx other than 429 is terminal. Everything else,
    /// including transport failures, is retried up to the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Rejected`] on a terminal status and
    /// [`ExportError::Exhausted`] once every attempt has failed.
    pub async fn send(&self, entries: &[LogEntry]) -> std::result::Result<(), ExportError> {
        if entries.is_empty() {
            return Ok(());
        }
        let request = self.build_request(entries)?;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.transport.post(request.clone()).await {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(entries = entries.len(), attempt, "batch delivered");
                    return Ok(());
                }
                Ok(status) if (400..500).contains(&status) && status != 429 => {
                    warn!(status, entries = entries.len(), "collector rejected batch");
                    return Err(ExportError::Rejected { status });
                }
                Ok(status) => last_error = format!("status {status}"),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < self.max_attempts {
                let delay = self.backoff_delay(attempt);
                info!(attempt, error = %last_error, ?delay, "export failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        warn!(attempts = self.max_attempts, error = %last_error, "giving up on batch");
        Err(ExportError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

// ===========================================
// HTTP Transport
// ===========================================

/// [`Transport`] over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::Transport` if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post<'a>(
        &'a self,
        request: ExportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.post(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .body(request.body)
                .send()
                .await
                .map_err(|e| TelemetryError::Transport(e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SourceKind};
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;
    use parking_lot::Mutex;
    use std::io::Read;
    use test_case::test_case;

    /// Transport replaying scripted responses in order, then 200.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<u16>>>,
        requests: Mutex<Vec<ExportRequest>>,
    }

    impl ScriptedTransport {
        fn new(mut script: Vec<Result<u16>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl Transport for ScriptedTransport {
        fn post<'a>(
            &'a self,
            request: ExportRequest,
        ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().push(request);
                self.script.lock().pop().unwrap_or(Ok(200))
            })
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new("pipe-7", "s3cret")
            .with_endpoint("https://collector.example/v1/logs");
        config.retry_base_delay_ms = 100;
        config
    }

    fn entry(source: SourceKind, locator: &str) -> LogEntry {
        LogEntry::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
            Severity::Error,
            "boom",
            source,
            locator,
            "web",
            "host-a",
        )
    }

    fn decode(request: &ExportRequest) -> serde_json::Value {
        let mut json = String::new();
        GzDecoder::new(request.body.as_slice())
            .read_to_string(&mut json)
            .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    // ===========================================
    // Envelope Tests
    // ===========================================

    #[test]
    fn request_carries_headers_and_gzip_body() {
        let exporter = Exporter::new(&config(), "host-a", ScriptedTransport::new(vec![]));
        let request = exporter
            .build_request(&[entry(SourceKind::File, "/var/log/app.log")])
            .unwrap();

        assert_eq!(request.url, "https://collector.example/v1/logs");
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("content-encoding"), Some("gzip"));
        assert_eq!(request.header("authorization"), Some("Bearer s3cret"));
        assert_eq!(request.header("x-pipeline-id"), Some("pipe-7"));
        assert_eq!(&request.body[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn envelope_shape() {
        let exporter = Exporter::new(&config(), "host-a", ScriptedTransport::new(vec![]));
        let mut container = entry(SourceKind::Container, "abc123").with_pid(Some(99));
        container
            .fields
            .insert("journal.unit".to_string(), serde_json::json!("x.service"));
        let request = exporter
            .build_request(&[entry(SourceKind::File, "/var/log/app.log"), container])
            .unwrap();
        let json = decode(&request);

        let resource = &json["resourceLogs"][0];
        let resource_keys: Vec<&str> = resource["resource"]["attributes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|kv| kv["key"].as_str().unwrap())
            .collect();
        assert_eq!(
            resource_keys,
            vec![
                "host.name",
                "pipeline.id",
                "collector.name",
                "collector.version",
                "collector.endpoint",
            ]
        );
        assert_eq!(resource["scopeLogs"][0]["scope"]["name"], COLLECTOR_NAME);

        let records = resource["scopeLogs"][0]["logRecords"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["timeUnixNano"], "1704067201000000000");
        assert_eq!(records[0]["severityNumber"], 17);
        assert_eq!(records[0]["severityText"], "ERROR");
        assert_eq!(records[0]["body"]["stringValue"], "boom");

        let attr = |record: &serde_json::Value, key: &str| {
            record["attributes"]
                .as_array()
                .unwrap()
                .iter()
                .find(|kv| kv["key"] == key)
                .map(|kv| kv["value"].clone())
        };
        assert!(attr(&records[0], "container.id").is_none());
        assert!(attr(&records[0], "process.pid").is_none());
        assert_eq!(attr(&records[0], "log.source").unwrap()["stringValue"], "file");
        assert!(attr(&records[0], "log.content_hash").is_some());
        assert_eq!(attr(&records[1], "container.id").unwrap()["stringValue"], "abc123");
        assert_eq!(attr(&records[1], "process.pid").unwrap()["intValue"], "99");
        assert_eq!(attr(&records[1], "journal.unit").unwrap()["stringValue"], "x.service");
    }

    #[test_case(1, 100 ; "first retry")]
    #[test_case(2, 200 ; "second retry")]
    #[test_case(4, 800 ; "fourth retry")]
    fn backoff_doubles(attempt: u32, expected_ms: u64) {
        let exporter = Exporter::new(&config(), "h", ScriptedTransport::new(vec![]));
        assert_eq!(exporter.backoff_delay(attempt), Duration::from_millis(expected_ms));
    }

    // ===========================================
    // Retry Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(202)]);
        let exporter = Exporter::new(&config(), "h", transport.clone());
        exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Ok(503),
            Err(TelemetryError::Transport("connection reset".to_string())),
            Ok(200),
        ]);
        let exporter = Exporter::new(&config(), "h", transport.clone());
        exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap();
        assert_eq!(transport.calls(), 3);
    }

    #[test_case(400 ; "bad request")]
    #[test_case(401 ; "unauthorized")]
    #[test_case(413 ; "too large")]
    fn client_errors_are_terminal(status: u16) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let transport = ScriptedTransport::new(vec![Ok(status)]);
            let exporter = Exporter::new(&config(), "h", transport.clone());
            let err = exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap_err();
            assert_eq!(err, ExportError::Rejected { status });
            assert_eq!(transport.calls(), 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_requests_is_retried() {
        let transport = ScriptedTransport::new(vec![Ok(429), Ok(200)]);
        let exporter = Exporter::new(&config(), "h", transport.clone());
        exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error() {
        let transport = ScriptedTransport::new(vec![Ok(500), Ok(502), Ok(504)]);
        let exporter = Exporter::new(&config(), "h", transport.clone());
        let err = exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap_err();

        assert_eq!(
            err,
            ExportError::Exhausted {
                attempts: 3,
                last_error: "status 504".to_string()
            }
        );
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn empty_batch_is_not_sent() {
        let transport = ScriptedTransport::new(vec![]);
        let exporter = Exporter::new(&config(), "h", transport.clone());
        exporter.send(&[]).await.unwrap();
        assert_eq!(transport.calls(), 0);
    }

    // ===========================================
    // HTTP Transport Tests
    // ===========================================

    #[tokio::test]
    async fn http_transport_posts_to_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/logs")
            .match_header("content-encoding", "gzip")
            .match_header("authorization", "Bearer s3cret")
            .match_header("x-pipeline-id", "pipe-7")
            .with_status(200)
            .create_async()
            .await;

        let config = config().with_endpoint(format!("{}/v1/logs", server.url()));
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
        let exporter = Exporter::new(&config, "h", transport);

        exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_transport_surfaces_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/logs")
            .with_status(403)
            .create_async()
            .await;

        let config = config().with_endpoint(format!("{}/v1/logs", server.url()));
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
        let exporter = Exporter::new(&config, "h", transport);

        let err = exporter.send(&[entry(SourceKind::File, "/a")]).await.unwrap_err();
        assert_eq!(err, ExportError::Rejected { status: 403 });
    }
}
