//! Error types for the telemetry pipeline.

use thiserror::Error;

/// Errors that can occur in the telemetry pipeline.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The pipeline configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A log source could not be read this tick.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A helper command (journalctl, docker) failed.
    #[error("command failed: {0}")]
    Command(String),

    /// The HTTP transport could not be set up or used.
    #[error("transport error: {0}")]
    Transport(String),

    /// The requested lifecycle transition is not allowed right now.
    #[error("invalid pipeline state: {0}")]
    InvalidState(&'static str),
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = TelemetryError::Config("pipeline_id cannot be empty".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: pipeline_id cannot be empty"
        );

        let err = TelemetryError::SourceUnavailable("/var/log/app.log".to_string());
        assert_eq!(err.to_string(), "source unavailable: /var/log/app.log");

        let err = TelemetryError::Command("journalctl exited with 1".to_string());
        assert_eq!(err.to_string(), "command failed: journalctl exited with 1");

        let err = TelemetryError::InvalidState("pipeline is stopping");
        assert_eq!(err.to_string(), "invalid pipeline state: pipeline is stopping");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TelemetryError>();
    }

    #[test]
    fn error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TelemetryError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_serialization_conversion() {
        let parse_err = serde_json::from_str::<u32>("not json");
        assert!(parse_err.is_err());
        if let Err(e) = parse_err {
            let err: TelemetryError = e.into();
            assert!(matches!(err, TelemetryError::Serialization(_)));
        }
    }
}
