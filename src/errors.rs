//! Errors for the tracker recorder
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("MQTT client error: {0}")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Database migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Background task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

/// Per-message decoding failure. None of these stop ingestion.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("missing device id")]
    MissingDeviceId,

    #[error("missing required field `{field}` for device {device}")]
    MissingField { device: String, field: &'static str },

    #[error("field `{field}` of device {device} has an unusable value")]
    InvalidField { device: String, field: &'static str },

    #[error("unparseable measurement {measurement_id} for device {device}: {reason}")]
    InvalidMeasurement {
        device: String,
        measurement_id: String,
        reason: String,
    },
}

impl DecodeError {
    /// Originating device, when decoding got far enough to know it
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::MalformedEnvelope(_) | Self::MissingDeviceId => None,
            Self::MissingField { device, .. }
            | Self::InvalidField { device, .. }
            | Self::InvalidMeasurement { device, .. } => Some(device),
        }
    }
}
