//! Application configuration

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tracing::warn;

use crate::{errors::RecorderError, models::ValidityPolicy, retry::RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub ttn: TtnConfig,
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub decoder: DecoderConfig,
    pub write_retry: RetryPolicy,
}

/// The Things Network application credentials
#[derive(Deserialize, Clone)]
pub struct TtnConfig {
    #[serde(default)]
    pub app_id: String,
    pub tenant: String,
    pub region: String,
    #[serde(default)]
    pub api_key: String,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub port: u16,
    pub topic: String,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub keep_alive: Duration,
    pub channel_capacity: usize,
    pub reconnect: RetryPolicy,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub busy_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub path: PathBuf,
    pub dead_letter_path: PathBuf,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub timezone: Tz,
    #[serde(default)]
    pub validity: ValidityPolicy,
}

impl AppConfig {
    /// Load configuration from `config/default`, `TRACKER__*` variables and
    /// the `TTN_*` credential variables, in increasing priority.
    pub fn load() -> Result<Self, RecorderError> {
        let builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("TRACKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("ttn.app_id", env::var("TTN_APP_ID").ok())?
            .set_override_option("ttn.tenant", env::var("TTN_TENANT").ok())?
            .set_override_option("ttn.region", env::var("TTN_REGION").ok())?
            .set_override_option("ttn.api_key", env::var("TTN_API_KEY").ok())?;

        Self::from_builder(builder)
    }

    /// Built-in defaults, lowest priority source
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, RecorderError> {
        Ok(Config::builder()
            .set_default("ttn.tenant", "ttn")?
            .set_default("ttn.region", "eu1")?
            .set_default("mqtt.port", 8883)?
            .set_default("mqtt.topic", "v3/+/devices/+/up")?
            .set_default("mqtt.keep_alive", 30)?
            .set_default("mqtt.channel_capacity", 100)?
            .set_default("mqtt.reconnect.max_retries", 0)?
            .set_default("mqtt.reconnect.initial_backoff", 1000)?
            .set_default("mqtt.reconnect.max_backoff", 60_000)?
            .set_default("mqtt.reconnect.multiplier", 2.0)?
            .set_default("mqtt.reconnect.jitter", 0.2)?
            .set_default("database.url", "sqlite://tracker_data.db")?
            .set_default("database.max_connections", 1)?
            .set_default("database.busy_timeout", 5)?
            .set_default("log.path", "./tracker_data.csv")?
            .set_default("log.dead_letter_path", "./tracker_dead_letter.jsonl")?
            .set_default("decoder.timezone", "Europe/Berlin")?
            .set_default("decoder.validity", "non_zero")?
            .set_default("write_retry.max_retries", 2)?
            .set_default("write_retry.initial_backoff", 50)?
            .set_default("write_retry.max_backoff", 1000)?
            .set_default("write_retry.multiplier", 2.0)?
            .set_default("write_retry.jitter", 0.2)?)
    }

    /// Build, deserialize and validate
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, RecorderError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), RecorderError> {
        self.ttn.validate()?;
        self.mqtt.validate()?;
        self.database.validate()?;
        self.log.validate()?;
        self.write_retry
            .validate()
            .map_err(|message| RecorderError::ConfigurationError { message })?;
        Ok(())
    }
}

impl TtnConfig {
    /// MQTT broker of The Things Stack cluster for the region
    pub fn broker_host(&self) -> String {
        format!("{}.cloud.thethings.network", self.region)
    }

    fn validate(&self) -> Result<(), RecorderError> {
        if self.app_id.trim().is_empty() {
            return Err(RecorderError::ConfigurationError {
                message: "Missing required credential TTN_APP_ID".to_string(),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(RecorderError::ConfigurationError {
                message: "Missing required credential TTN_API_KEY".to_string(),
            });
        }
        if self.region.trim().is_empty() {
            return Err(RecorderError::ConfigurationError {
                message: "Region cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

// The API key must never end up in logs
impl std::fmt::Debug for TtnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtnConfig")
            .field("app_id", &self.app_id)
            .field("tenant", &self.tenant)
            .field("region", &self.region)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl MqttConfig {
    fn validate(&self) -> Result<(), RecorderError> {
        if self.topic.is_empty() {
            return Err(RecorderError::ConfigurationError {
                message: "MQTT topic cannot be empty".to_string(),
            });
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(RecorderError::ConfigurationError {
                message: "MQTT keep alive must be at least 5 seconds".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(RecorderError::ConfigurationError {
                message: "Channel capacity must be greater than zero".to_string(),
            });
        }
        self.reconnect
            .validate()
            .map_err(|message| RecorderError::ConfigurationError { message })
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<(), RecorderError> {
        if self.url.is_empty() {
            return Err(RecorderError::ConfigurationError {
                message: "Database URL cannot be empty".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(RecorderError::ConfigurationError {
                message: "Database pool needs at least one connection".to_string(),
            });
        }
        Ok(())
    }
}

impl LogConfig {
    fn validate(&self) -> Result<(), RecorderError> {
        for path in [&self.path, &self.dead_letter_path] {
            if path.as_os_str().is_empty() {
                return Err(RecorderError::ConfigurationError {
                    message: "Log path cannot be empty".to_string(),
                });
            }
            if let Some(parent) = path.parent() {
                ensure_directory_exists(parent)?;
            }
        }
        Ok(())
    }
}

fn ensure_directory_exists(dir: &Path) -> Result<(), RecorderError> {
    if !dir.as_os_str().is_empty() && !dir.exists() {
        warn!("Log directory {} does not exist, attempting to create it", dir.display());
        std::fs::create_dir_all(dir).map_err(|e| RecorderError::ConfigurationError {
            message: format!("Could not create log directory: {}", e),
        })?;
    }
    Ok(())
}
