//! Decode uplinks and route valid readings to the store and the CSV log

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::DecoderConfig,
    csv_log::CsvLog,
    database::Database,
    dead_letter::{DeadLetterLog, Sink},
    decoder::decode_uplink,
    errors::{DecodeError, RecorderError},
    models::Reading,
    mqtt::Uplink,
    retry::{retry_with_backoff, RetryPolicy},
    shutdown::ShutdownHandle,
};

/// Result of handling a single uplink
#[derive(Debug)]
pub enum Outcome {
    /// Reading passed validation and was handed to both sinks
    Persisted {
        /// Row id in `tracker_data`, `None` if the insert failed
        row_id: Option<i64>,
        /// Whether the CSV row was written
        logged: bool,
    },
    /// Decoded but without a usable position
    Rejected(Reading),
    DecodeFailed(DecodeError),
}

/// Everything needed to process uplinks, constructed once at startup
pub struct Pipeline {
    database: Database,
    csv_log: CsvLog,
    dead_letters: DeadLetterLog,
    decoder: DecoderConfig,
    write_retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        database: Database,
        csv_log: CsvLog,
        dead_letters: DeadLetterLog,
        decoder: DecoderConfig,
        write_retry: RetryPolicy,
    ) -> Self {
        Self {
            database,
            csv_log,
            dead_letters,
            decoder,
            write_retry,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Process uplinks one at a time until the channel closes or shutdown
    /// is requested
    pub async fn run(&self, uplinks: &mut mpsc::Receiver<Uplink>, mut shutdown: ShutdownHandle) {
        loop {
            tokio::select! {
                biased;
                signal = shutdown.wait() => {
                    info!("Stopping ingestion: {}", signal);
                    break;
                }
                uplink = uplinks.recv() => {
                    let Some(uplink) = uplink else {
                        info!("Uplink channel closed");
                        break;
                    };
                    debug!("Handling uplink from {}", uplink.topic);
                    self.handle_payload(&uplink.payload).await;
                }
            }
        }
    }

    /// Decode one payload and persist it if valid. Never fails: every error
    /// is logged and reflected in the returned [`Outcome`].
    pub async fn handle_payload(&self, payload: &[u8]) -> Outcome {
        debug!("Payload: {}", String::from_utf8_lossy(payload));

        let reading = match decode_uplink(payload, &self.decoder.timezone) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    "Dropping uplink from device {}: {}",
                    e.device().unwrap_or("<unknown>"),
                    e
                );
                return Outcome::DecodeFailed(e);
            }
        };

        if !reading.is_valid(self.decoder.validity) {
            info!(
                "No position for device {}, reading not stored",
                reading.tracker_id
            );
            return Outcome::Rejected(reading);
        }
        info!("{:?}", reading);

        let row_id = self.store(&reading).await;
        let logged = self.log(&reading).await;

        Outcome::Persisted { row_id, logged }
    }

    async fn store(&self, reading: &Reading) -> Option<i64> {
        let database = &self.database;
        let result = retry_with_backoff(&self.write_retry, "Database insert", move || {
            database.insert_reading(reading)
        })
        .await;

        match result {
            Ok(row_id) => Some(row_id),
            Err(e) => {
                error!("Failed to store reading of {}: {}", reading.tracker_id, e);
                self.dead_letter(Sink::Store, reading, &e).await;
                None
            }
        }
    }

    async fn log(&self, reading: &Reading) -> bool {
        let csv_log = &self.csv_log;
        let result = retry_with_backoff(&self.write_retry, "CSV append", move || {
            csv_log.append(reading)
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to log reading of {}: {}", reading.tracker_id, e);
                self.dead_letter(Sink::Log, reading, &e).await;
                false
            }
        }
    }

    async fn dead_letter(&self, sink: Sink, reading: &Reading, cause: &RecorderError) {
        if let Err(e) = self
            .dead_letters
            .record(sink, reading, &cause.to_string())
            .await
        {
            error!("Failed to write dead letter for {}: {}", reading.tracker_id, e);
        }
    }

    /// Flush the log and close the store
    pub async fn close(&self) {
        if let Err(e) = self.csv_log.flush().await {
            error!("Failed to flush CSV log: {}", e);
        }
        self.database.close().await;
    }
}
