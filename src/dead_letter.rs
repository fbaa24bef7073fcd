//! JSON-lines record of readings that could not be written to a sink

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{errors::RecorderError, models::Reading};

/// Sink that rejected a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sink {
    Store,
    Log,
}

#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    recorded_at: DateTime<Utc>,
    sink: Sink,
    error: &'a str,
    reading: &'a Reading,
}

pub struct DeadLetterLog {
    file: Mutex<File>,
}

impl DeadLetterLog {
    pub fn open(path: &Path) -> Result<Self, RecorderError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append a failed reading together with the error that rejected it
    pub async fn record(
        &self,
        sink: Sink,
        reading: &Reading,
        error: &str,
    ) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(&DeadLetter {
            recorded_at: Utc::now(),
            sink,
            error,
            reading,
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
