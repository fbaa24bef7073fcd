//! Append-only CSV mirror of stored readings

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{database::StoredReading, errors::RecorderError, models::Reading};

/// Header of the durable log, one column per [`Reading`] field
pub const LOG_HEADER: [&str; 9] = [
    "tracker_id",
    "latitude",
    "longitude",
    "battery",
    "timestamp",
    "gw_rssi",
    "gw_name",
    "gw_latitude",
    "gw_longitude",
];

/// Header of [`export_csv`], the `tracker_data` columns
pub const EXPORT_HEADER: [&str; 10] = [
    "id",
    "tracker_id",
    "longitude",
    "latitude",
    "battery",
    "timestamp",
    "gw_rssi",
    "gw_name",
    "gw_longitude",
    "gw_latitude",
];

#[derive(Serialize)]
struct LogRow<'a> {
    tracker_id: &'a str,
    latitude: f64,
    longitude: f64,
    battery: i64,
    timestamp: &'a str,
    gw_rssi: i32,
    gw_name: &'a str,
    gw_latitude: f64,
    gw_longitude: f64,
}

impl<'a> From<&'a Reading> for LogRow<'a> {
    fn from(reading: &'a Reading) -> Self {
        Self {
            tracker_id: &reading.tracker_id,
            latitude: reading.latitude.unwrap_or(0.0),
            longitude: reading.longitude.unwrap_or(0.0),
            battery: reading.battery.unwrap_or(0),
            timestamp: reading.timestamp.as_deref().unwrap_or(""),
            gw_rssi: reading.gw_rssi,
            gw_name: &reading.gw_name,
            gw_latitude: reading.gw_latitude,
            gw_longitude: reading.gw_longitude,
        }
    }
}

/// Durable log writer
///
/// Every row is flushed as soon as it is written, so a crash loses at most the
/// row being written. The header is only written into an empty file.
///
/// Rows are encoded into a fresh buffer per call. A failed write leaves
/// nothing behind to be written again by a retry or by the next row, and a
/// partially written row is cut off the end of the file.
pub struct CsvLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl CsvLog {
    /// Open `path` for appending, creating it with a header if needed
    pub fn open(path: &Path) -> Result<Self, RecorderError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        if file.metadata()?.len() == 0 {
            info!("Creating CSV log at {}", path.display());
            let mut writer = WriterBuilder::new().has_headers(false).from_writer(&mut file);
            writer.write_record(LOG_HEADER)?;
            writer.flush()?;
        } else {
            info!("Appending to CSV log at {}", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one reading and flush it to disk
    pub async fn append(&self, reading: &Reading) -> Result<(), RecorderError> {
        let mut file = self.file.lock().await;
        let end = file.metadata()?.len();

        if let Err(e) = write_row(&mut *file, reading) {
            if let Err(truncate) = file.set_len(end) {
                warn!(
                    "Could not remove partial row from {}: {}",
                    self.path.display(),
                    truncate
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sync the file to disk
    pub async fn flush(&self) -> Result<(), RecorderError> {
        let mut file = self.file.lock().await;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Encode `reading` on its own and write it to `out` in one piece
fn write_row<W: Write>(out: &mut W, reading: &Reading) -> Result<(), RecorderError> {
    let mut encoder = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    encoder.serialize(LogRow::from(reading))?;
    let row = encoder
        .into_inner()
        .map_err(|e| RecorderError::from(e.into_error()))?;

    out.write_all(&row)?;
    out.flush()?;
    Ok(())
}

/// Write stored rows as CSV, header first, for bulk export
pub fn export_csv<W: Write>(rows: &[StoredReading], out: W) -> Result<(), RecorderError> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(EXPORT_HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tempfile::tempdir;

    fn reading() -> Reading {
        Reading {
            tracker_id: "dev-1".to_string(),
            longitude: Some(13.405),
            latitude: Some(52.52),
            battery: Some(87),
            timestamp: Some("2023-11-14 23:13".to_string()),
            gw_rssi: -93,
            gw_name: "gw-berlin-01".to_string(),
            gw_longitude: 13.39,
            gw_latitude: 52.51,
        }
    }

    #[tokio::test]
    async fn test_header_written_once() -> Result<(), RecorderError> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("tracker_data.csv");

        let log = CsvLog::open(&path)?;
        log.append(&reading()).await?;
        drop(log);

        // Reopen as a restarted process would
        let log = CsvLog::open(&path)?;
        log.append(&reading()).await?;
        log.flush().await?;

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "tracker_id,latitude,longitude,battery,timestamp,gw_rssi,gw_name,gw_latitude,gw_longitude"
        );
        assert_eq!(
            lines[1],
            "dev-1,52.52,13.405,87,2023-11-14 23:13,-93,gw-berlin-01,52.51,13.39"
        );
        assert_eq!(lines[1], lines[2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_visible_without_flush() -> Result<(), RecorderError> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("tracker_data.csv");

        let log = CsvLog::open(&path)?;
        log.append(&reading()).await?;

        // No explicit flush or drop: the row must already be on disk
        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content.lines().count(), 2);
        assert_eq!(log.path(), path.as_path());
        Ok(())
    }

    /// Writer that rejects the first `failures` writes
    struct FlakyWriter {
        written: Vec<u8>,
        failures: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn row_of(tracker_id: &str) -> Reading {
        Reading {
            tracker_id: tracker_id.to_string(),
            ..reading()
        }
    }

    #[test]
    fn test_retry_after_failed_write_adds_one_row() {
        let mut out = FlakyWriter {
            written: Vec::new(),
            failures: 1,
        };

        assert!(write_row(&mut out, &row_of("dev-1")).is_err());
        write_row(&mut out, &row_of("dev-1")).unwrap();

        let text = String::from_utf8(out.written).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("dev-1,"));
    }

    #[test]
    fn test_failed_row_not_carried_into_next_write() {
        let mut out = FlakyWriter {
            written: Vec::new(),
            failures: 1,
        };

        assert!(write_row(&mut out, &row_of("dev-1")).is_err());
        write_row(&mut out, &row_of("dev-2")).unwrap();

        let text = String::from_utf8(out.written).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("dev-2,"));
    }

    #[test]
    fn test_export_csv() -> Result<(), RecorderError> {
        let rows = vec![StoredReading {
            id: 7,
            tracker_id: "dev-1".to_string(),
            longitude: 13.405,
            latitude: 52.52,
            battery: 87,
            timestamp: "2023-11-14 23:13".to_string(),
            gw_rssi: -93,
            gw_name: "gw-berlin-01".to_string(),
            gw_longitude: 13.39,
            gw_latitude: 52.51,
        }];

        let mut out = Vec::new();
        export_csv(&rows, &mut out)?;
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(EXPORT_HEADER.join(",").as_str()));
        assert_eq!(
            lines.next(),
            Some("7,dev-1,13.405,52.52,87,2023-11-14 23:13,-93,gw-berlin-01,13.39,52.51")
        );
        assert_eq!(lines.next(), None);
        Ok(())
    }
}
