// src/database.rs
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    QueryBuilder, Sqlite,
};
use tracing::info;

use crate::{config::DatabaseConfig, decoder::TIMESTAMP_FORMAT, errors::RecorderError, models::Reading};

mod models;

pub use models::{ReadingFilter, StoredReading};

/// Page size used when a filter does not set a limit
pub const DEFAULT_PAGE_SIZE: u32 = 50;

const SELECT_READINGS: &str = "SELECT id, tracker_id, longitude, latitude, battery, timestamp, \
     gw_rssi, gw_name, gw_longitude, gw_latitude FROM tracker_data";

/// SQLite store for tracker readings
///
/// Owns the `tracker_data` table and creates the `tracker_config` table used
/// by the admin interface, which opens its own connections to the same file.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database and bring the schema up to date
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RecorderError> {
        info!("Opening database at {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Self::new(pool).await
    }

    /// Wrap an existing pool, running migrations first
    pub async fn new(pool: SqlitePool) -> Result<Self, RecorderError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a reading, returning the new row id
    ///
    /// Values the decoder did not find are stored with their legacy defaults:
    /// `0.0` for coordinates, `0` for battery and an empty timestamp.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<i64, RecorderError> {
        let result = sqlx::query(
            "INSERT INTO tracker_data (
                tracker_id, latitude, longitude, battery, timestamp,
                gw_rssi, gw_name, gw_latitude, gw_longitude
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(reading.tracker_id.as_str())
        .bind(reading.latitude.unwrap_or(0.0))
        .bind(reading.longitude.unwrap_or(0.0))
        .bind(reading.battery.unwrap_or(0))
        .bind(reading.timestamp.as_deref().unwrap_or(""))
        .bind(reading.gw_rssi)
        .bind(reading.gw_name.as_str())
        .bind(reading.gw_latitude)
        .bind(reading.gw_longitude)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// One page of readings matching `filter`, newest first
    pub async fn query_readings(
        &self,
        filter: &ReadingFilter,
    ) -> Result<Vec<StoredReading>, RecorderError> {
        let mut query = select_filtered(filter);
        query
            .push(" LIMIT ")
            .push_bind(i64::from(filter.limit.unwrap_or(DEFAULT_PAGE_SIZE)))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset.unwrap_or(0)));

        Ok(query
            .build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// All readings matching `filter`, ignoring pagination
    pub async fn export_all(
        &self,
        filter: &ReadingFilter,
    ) -> Result<Vec<StoredReading>, RecorderError> {
        let mut query = select_filtered(filter);
        Ok(query
            .build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Most recent reading of every tracker, ordered by tracker id
    pub async fn latest_per_tracker(&self) -> Result<Vec<StoredReading>, RecorderError> {
        let rows = sqlx::query_as::<_, StoredReading>(
            "SELECT t.id, t.tracker_id, t.longitude, t.latitude, t.battery, t.timestamp,
                    t.gw_rssi, t.gw_name, t.gw_longitude, t.gw_latitude
             FROM tracker_data AS t
             WHERE t.id = (
                 SELECT id FROM tracker_data
                 WHERE tracker_id = t.tracker_id
                 ORDER BY timestamp DESC, id DESC
                 LIMIT 1
             )
             ORDER BY t.tracker_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn close(&self) {
        info!("Closing database");
        self.pool.close().await;
    }
}

fn select_filtered(filter: &ReadingFilter) -> QueryBuilder<'_, Sqlite> {
    let mut query = QueryBuilder::new(SELECT_READINGS);
    let mut separator = " WHERE ";

    if let Some(tracker_id) = &filter.tracker_id {
        query
            .push(separator)
            .push("tracker_id = ")
            .push_bind(tracker_id.as_str());
        separator = " AND ";
    }
    if let Some(since) = &filter.since {
        query
            .push(separator)
            .push("timestamp >= ")
            .push_bind(since.as_str());
    }

    query.push(" ORDER BY timestamp DESC, id DESC");
    query
}

/// Oldest timestamp within `age` of `now`, formatted like stored timestamps
///
/// Stored timestamps are local time strings, so the cutoff has to be rendered
/// in the same zone for the string comparison in SQL to be meaningful.
pub fn age_cutoff(now: DateTime<Utc>, age: Duration, tz: &Tz) -> Option<String> {
    let delta = TimeDelta::from_std(age).ok()?;
    let cutoff = now.checked_sub_signed(delta)?;
    Some(cutoff.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string())
}
