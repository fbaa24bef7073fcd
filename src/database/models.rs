use serde::Serialize;

/// Row of the `tracker_data` table
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredReading {
    pub id: i64,
    pub tracker_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub battery: i64,
    pub timestamp: String,
    pub gw_rssi: i64,
    pub gw_name: String,
    pub gw_longitude: f64,
    pub gw_latitude: f64,
}

/// Selection of stored readings, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub tracker_id: Option<String>,
    /// Keep readings with `timestamp >= since`, see [`super::age_cutoff`]
    pub since: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ReadingFilter {
    pub fn tracker(tracker_id: impl Into<String>) -> Self {
        Self {
            tracker_id: Some(tracker_id.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, cutoff: impl Into<String>) -> Self {
        self.since = Some(cutoff.into());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}
