//! Data models.

use serde::{Deserialize, Serialize};

/// Signal strength recorded before any gateway metadata has been seen
pub const UNKNOWN_RSSI: i32 = -70;

/// Decoded tracker reading
///
/// Position, battery and timestamp stay `None` until a matching measurement
/// is found in the uplink, so the decision whether a reading is worth keeping
/// is made explicitly through [`ValidityPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Device identifier (`end_device_ids.device_id`)
    pub tracker_id: String,
    /// Device longitude in decimal degrees (measurement 4197)
    pub longitude: Option<f64>,
    /// Device latitude in decimal degrees (measurement 4198)
    pub latitude: Option<f64>,
    /// Battery level in percent (measurement 3000)
    pub battery: Option<i64>,
    /// Position time in the configured local time zone, minute resolution
    pub timestamp: Option<String>,
    /// Gateway signal strength in dBm
    pub gw_rssi: i32,
    /// Receiving gateway identifier
    pub gw_name: String,
    /// Receiving gateway longitude
    pub gw_longitude: f64,
    /// Receiving gateway latitude
    pub gw_latitude: f64,
}

impl Reading {
    /// Create an empty reading for a device
    pub fn new(tracker_id: impl Into<String>) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            longitude: None,
            latitude: None,
            battery: None,
            timestamp: None,
            gw_rssi: UNKNOWN_RSSI,
            gw_name: String::new(),
            gw_longitude: 0.0,
            gw_latitude: 0.0,
        }
    }

    /// Whether this reading should be persisted under the given policy
    pub fn is_valid(&self, policy: ValidityPolicy) -> bool {
        if self.tracker_id.is_empty() {
            return false;
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => match policy {
                ValidityPolicy::NonZero => lat != 0.0 && lon != 0.0,
                ValidityPolicy::Present => true,
            },
            _ => false,
        }
    }
}

/// Rule deciding which decoded readings reach the sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityPolicy {
    /// Both coordinates present and non-zero.
    ///
    /// A device sitting exactly on the equator or the prime meridian is
    /// dropped under this rule.
    #[default]
    NonZero,
    /// Both coordinates present, zero allowed
    Present,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positioned(lat: f64, lon: f64) -> Reading {
        Reading {
            latitude: Some(lat),
            longitude: Some(lon),
            ..Reading::new("dev-1")
        }
    }

    #[test]
    fn new_reading_has_unknown_defaults() {
        let reading = Reading::new("dev-1");
        assert_eq!(reading.gw_rssi, -70);
        assert!(reading.latitude.is_none());
        assert!(!reading.is_valid(ValidityPolicy::NonZero));
        assert!(!reading.is_valid(ValidityPolicy::Present));
    }

    #[test]
    fn zero_coordinates_rejected_by_default_policy() {
        assert!(!positioned(0.0, 0.0).is_valid(ValidityPolicy::NonZero));
        assert!(!positioned(52.52, 0.0).is_valid(ValidityPolicy::NonZero));
        assert!(!positioned(0.0, 13.405).is_valid(ValidityPolicy::NonZero));
        assert!(positioned(52.52, 13.405).is_valid(ValidityPolicy::NonZero));
    }

    #[test]
    fn present_policy_accepts_equator() {
        assert!(positioned(0.0, 0.0).is_valid(ValidityPolicy::Present));
    }

    #[test]
    fn empty_tracker_id_is_never_valid() {
        let reading = Reading {
            tracker_id: String::new(),
            ..positioned(52.52, 13.405)
        };
        assert!(!reading.is_valid(ValidityPolicy::Present));
    }

    #[test]
    fn parse_validity_policy() {
        let policy: ValidityPolicy = serde_json::from_str("\"present\"").unwrap();
        assert_eq!(policy, ValidityPolicy::Present);
        let policy: ValidityPolicy = serde_json::from_str("\"non_zero\"").unwrap();
        assert_eq!(policy, ValidityPolicy::NonZero);
    }
}
