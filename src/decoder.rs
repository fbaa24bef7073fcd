//! Decoding of The Things Stack uplink envelopes into [`Reading`]s
//!
//! The envelope is a deeply nested JSON document. Only a handful of fields
//! matter here:
//!
//! - `end_device_ids.device_id`
//! - `uplink_message.rx_metadata[0]` for the receiving gateway
//! - `uplink_message.decoded_payload.messages[0]`, the list of measurement
//!   entries produced by the payload formatter of SenseCAP style trackers
//!
//! Only the outer envelope is deserialized into structs. The rest stays a
//! [`Value`] until the first gateway and the first message are picked out, so
//! odd values in parts that are never read cannot fail a message, and a bad
//! value in a part that is read is reported together with the device.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;

use crate::{errors::DecodeError, models::Reading};
use serde_helpers::*;

/// Format of [`Reading::timestamp`]
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Deserialize)]
struct UplinkEnvelope {
    end_device_ids: Option<EndDeviceIds>,
    uplink_message: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EndDeviceIds {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    device_id: Option<String>,
}

/// Single entry of a decoded tracker message
#[derive(Debug, Deserialize)]
struct Measurement {
    #[serde(
        rename = "measurementId",
        default,
        deserialize_with = "deserialize_lenient_string"
    )]
    measurement_id: Option<String>,
    #[serde(rename = "measurementValue", default)]
    measurement_value: Option<Value>,
    /// Measurement time in milliseconds from Unix epoch
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Measurement codes understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeasurementKind {
    Longitude,
    Latitude,
    Battery,
}

impl MeasurementKind {
    fn from_id(id: &str) -> Option<Self> {
        match id {
            "4197" => Some(Self::Longitude),
            "4198" => Some(Self::Latitude),
            "3000" => Some(Self::Battery),
            _ => None,
        }
    }
}

/// Decode a raw uplink payload
///
/// Succeeds as soon as the envelope structure is intact, even if none of the
/// known measurements were present. Whether the result is worth storing is
/// decided by the caller.
pub fn decode_uplink(payload: &[u8], tz: &Tz) -> Result<Reading, DecodeError> {
    let envelope: UplinkEnvelope = serde_json::from_slice(payload)?;

    let device = envelope
        .end_device_ids
        .and_then(|ids| ids.device_id)
        .filter(|id| !id.is_empty())
        .ok_or(DecodeError::MissingDeviceId)?;

    let missing = |field: &'static str| DecodeError::MissingField {
        device: device.clone(),
        field,
    };
    let unusable = |field: &'static str| DecodeError::InvalidField {
        device: device.clone(),
        field,
    };

    let uplink = envelope
        .uplink_message
        .filter(|value| !value.is_null())
        .ok_or_else(|| missing("uplink_message"))?;
    let measurements = present(&uplink, "/decoded_payload/messages/0")
        .ok_or_else(|| missing("uplink_message.decoded_payload.messages"))?
        .as_array()
        .ok_or_else(|| unusable("uplink_message.decoded_payload.messages"))?;
    let metadata = present(&uplink, "/rx_metadata/0")
        .ok_or_else(|| missing("uplink_message.rx_metadata"))?;

    let gateway_number = |pointer: &str, field: &'static str| {
        present(metadata, pointer)
            .ok_or_else(|| missing(field))
            .and_then(|value| value_as_f64(value).ok_or_else(|| unusable(field)))
    };

    let mut reading = Reading::new(device.clone());

    reading.gw_name = present(metadata, "/gateway_ids/gateway_id")
        .ok_or_else(|| missing("rx_metadata.gateway_ids.gateway_id"))?
        .as_str()
        .ok_or_else(|| unusable("rx_metadata.gateway_ids.gateway_id"))?
        .to_string();
    let rssi = gateway_number("/rssi", "rx_metadata.rssi")?.round();
    if rssi < f64::from(i32::MIN) || rssi > f64::from(i32::MAX) {
        return Err(unusable("rx_metadata.rssi"));
    }
    reading.gw_rssi = rssi as i32;
    if present(metadata, "/location").is_none() {
        return Err(missing("rx_metadata.location"));
    }
    reading.gw_latitude = gateway_number("/location/latitude", "rx_metadata.location.latitude")?;
    reading.gw_longitude =
        gateway_number("/location/longitude", "rx_metadata.location.longitude")?;

    for entry in measurements {
        // Entries that are not objects cannot carry a known code
        let Ok(measurement) = Measurement::deserialize(entry) else {
            continue;
        };
        let Some(id) = measurement.measurement_id.as_deref() else {
            continue;
        };
        let Some(kind) = MeasurementKind::from_id(id) else {
            continue;
        };

        let invalid = |reason: &str| DecodeError::InvalidMeasurement {
            device: device.clone(),
            measurement_id: id.to_string(),
            reason: reason.to_string(),
        };

        let value = measurement
            .measurement_value
            .as_ref()
            .and_then(value_as_f64)
            .ok_or_else(|| invalid("measurementValue is not a finite number"))?;

        match kind {
            MeasurementKind::Longitude => {
                let millis = measurement
                    .timestamp
                    .as_ref()
                    .and_then(value_as_millis)
                    .ok_or_else(|| invalid("missing or non-numeric timestamp"))?;
                let timestamp = format_timestamp(millis, tz)
                    .ok_or_else(|| invalid("timestamp out of range"))?;
                reading.longitude = Some(value);
                reading.timestamp = Some(timestamp);
            }
            MeasurementKind::Latitude => reading.latitude = Some(value),
            MeasurementKind::Battery => reading.battery = Some(value.round() as i64),
        }
    }

    Ok(reading)
}

/// Non-null value at a JSON pointer
fn present<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer).filter(|found| !found.is_null())
}

/// Format epoch milliseconds in the given time zone at minute resolution
pub fn format_timestamp(millis: i64, tz: &Tz) -> Option<String> {
    DateTime::from_timestamp_millis(millis)
        .map(|utc| utc.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn value_as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Custom deserializers
mod serde_helpers {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Identifiers are documented as strings but some formatters emit numbers.
    /// Any other type reads as absent.
    pub fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}
