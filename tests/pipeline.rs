use std::time::Duration;

use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

use tracker_recorder::{
    config::{DatabaseConfig, DecoderConfig},
    csv_log::CsvLog,
    database::{Database, ReadingFilter},
    dead_letter::DeadLetterLog,
    models::ValidityPolicy,
    pipeline::{Outcome, Pipeline},
    retry::RetryPolicy,
};

async fn setup(dir: &TempDir, validity: ValidityPolicy) -> Pipeline {
    let database = Database::connect(&DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("tracker_data.db").display()),
        max_connections: 1,
        busy_timeout: Duration::from_secs(1),
    })
    .await
    .unwrap();

    Pipeline::new(
        database,
        CsvLog::open(&dir.path().join("tracker_data.csv")).unwrap(),
        DeadLetterLog::open(&dir.path().join("dead_letter.jsonl")).unwrap(),
        DecoderConfig {
            timezone: chrono_tz::Europe::Berlin,
            validity,
        },
        RetryPolicy::default(),
    )
}

fn uplink(device: &str, measurements: Value) -> Vec<u8> {
    json!({
        "end_device_ids": {
            "device_id": device,
            "application_ids": { "application_id": "trackers" },
            "dev_eui": "2CF7F1C04430000A"
        },
        "uplink_message": {
            "f_port": 5,
            "decoded_payload": {
                "err": 0,
                "messages": [measurements],
                "payload": "0800",
                "valid": true
            },
            "rx_metadata": [{
                "gateway_ids": { "gateway_id": "gw-berlin-01", "eui": "B827EBFFFE000001" },
                "rssi": -93,
                "channel_rssi": -93,
                "snr": 7.25,
                "location": { "latitude": 52.51, "longitude": 13.39, "source": "SOURCE_REGISTRY" }
            }]
        }
    })
    .to_string()
    .into_bytes()
}

fn position(lon: f64, lat: f64, battery: i64) -> Value {
    json!([
        { "measurementId": "4197", "measurementValue": lon, "timestamp": 1700000000000i64, "type": "Longitude" },
        { "measurementId": "4198", "measurementValue": lat, "timestamp": 1700000000000i64, "type": "Latitude" },
        { "measurementId": "3000", "measurementValue": battery, "timestamp": 1700000000000i64, "type": "Battery" }
    ])
}

async fn row_count(pipeline: &Pipeline) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM tracker_data")
        .fetch_one(pipeline.database().pool())
        .await
        .unwrap()
}

fn log_lines(dir: &TempDir) -> Vec<String> {
    std::fs::read_to_string(dir.path().join("tracker_data.csv"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn well_formed_uplink_reaches_both_sinks() {
    let dir = tempdir().unwrap();
    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;

    let outcome = pipeline
        .handle_payload(&uplink("dev-1", position(13.405, 52.52, 87)))
        .await;
    assert!(matches!(
        outcome,
        Outcome::Persisted {
            row_id: Some(_),
            logged: true
        }
    ));

    let rows = pipeline
        .database()
        .export_all(&ReadingFilter::tracker("dev-1"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].tracker_id, "dev-1");
    assert_eq!(rows[0].longitude, 13.405);
    assert_eq!(rows[0].latitude, 52.52);
    assert_eq!(rows[0].battery, 87);
    assert_eq!(rows[0].timestamp, "2023-11-14 23:13");
    assert_eq!(rows[0].gw_name, "gw-berlin-01");

    let lines = log_lines(&dir);
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[1],
        "dev-1,52.52,13.405,87,2023-11-14 23:13,-93,gw-berlin-01,52.51,13.39"
    );
}

#[tokio::test]
async fn unknown_measurements_only_touch_no_sink() {
    let dir = tempdir().unwrap();
    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;

    let measurements = json!([
        { "measurementId": "4200", "measurementValue": 1, "timestamp": 1700000000000i64 }
    ]);
    let outcome = pipeline.handle_payload(&uplink("dev-1", measurements)).await;

    match outcome {
        Outcome::Rejected(reading) => {
            assert!(reading.latitude.is_none());
            assert!(reading.longitude.is_none());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(row_count(&pipeline).await, 0);
    assert_eq!(log_lines(&dir).len(), 1);
}

#[tokio::test]
async fn zero_position_is_not_persisted() {
    let dir = tempdir().unwrap();
    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;

    let outcome = pipeline
        .handle_payload(&uplink("dev-1", position(0.0, 0.0, 87)))
        .await;
    assert!(matches!(outcome, Outcome::Rejected(_)));
    assert_eq!(row_count(&pipeline).await, 0);
    assert_eq!(log_lines(&dir).len(), 1);
}

#[tokio::test]
async fn present_policy_keeps_zero_position() {
    let dir = tempdir().unwrap();
    let pipeline = setup(&dir, ValidityPolicy::Present).await;

    let outcome = pipeline
        .handle_payload(&uplink("dev-1", position(0.0, 0.0, 87)))
        .await;
    assert!(matches!(outcome, Outcome::Persisted { .. }));
    assert_eq!(row_count(&pipeline).await, 1);
}

#[tokio::test]
async fn missing_structure_touches_no_sink() {
    let dir = tempdir().unwrap();
    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;

    let mut without_metadata: Value =
        serde_json::from_slice(&uplink("dev-1", position(13.405, 52.52, 87))).unwrap();
    without_metadata["uplink_message"]
        .as_object_mut()
        .unwrap()
        .remove("rx_metadata");

    let mut without_messages = without_metadata.clone();
    without_messages["uplink_message"]["rx_metadata"] = json!([{
        "gateway_ids": { "gateway_id": "gw-1" },
        "rssi": -80,
        "location": { "latitude": 1.0, "longitude": 1.0 }
    }]);
    without_messages["uplink_message"]["decoded_payload"]
        .as_object_mut()
        .unwrap()
        .remove("messages");

    for payload in [without_metadata, without_messages] {
        let outcome = pipeline.handle_payload(payload.to_string().as_bytes()).await;
        assert!(matches!(outcome, Outcome::DecodeFailed(_)));
    }

    assert_eq!(row_count(&pipeline).await, 0);
    assert_eq!(log_lines(&dir).len(), 1);
}

#[tokio::test]
async fn log_header_survives_restart() {
    let dir = tempdir().unwrap();

    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;
    pipeline
        .handle_payload(&uplink("dev-1", position(13.405, 52.52, 87)))
        .await;
    pipeline.close().await;
    drop(pipeline);

    let pipeline = setup(&dir, ValidityPolicy::NonZero).await;
    pipeline
        .handle_payload(&uplink("dev-2", position(13.405, 52.52, 80)))
        .await;

    let lines = log_lines(&dir);
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines.iter().filter(|l| l.starts_with("tracker_id,")).count(),
        1
    );
    assert_eq!(row_count(&pipeline).await, 2);
}
