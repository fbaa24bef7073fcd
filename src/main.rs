//! Tracker recorder daemon

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tracker_recorder::{
    config::AppConfig,
    csv_log::CsvLog,
    database::Database,
    dead_letter::DeadLetterLog,
    errors::RecorderError,
    mqtt::MqttClientBuilder,
    pipeline::Pipeline,
    shutdown::{shutdown_signal, ShutdownHandle},
};

#[tokio::main]
async fn main() -> Result<(), RecorderError> {
    #[cfg(feature = "dotenv")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Missing credentials end the process here
    let config = AppConfig::load().inspect_err(|e| error!("Startup failed: {}", e))?;
    info!("Application started");

    let database = Database::connect(&config.database).await?;
    let csv_log = CsvLog::open(&config.log.path)?;
    let dead_letters = DeadLetterLog::open(&config.log.dead_letter_path)?;
    let pipeline = Pipeline::new(
        database,
        csv_log,
        dead_letters,
        config.decoder.clone(),
        config.write_retry.clone(),
    );

    let shutdown = ShutdownHandle::new();
    let signal_handle = shutdown.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!("Received shutdown signal: {}", signal);
        signal_handle.trigger(signal);
    });

    let mut mqtt_client =
        MqttClientBuilder::new(&config.ttn, &config.mqtt).connect(shutdown.clone());

    pipeline.run(mqtt_client.uplinks(), shutdown.clone()).await;

    // The pipeline also stops when the MQTT task dies; make sure both halves end
    shutdown.shutdown();
    let session = mqtt_client.join().await;
    pipeline.close().await;

    match session {
        Ok(()) => info!("Tracker recorder stopped"),
        Err(ref e) => error!("MQTT session ended with error: {}", e),
    }
    session
}
