//! Ingestion of LoRaWAN tracker uplinks into SQLite and a CSV log

pub mod config;
pub mod csv_log;
pub mod database;
pub mod dead_letter;
pub mod decoder;
pub mod errors;
pub mod models;
pub mod mqtt;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
