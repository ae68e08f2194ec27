pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod reaper;
pub mod result;
pub mod routes;
pub mod runtime;
pub mod sandbox;
pub mod staging;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
