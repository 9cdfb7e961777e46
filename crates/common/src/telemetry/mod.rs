mod config;
mod init;

pub use config::{TelemetryConfig, TelemetryProviders};
pub use init::{init_telemetry, shutdown_telemetry};
