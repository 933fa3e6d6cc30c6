// Copyright (c) Abstract Machines

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to spawn worker on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open worker log {}: {source}", path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("telemetry query failed: {0}")]
    TelemetryQuery(String),

    #[error("failed to prepare log directory {}: {source}", path.display())]
    FilesystemSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error("packet capture error: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
