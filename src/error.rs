//! Error types for the log viewer pipeline

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client connection errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Authentication rejected by server")]
    AuthRejected,

    #[error("Backfill request failed: {0}")]
    Backfill(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

/// Wire format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported payload encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Server-side fan-out errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Viewer token rejected")]
    Unauthorized,

    #[error("Viewer not found: {0}")]
    ViewerNotFound(uuid::Uuid),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Persisted client state errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored document is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported stored version: {0}")]
    UnsupportedVersion(u32),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
