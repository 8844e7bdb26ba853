//! Error types for calliope-pflash.

use std::io;
use thiserror::Error;

/// Result type for calliope-pflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for calliope-pflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (firmware files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// BLE stack error.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// DFU package archive error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// DFU package manifest error.
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),

    /// No answer within the allowed time.
    #[error("timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// Malformed Intel HEX input.
    #[error("invalid hex file: {0}")]
    Hex(String),

    /// Malformed or unsupported DFU package.
    #[error("invalid DFU package: {0}")]
    Package(String),

    /// Link is down or a characteristic is missing.
    #[error("transport error: {0}")]
    Transport(String),

    /// Full DFU transfer failed.
    #[error("DFU error: {0}")]
    Dfu(String),

    /// The full-update hand-off could not be started.
    #[error("fallback to full flashing unavailable: {0}")]
    FallbackUnavailable(String),

    /// Upload aborted by the user.
    #[error("upload cancelled")]
    Cancelled,
}
