//! Custom error types for the application.
//!
//! This module defines the two error families used by the acquisition controller.
//!
//! ## `DaqError`
//!
//! The crate-level error. Everything that is *not* a transient device failure ends up
//! here:
//!
//! - **`Config`**: Wraps errors from loading the figment configuration.
//! - **`Configuration`**: Semantic configuration problems detected at runtime, such as a
//!   reference channel that does not exist in the processed frame.
//! - **`ShapeMismatch`** / **`RoiOutOfBounds`**: Static geometry errors between the raw
//!   frame, the calibration frame and the configured crop. Retrying cannot fix these, so
//!   the orchestrator abandons the sample instead of re-entering the retry loop.
//! - **`Calibration`**: A dark frame could not be read or decoded.
//! - **`Io`**, **`Tiff`**, **`Serialization`**, **`Array`**, **`Storage`**: plumbing errors
//!   from persistence and array handling.
//!
//! ## `SensorFault`
//!
//! Recoverable hardware failures raised by a [`SensorDevice`](crate::hardware::SensorDevice).
//! A capture session answers every fault by discarding the device handle and building a
//! fresh one, bounded by its attempt budget.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::Roi;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Calibration error for '{}': {reason}", .path.display())]
    Calibration { path: PathBuf, reason: String },

    #[error("Frame shape mismatch on sensor '{sensor}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        sensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Crop region {roi} exceeds {height}x{width} frame on sensor '{sensor}'")]
    RoiOutOfBounds {
        sensor: String,
        roi: Roi,
        height: usize,
        width: usize,
    },

    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DaqError {
    /// Static configuration mismatches that no amount of retrying can resolve.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            DaqError::Configuration(_)
                | DaqError::ShapeMismatch { .. }
                | DaqError::RoiOutOfBounds { .. }
                | DaqError::Array(_)
        )
    }
}

/// Transient failure reported by a sensor device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorFault {
    /// The capture call itself failed.
    #[error("capture failed: {0}")]
    Capture(String),

    /// The frame did not arrive within the result timeout.
    #[error("no frame after {0:?}")]
    Timeout(Duration),

    /// Opening the device (initial setup or reinitialization) failed.
    #[error("device setup failed: {0}")]
    Connect(String),

    /// The device rejected an exposure or readout setting.
    #[error("configuration rejected: {0}")]
    Configure(String),
}
