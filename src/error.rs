//! Error types for dcgan-rs.
//!
//! Configuration problems, malformed batches and numerical blow-ups are
//! fatal and travel up as [`GanError`]. Checkpoint read failures and
//! telemetry write failures never reach this type: they are logged where
//! they happen and training carries on.
//!
//! # Example
//!
//! ```rust
//! use dcgan_rs::{GanConfig, GanError};
//!
//! let mut config = GanConfig::default();
//! config.batch_size = 0;
//! match config.validate() {
//!     Err(GanError::Config(msg)) => assert!(msg.contains("batch_size")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for dcgan-rs operations.
pub type Result<T> = std::result::Result<T, GanError>;

/// Errors that can occur while configuring or running adversarial training.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GanError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A tensor did not have the expected shape.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape description.
        expected: String,
        /// Observed shape description.
        got: String,
    },

    /// Data source error (missing batch, unreadable dataset).
    #[error("data error: {0}")]
    Data(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint container could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Parameter blob could not be encoded.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Image decoding or encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A loss became NaN or infinite.
    #[error("non-finite {loss} loss ({value}) at iteration {iteration}")]
    NonFiniteLoss {
        /// Which loss diverged.
        loss: &'static str,
        /// Offending value.
        value: f32,
        /// Global iteration of the failing step.
        iteration: usize,
    },

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl GanError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for GanError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        GanError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = GanError::config("batch_size must be > 0");
        assert_eq!(
            error.to_string(),
            "configuration error: batch_size must be > 0"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = GanError::shape_mismatch("[4, 3, 8, 8]", "[4, 1, 8, 8]");
        assert_eq!(
            error.to_string(),
            "shape mismatch: expected [4, 3, 8, 8], got [4, 1, 8, 8]"
        );
    }

    #[test]
    fn test_non_finite_loss_reports_iteration() {
        let error = GanError::NonFiniteLoss {
            loss: "generator",
            value: f32::NAN,
            iteration: 17,
        };
        let msg = error.to_string();
        assert!(msg.contains("generator"));
        assert!(msg.contains("iteration 17"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: GanError = io_error.into();
        assert!(matches!(error, GanError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: GanError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: GanError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: GanError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(error.source().is_some());
    }
}
