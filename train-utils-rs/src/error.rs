//! Error types for train-utils-rs.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`TrainUtilsError`].
//!
//! # Example
//!
//! ```rust
//! use train_utils_rs::{MetricHistory, TrainUtilsError};
//!
//! let mut history = MetricHistory::new();
//! match history.record(1.5) {
//!     Err(TrainUtilsError::InvalidValue(msg)) => assert!(msg.contains("1.5")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for train-utils-rs operations.
pub type Result<T> = std::result::Result<T, TrainUtilsError>;

/// Errors that can occur in train-utils-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainUtilsError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid JSON document (metric histories, exported predictions).
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Empty input where non-empty was required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A value outside its admissible domain.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Prediction horizon shorter than the observed history.
    #[error("horizon {horizon} is shorter than the {observed} observed epochs")]
    InvalidHorizon {
        /// Requested horizon.
        horizon: usize,
        /// Number of observed epochs.
        observed: usize,
    },

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The least-squares solver ran out of iterations.
    #[error("fit did not converge after {iterations} iterations (cost {cost:e})")]
    NotConverged {
        /// Iterations performed.
        iterations: usize,
        /// Cost at the last accepted point.
        cost: f64,
    },

    /// The objective produced NaN or infinity.
    #[error("non-finite value during fit: {0}")]
    NonFinite(String),

    /// A class name missing from the label vocabulary.
    #[error("unknown class '{name}' (vocabulary has {vocabulary_size} classes)")]
    UnknownClass {
        /// The class name that failed to resolve.
        name: String,
        /// Size of the vocabulary it was looked up in.
        vocabulary_size: usize,
    },

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Augmentation pipeline error.
    #[error("augmentation error: {0}")]
    Augment(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = TrainUtilsError::Config("horizon must be > 0".to_string());
        assert_eq!(error.to_string(), "configuration error: horizon must be > 0");
    }

    #[test]
    fn test_invalid_horizon_message() {
        let error = TrainUtilsError::InvalidHorizon {
            horizon: 3,
            observed: 5,
        };
        assert_eq!(
            error.to_string(),
            "horizon 3 is shorter than the 5 observed epochs"
        );
    }

    #[test]
    fn test_unknown_class_message() {
        let error = TrainUtilsError::UnknownClass {
            name: "durian".into(),
            vocabulary_size: 12,
        };
        assert!(error.to_string().contains("durian"));
        assert!(error.to_string().contains("12"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: TrainUtilsError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: TrainUtilsError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("[0.1,").unwrap_err();
        let error: TrainUtilsError = json_error.into();
        assert!(error.to_string().starts_with("invalid JSON"));
    }
}
