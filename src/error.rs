//! Error types for the separate encoder

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, EncoderError>;

/// Errors raised while configuring or running the encoder
#[derive(Error, Debug)]
pub enum EncoderError {
    /// Dimension or divisibility violation between configuration and data
    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Precision or device the numeric backend cannot run
    #[error("Unsupported device or dtype: {0}")]
    DeviceOrDType(String),

    /// IO error while reading a configuration file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EncoderError {
    /// Builds a [`EncoderError::ShapeMismatch`] from anything printable
    pub fn shape(
        context: impl Into<String>,
        expected: impl ToString,
        got: impl ToString,
    ) -> Self {
        EncoderError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// True for errors caused by tensor shapes rather than settings
    pub fn is_shape_error(&self) -> bool {
        matches!(self, EncoderError::ShapeMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message() {
        let err = EncoderError::shape("block", "(1, 24, 4)", "(1, 23, 4)");
        assert!(err.is_shape_error());
        assert_eq!(
            err.to_string(),
            "Shape mismatch in block: expected (1, 24, 4), got (1, 23, 4)"
        );
    }

    #[test]
    fn test_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: EncoderError = parse.unwrap_err().into();
        assert!(matches!(err, EncoderError::Json(_)));
        assert!(!err.is_shape_error());
    }
}
