//! Error taxonomy for the dryer-line model lifecycle.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type shared by every dryer crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A production record lacks a valid setpoint or actual temperature entry.
    #[error("Incomplete record: {0}")]
    IncompleteRecord(String),

    /// An image reference could not be read or decoded.
    #[error("Failed to load image {}: {reason}", path.display())]
    ImageLoad { path: PathBuf, reason: String },

    /// Not enough usable examples for the requested operation.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The model is not in a state that allows the requested operation.
    #[error("Model state error: {0}")]
    ModelState(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Weight recording or tensor conversion failed
    #[error("Model error: {0}")]
    Model(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn image_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::ImageLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether an aggregation step may skip the offending item and continue.
    ///
    /// Extraction failures are filtered out when many records are gathered;
    /// state, data-volume and storage failures always reach the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::IncompleteRecord(_) | Error::ImageLoad { .. } | Error::InvalidConfig(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for dryer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ModelState("model is not validated".to_string());
        assert_eq!(err.to_string(), "Model state error: model is not validated");

        let err = Error::image_load("/tmp/missing.png", "file not found");
        assert_eq!(
            err.to_string(),
            "Failed to load image /tmp/missing.png: file not found"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(Error::IncompleteRecord("5 zones".into()).is_recoverable());
        assert!(Error::image_load("a.png", "corrupt").is_recoverable());
        assert!(Error::InvalidConfig("optimizer".into()).is_recoverable());
        assert!(!Error::InsufficientData("no records".into()).is_recoverable());
        assert!(!Error::ModelState("busy".into()).is_recoverable());
    }
}
