//! Error Handling Module
//!
//! Defines the error type shared by the training, checkpoint and distributed
//! layers. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for FixMatch training operations
#[derive(Error, Debug)]
pub enum FixMatchError {
    /// A parameter name could not be resolved under either naming scheme
    #[error("Parameter '{0}' not found")]
    KeyNotFound(String),

    /// A state dict carried a key the target model does not have
    #[error("Unexpected parameter '{0}' in state dict")]
    UnexpectedKey(String),

    /// Parameter shapes disagree between two sources
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model operations
    #[error("Model error: {0}")]
    Model(String),

    /// Error with training
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Collective communication failure
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl From<bincode::Error> for FixMatchError {
    fn from(err: bincode::Error) -> Self {
        FixMatchError::Serialization(err.to_string())
    }
}

impl From<burn::record::RecorderError> for FixMatchError {
    fn from(err: burn::record::RecorderError) -> Self {
        FixMatchError::Serialization(format!("{:?}", err))
    }
}

impl From<toml::de::Error> for FixMatchError {
    fn from(err: toml::de::Error) -> Self {
        FixMatchError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for FixMatchError {
    fn from(err: toml::ser::Error) -> Self {
        FixMatchError::Serialization(err.to_string())
    }
}

/// Convenience Result type for FixMatch operations
pub type Result<T> = std::result::Result<T, FixMatchError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| FixMatchError::Training(format!("{}: {:?}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| FixMatchError::Training(format!("{}: {:?}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FixMatchError::Dataset("test error".to_string());
        assert_eq!(format!("{}", err), "Dataset error: test error");
    }

    #[test]
    fn test_key_not_found_names_parameter() {
        let err = FixMatchError::KeyNotFound("module.fc1.weight".to_string());
        assert!(err.to_string().contains("module.fc1.weight"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = FixMatchError::ShapeMismatch {
            name: "fc2.bias".to_string(),
            expected: vec![10],
            actual: vec![100],
        };
        let msg = err.to_string();
        assert!(msg.contains("fc2.bias"));
        assert!(msg.contains("[10]"));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let with_context = result.context("Failed to read file");
        assert!(matches!(with_context, Err(FixMatchError::Training(_))));
    }
}
