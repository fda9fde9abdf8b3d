//! Error types for the gluelink core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the gluelink core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for gluelink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// State file is missing or unusable
    #[error("State error: {0}")]
    State(String),

    /// Lock file could not be opened or locked for a reason other than contention
    #[error("Failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
