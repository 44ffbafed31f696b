//! Unified error handling for the binary.

use crate::config::ConfigError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("replicas did not settle after {0} sync passes")]
    NotSettled(usize),
}

/// Result type alias using CliError.
pub type Result<T> = std::result::Result<T, CliError>;
