//! Error types shared across Stowage crates

use thiserror::Error;

/// Result type alias for Stowage operations
pub type Result<T> = std::result::Result<T, StowageError>;

/// Errors raised outside the import pipeline proper: configuration,
/// catalog files, serialization.
#[derive(Error, Debug)]
pub enum StowageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid table catalog: {0}")]
    Catalog(String),
}

impl StowageError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }
}
