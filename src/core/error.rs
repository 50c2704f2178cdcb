//! Error types for the visibility memory engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Baked point data is missing, empty or malformed
    #[error("Asset error: {0}")]
    Asset(String),

    /// Invalid configuration or unavailable compute capability
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
