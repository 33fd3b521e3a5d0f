// SPDX-License-Identifier: MIT

//! Error types for bugwatch

use thiserror::Error;

/// Result type alias for bugwatch operations
pub type Result<T> = std::result::Result<T, BugwatchError>;

/// Bugwatch error types
#[derive(Error, Debug)]
pub enum BugwatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}
