use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotRadarError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Run exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Run cancelled before persisting")]
    Cancelled,

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, BotRadarError>;
