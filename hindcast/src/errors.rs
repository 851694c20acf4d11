use std::io;
use std::result;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid settings, detected before any I/O takes place
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed input dataset
    #[error("invalid dataset: {0}")]
    Dataset(String),

    #[error("packing error: {0}")]
    Packing(String),

    #[error("region error: {0}")]
    Region(String),

    /// Audit kept finding missing data after every allowed retry
    #[error("missing data present, retry limit exceeded after {retries} retries: {reason}")]
    RetryLimitExceeded { retries: u32, reason: String },

    #[error("no such variable: {0}")]
    BadName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error(transparent)]
    IO(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset(message.into())
    }

    pub fn packing(message: impl Into<String>) -> Self {
        Self::Packing(message.into())
    }

    pub fn region(message: impl Into<String>) -> Self {
        Self::Region(message.into())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
