use std::io;

use thiserror::Error;

/// Error kinds surfaced across the cache core.
///
/// `LookupMiss` and oversized-key handling are *not* represented here: per
/// spec they are response shapes, not errors, and never leave the
/// connection engine as a `CacheError`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("refresh failed for table {table}: {reason}")]
    RefreshFailure { table: String, reason: String },

    #[error("arena allocation failed: {0}")]
    Allocation(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shutdown requested: {0}")]
    Shutdown(String),
}

pub type CResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Allocation(_))
    }
}
