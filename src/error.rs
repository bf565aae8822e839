//! Error types for VoltDB

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoltError>;

#[derive(Error, Debug)]
pub enum VoltError {
    #[error("Frame not found: {0}")]
    NotFound(u64),

    #[error("Corrupt {context}: {detail}")]
    Corrupt { context: String, detail: String },

    #[error("Capacity exceeded in {tier} tier: need {needed} bytes, {available} available")]
    CapacityExceeded {
        tier: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("Concurrent version conflict on frame {0}")]
    ConcurrentConflict(u64),

    #[error("Recall timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Codebook missing or unreadable. The only fatal condition.
    #[error("Codebook unavailable: {0}")]
    Codebook(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl VoltError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            VoltError::NotFound(_) => "NOT_FOUND",
            VoltError::Corrupt { .. } => "CORRUPT",
            VoltError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            VoltError::ConcurrentConflict(_) => "CONCURRENT_CONFLICT",
            VoltError::Timeout { .. } => "TIMEOUT",
            VoltError::Codebook(_) => "CODEBOOK_UNAVAILABLE",
            VoltError::InvalidFrame(_) => "INVALID_FRAME",
            VoltError::ShuttingDown => "SHUTTING_DOWN",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True only for conditions that must abort initialization.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoltError::Codebook(_))
    }

    pub(crate) fn corrupt(context: impl Into<String>, detail: impl Into<String>) -> Self {
        VoltError::Corrupt {
            context: context.into(),
            detail: detail.into(),
        }
    }
}
