//! Error types for burrow-store
//!
//! This module defines the error types used throughout the store crate.

use thiserror::Error;

use crate::registry::TypeTag;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while opening, writing, syncing or inspecting the log
    #[error("I/O error: {0}")]
    Io(String),

    /// A replayed or cached record carries a tag with no registered decoder
    #[error("No decoder registered for type tag {0}")]
    NoDecoderFound(TypeTag),

    /// A value of an unregistered type (or tag) was handed to the store
    #[error("No encoder registered for {0}")]
    NoEncoderFound(String),

    /// The log contains data that is not a torn tail
    #[error("Corrupted log at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the offending record
        offset: u64,
        /// What was wrong with it
        reason: String,
    },

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The caller's identifier could not be turned into a key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A typed read asked for a different type than the one stored
    #[error("Type mismatch for key {key}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Key that was read
        key: String,
        /// Rust type the caller asked for
        expected: String,
        /// Tag of the stored record
        found: TypeTag,
    },

    /// An encoded record is larger than the configured maximum
    #[error("Record of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge {
        /// Payload size of the rejected record
        size: u64,
        /// Configured maximum
        limit: u64,
    },

    /// The background writer failed; the log accepts no further writes
    #[error("Log writer failed: {0}")]
    LogFailed(String),

    /// The log has been closed
    #[error("Log is closed")]
    LogClosed,

    /// Configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            StoreError::Io(err.to_string())
        } else {
            StoreError::Deserialization(err.to_string())
        }
    }
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Deserialization(err.to_string())
    }
}

impl StoreError {
    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new Corrupted error
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Whether the error leaves the log unable to accept writes
    pub fn is_log_failure(&self) -> bool {
        matches!(self, StoreError::LogFailed(_) | StoreError::LogClosed)
    }
}
