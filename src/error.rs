//! Error types for the backstep library
//!
//! Errors fall in two families. Structural errors (malformed metadata,
//! out-of-order tree input, an inconsistent destination during regress) stop
//! the current operation immediately. File-level errors (a single entry that
//! cannot be read or written) are collected into the session report and the
//! walk continues.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the backstep library
pub type Result<T> = std::result::Result<T, BackstepError>;

/// Main error type for all backstep operations
#[derive(Debug, Error)]
pub enum BackstepError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Malformed metadata record, snapshot, or repository filename
    #[error("Parse error in {context} (line {line}): {message}")]
    Parse {
        /// What was being parsed (file name or grammar)
        context: String,
        /// 1-based line number, 0 when not line oriented
        line: usize,
        /// Description of the problem
        message: String,
    },

    /// Collator input was not strictly ascending
    #[error("Ordering violation: {current} does not follow {previous}")]
    OrderingViolation {
        /// Last index accepted from the stream
        previous: String,
        /// Offending index
        current: String,
    },

    /// Could not find a free timestamp for an increment
    #[error("Increment collision at {path:?} after {attempts} attempts")]
    IncrementCollision {
        /// Increment path of the last attempt
        path: PathBuf,
        /// Number of timestamps tried
        attempts: u32,
    },

    /// Permission denied for file operation
    #[error("Permission denied: {path:?}")]
    PermissionDenied {
        /// Path where permission was denied
        path: PathBuf,
    },

    /// Regress found the destination in a state it cannot reconcile
    #[error("Regress inconsistency at {index}: {message}")]
    RegressInconsistency {
        /// Index of the entry that could not be reconciled
        index: String,
        /// What was expected and not found
        message: String,
    },

    /// Metadata store is unreadable or contradicts itself
    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// Delta computation or application failed
    #[error("Delta error: {0}")]
    Delta(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Numeric value does not fit the record field
    #[error("Numeric overflow in {field} for {path:?}")]
    Overflow {
        /// Field that overflowed
        field: &'static str,
        /// Entry being read
        path: PathBuf,
    },

    /// Destination has no backstep repository
    #[error("Repository not initialized at path: {0:?}")]
    NotInitialized(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No committed session matches the requested time
    #[error("No session found: {0}")]
    SessionNotFound(String),

    /// Message protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session aborted by a hook
    #[error("Session aborted: {0}")]
    Aborted(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for BackstepError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BackstepError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BackstepError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BackstepError::Bincode(err.to_string())
    }
}

impl BackstepError {
    /// Create a parse error
    pub fn parse(context: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        BackstepError::Parse {
            context: context.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a corrupt-metadata error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        BackstepError::CorruptMetadata(msg.into())
    }

    /// Create a delta error with a custom message
    pub fn delta(msg: impl Into<String>) -> Self {
        BackstepError::Delta(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        BackstepError::Compression(msg.into())
    }

    /// Create a protocol error with a custom message
    pub fn protocol(msg: impl Into<String>) -> Self {
        BackstepError::Protocol(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackstepError::Internal(msg.into())
    }

    /// Turn an I/O error on `path` into a permission error when that is what it is
    pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            BackstepError::PermissionDenied { path: path.into() }
        } else {
            BackstepError::Io(err)
        }
    }

    /// Errors that must stop the operation and require operator attention
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackstepError::Parse { .. }
                | BackstepError::OrderingViolation { .. }
                | BackstepError::RegressInconsistency { .. }
                | BackstepError::CorruptMetadata(_)
                | BackstepError::Overflow { .. }
        )
    }

    /// Errors scoped to a single entry; the session records them and continues
    pub fn is_file_level(&self) -> bool {
        match self {
            BackstepError::PermissionDenied { .. } => true,
            BackstepError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::Unsupported
            ),
            _ => false,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackstepError::NotInitialized(path) => {
                format!("No backup repository at {:?}. Run a backup into it first.", path)
            }
            BackstepError::RegressInconsistency { index, message } => format!(
                "The destination cannot be rolled back safely at {} ({}). \
                 Inspect the increments directory by hand before retrying.",
                index, message
            ),
            BackstepError::CorruptMetadata(msg) => format!(
                "Backup metadata is unreadable: {}. Refusing to guess at history.",
                msg
            ),
            BackstepError::PermissionDenied { path } => {
                format!("Permission denied for {:?}. Check file permissions or run with appropriate privileges.", path)
            }
            _ => self.to_string(),
        }
    }
}
