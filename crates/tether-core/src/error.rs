//! Error types for the tether transport and resolver.
//!
//! `TetherError` is what library operations return. Anything that reaches an
//! RPC listener is first converted into a [`Status`](crate::status::Status)
//! through [`TetherError::status_code`].

use crate::status::Code;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the tether crates.
#[derive(Debug, Error)]
pub enum TetherError {
    // Descriptor errors
    #[error("Invalid descriptor {uri}: {message}")]
    InvalidDescriptor { uri: String, message: String },

    // Lifecycle errors
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Transport errors
    #[error("Transaction {code} was not enqueued: {message}")]
    TransactionFailed { code: u32, message: String },

    #[error("Peer handle {handle} is dead")]
    DeadObject { handle: u64 },

    #[error("Malformed parcel: {message}")]
    Parcel { message: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Directory errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Provider not found: {component}")]
    ProviderNotFound { component: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for TetherError {
    fn from(err: rusqlite::Error) -> Self {
        TetherError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TetherError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TetherError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Map this error onto an RPC status code.
    ///
    /// - `InvalidArgument`: malformed descriptors and parcels
    /// - `FailedPrecondition`: lifecycle misuse
    /// - `Unavailable`: the peer is gone or refused the transaction
    /// - `NotFound`: unknown provider
    /// - `Internal`: everything else
    pub fn status_code(&self) -> Code {
        match self {
            TetherError::InvalidDescriptor { .. }
            | TetherError::Parcel { .. }
            | TetherError::FrameTooLarge { .. } => Code::InvalidArgument,

            TetherError::IllegalState(_) => Code::FailedPrecondition,

            TetherError::TransactionFailed { .. } | TetherError::DeadObject { .. } => {
                Code::Unavailable
            }

            TetherError::ProviderNotFound { .. } => Code::NotFound,

            _ => Code::Internal,
        }
    }

    /// Whether the peer behind a handle can no longer be reached.
    pub fn is_dead_object(&self) -> bool {
        matches!(self, TetherError::DeadObject { .. })
    }
}
