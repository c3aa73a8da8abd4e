//! Storage error handling
//!
//! Provides typed errors for local store operations with descriptive messages
//! and recovery suggestions.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::{Collection, EntityId, ValidationError};

/// Errors that can occur during local store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Record failed schema validation
    #[error("Invalid record: {0}")]
    Invalid(#[from] ValidationError),

    /// A non-null reference points at an entity that does not exist
    #[error("{collection} {id}: field '{field}' references missing {target} {target_id}")]
    MissingReference {
        collection: Collection,
        id: EntityId,
        field: &'static str,
        target: Collection,
        target_id: EntityId,
    },

    /// Entity expected to exist was not found
    #[error("{collection} {id} not found")]
    NotFound { collection: Collection, id: EntityId },

    /// Another client instance wrote to the same store since we last looked
    #[error(
        "Store was modified by another instance (expected version {expected}, found {found}). \
         Reload before writing."
    )]
    VersionConflict { expected: i64, found: i64 },

    /// Stored JSON could not be decoded
    #[error("Corrupt {what} row: {details}")]
    Corrupt { what: &'static str, details: String },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Create an error from an I/O error with path context
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                StoreError::CreateDirectory {
                    path,
                    source: error,
                }
            }
            _ => StoreError::Io(error),
        }
    }

    /// Check if this error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. }
                | StoreError::Invalid(_)
                | StoreError::MissingReference { .. }
                | StoreError::NotFound { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::VersionConflict { .. } => {
                Some("Another lorekeep process changed the data. Reload and retry the edit.")
            }
            StoreError::MissingReference { .. } => {
                Some("Create the referenced entity first, or clear the reference field.")
            }
            StoreError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StoreError::Corrupt { .. } => {
                Some("The database contains a row this version cannot read. Restore from backup or re-pull from the remote.")
            }
            _ => None,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
