use canopy_cas::UploadError;
use thiserror::Error;

use crate::path::CatalogPath;

/// Error taxonomy of the catalog subsystem.
///
/// The invariant-violation kinds (`AlreadyExists`, `ParentMissing`,
/// `NotFound`, `WrongType`, `NotEmpty`, `AlreadyNested`, `NotNested`) are
/// caller errors: they are surfaced and never retried. `Fatal` means an
/// internal consistency check failed and the publish must be aborted;
/// objects already uploaded are content-addressed orphans and harmless.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("entry already exists: {0}")]
    AlreadyExists(CatalogPath),

    #[error("parent directory missing for {0}")]
    ParentMissing(CatalogPath),

    #[error("no such entry: {0}")]
    NotFound(CatalogPath),

    #[error("wrong entry type at {0}")]
    WrongType(CatalogPath),

    #[error("directory not empty: {0}")]
    NotEmpty(CatalogPath),

    #[error("already a nested catalog mountpoint: {0}")]
    AlreadyNested(CatalogPath),

    #[error("not a nested catalog mountpoint: {0}")]
    NotNested(CatalogPath),

    #[error("invalid chunk list for {path}: {reason}")]
    InvalidChunkList { path: CatalogPath, reason: String },

    #[error("catalog load failed: {0}")]
    LoadFailed(String),

    #[error("catalog upload failed: {0}")]
    UploadFailed(#[from] UploadError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal catalog inconsistency: {0}")]
    Fatal(String),
}

impl From<redb::DatabaseError> for CatalogError {
    fn from(e: redb::DatabaseError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for CatalogError {
    fn from(e: redb::TransactionError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for CatalogError {
    fn from(e: redb::TableError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for CatalogError {
    fn from(e: redb::StorageError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for CatalogError {
    fn from(e: redb::CommitError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for CatalogError {
    fn from(e: bincode::Error) -> Self {
        CatalogError::Storage(e.to_string())
    }
}
