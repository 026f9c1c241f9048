//! Versioned tag history of published root catalogs: named publication
//! points, per-channel tips, date lookup, and rollback.

mod store;
mod tag;

pub use store::{TagStore, HEAD_TAG, PREVIOUS_HEAD_TAG};
pub use tag::{Channel, Tag};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("duplicate tag name: {0}")]
    Duplicate(String),

    #[error("no such tag: {0}")]
    NotFound(String),

    #[error("rollback target {0} is not part of its own affected set")]
    RollbackTargetInvalid(String),

    #[error("history load failed: {0}")]
    LoadFailed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<redb::DatabaseError> for HistoryError {
    fn from(e: redb::DatabaseError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for HistoryError {
    fn from(e: redb::TransactionError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for HistoryError {
    fn from(e: redb::TableError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for HistoryError {
    fn from(e: redb::StorageError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for HistoryError {
    fn from(e: redb::CommitError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for HistoryError {
    fn from(e: bincode::Error) -> Self {
        HistoryError::Storage(e.to_string())
    }
}
