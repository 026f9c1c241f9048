use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single file job. A failed job reports through its
/// completion with `errors > 0`; other files are unaffected.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("chunking failed for {path:?}: {reason}")]
    ChunkingFailed { path: PathBuf, reason: String },

    #[error("compression failed for {path:?}: {source}")]
    CompressionFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to open {path:?}: {source}")]
    UnableToOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to stage chunk for {path:?}: {source}")]
    StagingFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failures reported by an [crate::Uploader]. The uploader may retry its own
/// transport internally; an error here is final for the submitted object.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("backend error for {key}: {reason}")]
    Backend { key: String, reason: String },

    #[error("uploader is shutting down")]
    ShuttingDown,
}
