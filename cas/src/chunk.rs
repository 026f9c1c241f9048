use std::path::PathBuf;

use crate::CasDigest;

/// A content-addressed span of a file, as recorded in a catalog.
/// Chunks of one file partition `[0, size)` in ascending offset order.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileChunk {
    pub offset: u64,
    pub size: u64,
    pub digest: CasDigest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Successful,
    Failed,
}

/// A staged chunk: compressed, digested, and written to a temporary path
/// that identifies it until the uploader has stored it under its content
/// address.
#[derive(Debug)]
pub struct TemporaryChunk {
    pub temp_path: PathBuf,
    pub digest: CasDigest,
    pub offset: u64,
    pub size: u64,
    pub state: UploadState,
}

impl TemporaryChunk {
    pub fn as_file_chunk(&self) -> FileChunk {
        FileChunk {
            offset: self.offset,
            size: self.size,
            digest: self.digest.clone(),
        }
    }
}
