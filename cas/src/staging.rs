use std::io::{Cursor, Write};
use std::path::Path;

use tracing::trace;

use crate::chunk::{TemporaryChunk, UploadState};
use crate::{CasDigest, IngestError};

/// Compress one span of a file, digest the compressed bytes, and write them
/// to a fresh temporary file in `staging_dir`.
///
/// The digest of the compressed bytes is the chunk's content address. If
/// compression or the write fails, the temporary file is unlinked before
/// the error propagates.
pub fn stage_chunk(
    staging_dir: &Path,
    source_path: &Path,
    data: &[u8],
    offset: u64,
    compression_level: i32,
) -> Result<TemporaryChunk, IngestError> {
    let compressed = zstd::encode_all(Cursor::new(data), compression_level).map_err(|source| {
        IngestError::CompressionFailed {
            path: source_path.to_owned(),
            source,
        }
    })?;
    let digest = CasDigest::of_bytes(&compressed);

    // NamedTempFile unlinks on drop, so a failed write leaves nothing behind.
    let staged = (|| -> std::io::Result<std::path::PathBuf> {
        let mut tmp = tempfile::NamedTempFile::new_in(staging_dir)?;
        tmp.write_all(&compressed)?;
        let (_file, path) = tmp.keep().map_err(|e| e.error)?;
        Ok(path)
    })()
    .map_err(|source| IngestError::StagingFailed {
        path: source_path.to_owned(),
        source,
    })?;

    trace!(chunk.digest = %digest, chunk.offset = offset, chunk.size = data.len(), "staged chunk");

    Ok(TemporaryChunk {
        temp_path: staged,
        digest,
        offset,
        size: data.len() as u64,
        state: UploadState::Pending,
    })
}
