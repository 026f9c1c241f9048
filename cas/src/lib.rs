//! Content-addressed processing pipeline: content-defined chunking,
//! per-chunk compression and digesting, and the coordination between
//! chunk production and asynchronous upload completion.

mod chunk;
mod chunker;
mod digests;
mod errors;
mod staging;

pub mod pending;
pub mod processor;
pub mod uploader;

pub use chunk::{FileChunk, TemporaryChunk, UploadState};
pub use chunker::{ChunkSpan, Chunker, ChunkerConfig, ChunkerConfigError};
pub use digests::{CasDigest, DIGEST_LEN};
pub use errors::{IngestError, UploadError};
pub use pending::{FileIngestReport, PendingFiles};
pub use processor::{
    FileJob, FileProcessor, FileProcessorConfig, ProcessorClosed, ProcessorSpawnError,
};
pub use staging::stage_chunk;
pub use uploader::{MemoryUploader, ObjectStoreUploader, Uploader};
