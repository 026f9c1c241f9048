//! Joins chunk production with asynchronous upload completion.
//!
//! Every file job owns one [PendingFile] entry in a mutex-guarded table.
//! The processor feeds staged chunks in while uploads complete in arbitrary
//! order on other tasks; after every state change the completion predicate
//! is re-evaluated under the lock, so either ordering of "last chunk staged"
//! and "last upload finished" converges to exactly one report.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chunk::{FileChunk, TemporaryChunk, UploadState};
use crate::UploadError;

/// Aggregated outcome of one file job, delivered exactly once per file.
#[derive(Debug)]
pub struct FileIngestReport {
    pub local_path: PathBuf,
    /// Whole-file object, present for unchunked files and promoted
    /// single-chunk files.
    pub bulk: Option<FileChunk>,
    /// Chunk list in ascending offset order; empty for bulk-only files.
    pub chunks: Vec<FileChunk>,
    pub errors: u32,
}

impl FileIngestReport {
    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.errors == 0
    }
}

struct PendingFile {
    /// Staged chunks, keyed by temporary path until the uploader has stored
    /// them under their content address.
    chunks: HashMap<PathBuf, TemporaryChunk>,
    bulk: Option<TemporaryChunk>,
    chunks_uploaded: u32,
    errors: u32,
    processing_complete: bool,
    uploading_complete: bool,
}

impl PendingFile {
    fn new() -> Self {
        Self {
            chunks: HashMap::new(),
            bulk: None,
            chunks_uploaded: 0,
            errors: 0,
            processing_complete: false,
            uploading_complete: false,
        }
    }

    fn expected_uploads(&self) -> u32 {
        self.chunks.len() as u32 + u32::from(self.bulk.is_some())
    }

    fn is_complete(&self) -> bool {
        self.processing_complete && self.chunks_uploaded >= self.expected_uploads()
    }

    fn into_report(mut self, local_path: PathBuf) -> FileIngestReport {
        let mut chunks: Vec<FileChunk> = self
            .chunks
            .values()
            .map(TemporaryChunk::as_file_chunk)
            .collect();
        chunks.sort_by_key(|c| c.offset);

        FileIngestReport {
            local_path,
            bulk: self.bulk.take().map(|b| b.as_file_chunk()),
            chunks,
            errors: self.errors,
        }
    }
}

/// The path-keyed table of in-flight file jobs.
pub struct PendingFiles {
    inner: Mutex<HashMap<PathBuf, PendingFile>>,
    reports: mpsc::UnboundedSender<FileIngestReport>,
}

impl PendingFiles {
    pub fn new(reports: mpsc::UnboundedSender<FileIngestReport>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            reports,
        }
    }

    /// Register a new file job. Returns false if a build for this path is
    /// already outstanding; at most one build per local file may be in
    /// flight.
    pub fn open(&self, local_path: &Path) -> bool {
        let mut table = self.inner.lock().unwrap();
        if table.contains_key(local_path) {
            return false;
        }
        table.insert(local_path.to_owned(), PendingFile::new());
        true
    }

    pub fn add_chunk(&self, local_path: &Path, chunk: TemporaryChunk) {
        let mut table = self.inner.lock().unwrap();
        if let Some(file) = table.get_mut(local_path) {
            file.chunks.insert(chunk.temp_path.clone(), chunk);
        } else {
            warn!(path = ?local_path, "add_chunk for unknown pending file");
        }
    }

    pub fn add_bulk(&self, local_path: &Path, chunk: TemporaryChunk) {
        let mut table = self.inner.lock().unwrap();
        if let Some(file) = table.get_mut(local_path) {
            file.bulk = Some(chunk);
        } else {
            warn!(path = ?local_path, "add_bulk for unknown pending file");
        }
    }

    /// If chunking produced exactly one chunk, that chunk becomes the bulk
    /// representation and the chunk list is emptied, so catalogs never carry
    /// a one-element chunk list.
    pub fn promote_single_chunk_to_bulk(&self, local_path: &Path) {
        let mut table = self.inner.lock().unwrap();
        if let Some(file) = table.get_mut(local_path) {
            if file.bulk.is_none() && file.chunks.len() == 1 {
                let key = file.chunks.keys().next().cloned().unwrap();
                file.bulk = file.chunks.remove(&key);
            }
        }
    }

    /// Record one finished upload, identified by the chunk's temporary path.
    pub fn upload_callback(
        &self,
        local_path: &Path,
        temp_path: &Path,
        result: Result<(), UploadError>,
    ) {
        let completed = {
            let mut table = self.inner.lock().unwrap();
            let Some(file) = table.get_mut(local_path) else {
                warn!(path = ?local_path, "upload callback for unknown pending file");
                return;
            };

            let state = match &result {
                Ok(()) => UploadState::Successful,
                Err(_) => UploadState::Failed,
            };
            if let Some(chunk) = file.chunks.get_mut(temp_path) {
                chunk.state = state;
            } else if let Some(bulk) = file
                .bulk
                .as_mut()
                .filter(|b| b.temp_path == temp_path)
            {
                bulk.state = state;
            } else {
                warn!(path = ?local_path, temp = ?temp_path, "upload callback for unknown chunk");
            }

            file.chunks_uploaded += 1;
            if let Err(err) = result {
                debug!(path = ?local_path, %err, "chunk upload failed");
                file.errors += 1;
            }

            Self::take_if_complete(&mut table, local_path)
        };

        if let Some(report) = completed {
            self.deliver(report);
        }
    }

    /// All chunks and the optional bulk object have been handed to the
    /// uploader; the file may still wait for outstanding uploads.
    pub fn finalize_processing(&self, local_path: &Path) {
        let completed = {
            let mut table = self.inner.lock().unwrap();
            let Some(file) = table.get_mut(local_path) else {
                warn!(path = ?local_path, "finalize for unknown pending file");
                return;
            };
            file.processing_complete = true;
            Self::take_if_complete(&mut table, local_path)
        };

        if let Some(report) = completed {
            self.deliver(report);
        }
    }

    /// Chunking or staging failed. The job still completes (with a nonzero
    /// error count) once any uploads already in flight have called back.
    pub fn fail_processing(&self, local_path: &Path) {
        let completed = {
            let mut table = self.inner.lock().unwrap();
            let Some(file) = table.get_mut(local_path) else {
                warn!(path = ?local_path, "fail_processing for unknown pending file");
                return;
            };
            file.errors += 1;
            file.processing_complete = true;
            Self::take_if_complete(&mut table, local_path)
        };

        if let Some(report) = completed {
            self.deliver(report);
        }
    }

    /// Force-complete everything still in the table. Used on shutdown; each
    /// affected file reports with `errors > 0`.
    pub fn drain_remaining(&self) -> usize {
        let leftovers: Vec<(PathBuf, PendingFile)> =
            self.inner.lock().unwrap().drain().collect();
        let count = leftovers.len();
        for (path, mut file) in leftovers {
            file.errors += 1;
            file.uploading_complete = true;
            self.deliver(file.into_report(path));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completion predicate, re-evaluated under the lock after every event.
    /// Removing the entry here is what makes the report fire exactly once.
    fn take_if_complete(
        table: &mut HashMap<PathBuf, PendingFile>,
        local_path: &Path,
    ) -> Option<FileIngestReport> {
        let file = table.get_mut(local_path)?;
        if !file.is_complete() || file.uploading_complete {
            return None;
        }
        file.uploading_complete = true;
        let file = table.remove(local_path).unwrap();
        Some(file.into_report(local_path.to_owned()))
    }

    fn deliver(&self, report: FileIngestReport) {
        debug!(path = ?report.local_path, errors = report.errors, "file job completed");
        // The receiver going away means nobody cares about results anymore.
        let _ = self.reports.send(report);
    }
}
