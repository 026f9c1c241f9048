//! Fixed-size worker pool executing file jobs.
//!
//! Workers pull jobs from a bounded queue (enqueue suspends when full),
//! memory-map the input, chunk and stage it, and hand every staged object
//! to the uploader without waiting for the uploads to land. A worker is
//! done with a job once processing is finished; the pending-file table
//! joins that with upload completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::chunker::{Chunker, ChunkerConfig, ChunkerConfigError};
use crate::pending::{FileIngestReport, PendingFiles};
use crate::staging::stage_chunk;
use crate::uploader::Uploader;
use crate::IngestError;

#[derive(Clone, Debug)]
pub struct FileJob {
    pub local_path: PathBuf,
    pub allow_chunking: bool,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProcessorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Directory staged chunks are written to before upload.
    pub staging_dir: PathBuf,
    /// Content-defined chunking; `None` forces every file into its bulk
    /// representation.
    #[serde(default)]
    pub chunking: Option<ChunkerConfig>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_depth() -> usize {
    256
}

fn default_compression_level() -> i32 {
    zstd::DEFAULT_COMPRESSION_LEVEL
}

impl FileProcessorConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            staging_dir: staging_dir.into(),
            chunking: Some(ChunkerConfig::default()),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessorSpawnError {
    #[error("invalid chunker configuration: {0}")]
    Chunker(#[from] ChunkerConfigError),

    #[error("unable to create staging directory {path:?}: {source}")]
    StagingDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
#[error("file processor is shut down")]
pub struct ProcessorClosed(pub FileJob);

struct WorkerContext {
    chunker: Option<Chunker>,
    staging_dir: PathBuf,
    compression_level: i32,
    uploader: Arc<dyn Uploader>,
    pending: Arc<PendingFiles>,
    uploads: TaskTracker,
    runtime: Handle,
}

pub struct FileProcessor {
    jobs: mpsc::Sender<FileJob>,
    workers: Vec<JoinHandle<()>>,
    uploads: TaskTracker,
    pending: Arc<PendingFiles>,
}

impl FileProcessor {
    /// Start the pool. Must be called from within a tokio runtime. Returns
    /// the handle and the stream of per-file reports; every submitted job
    /// produces exactly one report.
    pub fn spawn(
        config: FileProcessorConfig,
        uploader: Arc<dyn Uploader>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FileIngestReport>), ProcessorSpawnError> {
        let chunker = config.chunking.map(Chunker::new).transpose()?;
        std::fs::create_dir_all(&config.staging_dir).map_err(|source| {
            ProcessorSpawnError::StagingDir {
                path: config.staging_dir.clone(),
                source,
            }
        })?;

        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_depth.max(1));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingFiles::new(reports_tx));
        let uploads = TaskTracker::new();

        let ctx = Arc::new(WorkerContext {
            chunker,
            staging_dir: config.staging_dir,
            compression_level: config.compression_level,
            uploader,
            pending: pending.clone(),
            uploads: uploads.clone(),
            runtime: Handle::current(),
        });

        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, jobs_rx.clone(), ctx.clone())))
            .collect();

        Ok((
            Self {
                jobs: jobs_tx,
                workers,
                uploads,
                pending,
            },
            reports_rx,
        ))
    }

    /// Enqueue a job; suspends while the queue is at capacity.
    pub async fn submit(&self, job: FileJob) -> Result<(), ProcessorClosed> {
        self.jobs
            .send(job)
            .await
            .map_err(|e| ProcessorClosed(e.0))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop accepting jobs, drain in-flight jobs and their uploads, then
    /// destroy remaining pending state. Returns the number of files that
    /// had to be force-completed (each of those reported `errors > 0`).
    pub async fn shutdown(self) -> usize {
        let Self {
            jobs,
            workers,
            uploads,
            pending,
        } = self;

        drop(jobs);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(%err, "file processor worker panicked");
            }
        }
        uploads.close();
        uploads.wait().await;
        pending.drain_remaining()
    }
}

async fn run_worker(
    id: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<FileJob>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };
        process_job(&ctx, job).await;
    }
    debug!(worker = id, "file processor worker exiting");
}

#[instrument(skip_all, fields(path = ?job.local_path))]
async fn process_job(ctx: &Arc<WorkerContext>, job: FileJob) {
    if !ctx.pending.open(&job.local_path) {
        // At most one outstanding build per local file; the first build's
        // report covers it.
        warn!("dropping job, a build for this file is already outstanding");
        return;
    }

    let blocking_ctx = ctx.clone();
    let blocking_job = job.clone();
    let built =
        tokio::task::spawn_blocking(move || build_file(&blocking_ctx, &blocking_job)).await;

    match built {
        Ok(Ok(())) => ctx.pending.finalize_processing(&job.local_path),
        Ok(Err(err)) => {
            warn!(%err, "file job failed");
            ctx.pending.fail_processing(&job.local_path);
        }
        Err(err) => {
            warn!(%err, "file job panicked");
            ctx.pending.fail_processing(&job.local_path);
        }
    }
}

/// Map the input and stage its content, handing each staged object to the
/// uploader as soon as it exists. Runs on the blocking pool.
fn build_file(ctx: &WorkerContext, job: &FileJob) -> Result<(), IngestError> {
    let file = std::fs::File::open(&job.local_path).map_err(|source| {
        IngestError::UnableToOpen {
            path: job.local_path.clone(),
            source,
        }
    })?;
    let len = file
        .metadata()
        .map_err(|source| IngestError::UnableToOpen {
            path: job.local_path.clone(),
            source,
        })?
        .len();

    // Zero-length files cannot be mapped; they get an empty bulk object.
    let mapped;
    let data: &[u8] = if len == 0 {
        &[]
    } else {
        // SAFETY: read-only mapping of a file in the publisher's staging
        // area; nothing rewrites these files while a job is in flight.
        mapped = unsafe { Mmap::map(&file) }.map_err(|source| IngestError::UnableToOpen {
            path: job.local_path.clone(),
            source,
        })?;
        &mapped
    };

    let spans = match &ctx.chunker {
        Some(chunker) if job.allow_chunking && len > chunker.config().min_size as u64 => {
            chunker.cut_points(data)
        }
        _ => Vec::new(),
    };

    if spans.is_empty() {
        let chunk = stage_chunk(
            &ctx.staging_dir,
            &job.local_path,
            data,
            0,
            ctx.compression_level,
        )?;
        let temp_path = chunk.temp_path.clone();
        let key = chunk.digest.chunk_key();
        ctx.pending.add_bulk(&job.local_path, chunk);
        spawn_upload(ctx, &job.local_path, temp_path, key);
        return Ok(());
    }

    let single_chunk = spans.len() == 1;
    for span in spans {
        let slice = &data[span.offset as usize..(span.offset + span.size) as usize];
        let chunk = stage_chunk(
            &ctx.staging_dir,
            &job.local_path,
            slice,
            span.offset,
            ctx.compression_level,
        )?;
        let temp_path = chunk.temp_path.clone();
        let key = chunk.digest.chunk_key();
        ctx.pending.add_chunk(&job.local_path, chunk);
        spawn_upload(ctx, &job.local_path, temp_path, key);
    }

    if single_chunk {
        ctx.pending.promote_single_chunk_to_bulk(&job.local_path);
    }
    Ok(())
}

fn spawn_upload(ctx: &WorkerContext, local_path: &Path, temp_path: PathBuf, key: String) {
    let uploader = ctx.uploader.clone();
    let pending = ctx.pending.clone();
    let local_path = local_path.to_owned();

    ctx.uploads.spawn_on(
        async move {
            let result = uploader.upload(&temp_path, &key).await;
            // The staged file served its purpose either way.
            if let Err(err) = tokio::fs::remove_file(&temp_path).await {
                debug!(path = ?temp_path, %err, "could not remove staged chunk");
            }
            pending.upload_callback(&local_path, &temp_path, result);
        },
        &ctx.runtime,
    );
}
