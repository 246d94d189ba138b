//! Transfer pipeline.
//!
//! A fixed pool of workers consumes jobs from a shared, closeable queue and
//! publishes exactly one outcome per job onto a results channel sized to the
//! job count, so no worker ever blocks on the caller. Workers only read job
//! descriptors and emit outcomes; the indexes are never touched from here.
//!
//! Upload path: file → zstd → chunked AEAD → store, streamed end to end.
//! Download path: store → chunked AEAD → zstd → file, then the written file
//! is re-hashed against the expected content hash.

pub mod progress;

use crate::crypto;
use crate::hash::{hash_file_async, ContentHash};
use crate::store::{ByteStream, ObjectStore};
use crate::utils::{HashtreeError, Result};
use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::tokio::write::ZstdDecoder;
use progress::{ProgressSink, TransferEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Worker pool size. More workers degrade throughput by overwhelming the
/// blob store and local disk; 3 is about the practical maximum.
pub const DEFAULT_WORKERS: usize = 3;

/// Retry budget per job.
pub const DEFAULT_ATTEMPTS: u32 = 4;

/// Duplex buffer between the encryption task and the store writer.
const PIPE_BUF_SIZE: usize = 64 * 1024;

/// One object to upload. The key is the content hash in hex for content
/// objects, or the artifact name for index/database uploads.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub key: String,
    pub path: PathBuf,
}

/// One object to download and verify against its content hash.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub hash: ContentHash,
    pub dest: PathBuf,
}

enum Job {
    Upload(UploadJob),
    Download(DownloadJob),
}

struct Outcome {
    key: String,
    file: String,
    error: Option<HashtreeError>,
}

/// Aggregate result of one transfer phase. Some jobs may succeed while
/// others fail; the caller receives both.
#[derive(Debug, Default)]
pub struct TransferReport {
    pub succeeded: usize,
    /// Keys of jobs that exhausted their retry budget.
    pub failed: Vec<String>,
}

impl TransferReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    /// Collapse into an error when any job failed.
    pub fn require_complete(&self) -> Result<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(HashtreeError::PartialTransfer {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

struct PipelineInner {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    passphrase: String,
    attempts: u32,
    nuke: bool,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

/// Bounded-concurrency transfer pipeline.
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        passphrase: String,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                store,
                bucket,
                passphrase,
                attempts: DEFAULT_ATTEMPTS,
                nuke: false,
                sink,
                cancel,
            }),
            workers: DEFAULT_WORKERS,
        }
    }

    fn inner_mut(&mut self) -> &mut PipelineInner {
        // Builders run before the pipeline is handed to workers.
        Arc::get_mut(&mut self.inner).expect("pipeline already shared with workers")
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.inner_mut().attempts = attempts.max(1);
        self
    }

    /// Permit overwriting local files whose content differs from the
    /// expected hash ("nuke").
    pub fn with_nuke(mut self, nuke: bool) -> Self {
        self.inner_mut().nuke = nuke;
        self
    }

    /// Upload a batch, blocking until every outcome has been collected.
    pub async fn upload(&self, jobs: Vec<UploadJob>) -> Result<TransferReport> {
        self.run(jobs.into_iter().map(Job::Upload).collect(), "upload")
            .await
    }

    /// Download a batch, blocking until every outcome has been collected.
    pub async fn download(&self, jobs: Vec<DownloadJob>) -> Result<TransferReport> {
        self.run(jobs.into_iter().map(Job::Download).collect(), "download")
            .await
    }

    async fn run(&self, jobs: Vec<Job>, phase: &'static str) -> Result<TransferReport> {
        let total = jobs.len();
        let mut report = TransferReport::default();
        if total == 0 {
            self.inner.sink.emit(TransferEvent::PhaseDone {
                phase,
                succeeded: 0,
                failed: 0,
            });
            return Ok(report);
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>(self.workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        // Sized to the job count so workers never block publishing results.
        let (result_tx, mut result_rx) = mpsc::channel::<Outcome>(total);

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                loop {
                    if inner.cancel.is_cancelled() {
                        break;
                    }
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };

                    let outcome = inner.process(job).await;
                    if let Some(err) = &outcome.error {
                        // Connection-class failures cannot succeed for any
                        // other job either; abort the batch.
                        if err.is_connection() {
                            inner.cancel.cancel();
                        }
                    }
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);
        // Workers now hold the only receiver handles. Once cancellation
        // makes them all exit, the queue closes and the send below errors
        // instead of blocking on a full buffer.
        drop(job_rx);

        for job in jobs {
            if job_tx.send(job).await.is_err() {
                // All workers exited (cancellation); remaining jobs are moot.
                break;
            }
        }
        drop(job_tx);

        while let Some(outcome) = result_rx.recv().await {
            match outcome.error {
                None => report.succeeded += 1,
                Some(error) => {
                    self.inner.sink.emit(TransferEvent::Failed {
                        key: outcome.key.clone(),
                        file: outcome.file,
                        error: error.to_string(),
                    });
                    report.failed.push(outcome.key);
                }
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.sink.emit(TransferEvent::PhaseDone {
            phase,
            succeeded: report.succeeded,
            failed: report.failed.len(),
        });

        if self.inner.cancel.is_cancelled() {
            return Err(HashtreeError::Cancelled);
        }
        Ok(report)
    }
}

impl PipelineInner {
    async fn process(&self, job: Job) -> Outcome {
        match job {
            Job::Upload(job) => self.process_upload(job).await,
            Job::Download(job) => self.process_download(job).await,
        }
    }

    /// Argon2id is memory-hard; run it off the async runtime. The key is
    /// derived once per job, not per attempt.
    async fn derive_job_key(&self, object_key: &str) -> Result<[u8; 32]> {
        let passphrase = self.passphrase.clone();
        let bucket = self.bucket.clone();
        let object_key = object_key.to_string();
        tokio::task::spawn_blocking(move || crypto::derive_key(&passphrase, &bucket, &object_key))
            .await
            .map_err(|e| HashtreeError::Crypto(format!("key derivation task failed: {e}")))?
    }

    async fn process_upload(&self, job: UploadJob) -> Outcome {
        let file = file_name(&job.path);
        let key = match self.derive_job_key(&job.key).await {
            Ok(key) => key,
            Err(e) => return Outcome { key: job.key, file, error: Some(e) },
        };

        let mut last_err = None;
        for attempt in 0..self.attempts {
            if self.cancel.is_cancelled() {
                return Outcome { key: job.key, file, error: Some(HashtreeError::Cancelled) };
            }
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            match self.try_upload(&job, &key).await {
                Ok((bytes, elapsed)) => {
                    self.sink.emit(TransferEvent::Uploaded {
                        key: job.key.clone(),
                        file: file.clone(),
                        bytes,
                        elapsed,
                    });
                    return Outcome { key: job.key, file, error: None };
                }
                Err(e) => {
                    if e.is_connection() || attempt + 1 == self.attempts {
                        return Outcome { key: job.key, file, error: Some(e) };
                    }
                    warn!(
                        "Upload of {} failed (attempt {}/{}): {}",
                        job.key,
                        attempt + 1,
                        self.attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Outcome {
            key: job.key,
            file,
            error: last_err.or(Some(HashtreeError::Cancelled)),
        }
    }

    async fn try_upload(&self, job: &UploadJob, key: &[u8; 32]) -> Result<(u64, Duration)> {
        let start = Instant::now();

        let source = tokio::fs::File::open(&job.path).await?;
        let compressor = ZstdEncoder::new(BufReader::new(source));

        // Compress and encrypt into a bounded in-process pipe feeding the
        // store writer, so nothing buffers the whole file.
        let (pipe_rx, mut pipe_tx) = tokio::io::duplex(PIPE_BUF_SIZE);
        let key = *key;
        let seal_task = tokio::spawn(async move {
            let result = crypto::encrypt_stream(&key, compressor, &mut pipe_tx).await;
            let _ = pipe_tx.shutdown().await;
            result
        });

        let put_result = self
            .store
            .put_object(&job.key, Box::new(pipe_rx) as ByteStream, None)
            .await;
        let seal_result = seal_task
            .await
            .map_err(|e| HashtreeError::Crypto(format!("encryption task failed: {e}")))?;

        let written = put_result?;
        seal_result?;
        Ok((written, start.elapsed()))
    }

    async fn process_download(&self, job: DownloadJob) -> Outcome {
        let key_hex = job.hash.to_hex();
        let file = file_name(&job.dest);

        // Verify before transferring: an existing local file that already
        // matches the expected hash satisfies the job without a fetch; one
        // that differs is only overwritten when nuke was requested.
        match tokio::fs::try_exists(&job.dest).await {
            Ok(true) => match hash_file_async(&job.dest).await {
                Ok(actual) if actual == job.hash => {
                    self.sink.emit(TransferEvent::Verified {
                        key: key_hex.clone(),
                        file: file.clone(),
                    });
                    return Outcome { key: key_hex, file, error: None };
                }
                Ok(_) if !self.nuke => {
                    let conflict =
                        HashtreeError::LocalFileConflict(job.dest.display().to_string());
                    return Outcome { key: key_hex, file, error: Some(conflict) };
                }
                Ok(_) => {} // nuke requested: proceed to overwrite
                Err(e) => return Outcome { key: key_hex, file, error: Some(e) },
            },
            Ok(false) => {}
            Err(e) => return Outcome { key: key_hex, file, error: Some(e.into()) },
        }

        let key = match self.derive_job_key(&key_hex).await {
            Ok(key) => key,
            Err(e) => return Outcome { key: key_hex, file, error: Some(e) },
        };

        let mut last_err = None;
        for attempt in 0..self.attempts {
            if self.cancel.is_cancelled() {
                return Outcome { key: key_hex, file, error: Some(HashtreeError::Cancelled) };
            }
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            match self.try_download(&job, &key).await {
                Ok((bytes, elapsed)) => {
                    self.sink.emit(TransferEvent::Downloaded {
                        key: key_hex.clone(),
                        file: file.clone(),
                        bytes,
                        elapsed,
                    });
                    return Outcome { key: key_hex, file, error: None };
                }
                Err(e) => {
                    if e.is_connection()
                        || matches!(e, HashtreeError::NotFound(_))
                        || attempt + 1 == self.attempts
                    {
                        return Outcome { key: key_hex, file, error: Some(e) };
                    }
                    warn!(
                        "Download of {} failed (attempt {}/{}): {}",
                        key_hex,
                        attempt + 1,
                        self.attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Outcome {
            key: key_hex,
            file,
            error: last_err.or(Some(HashtreeError::Cancelled)),
        }
    }

    async fn try_download(&self, job: &DownloadJob, key: &[u8; 32]) -> Result<(u64, Duration)> {
        let start = Instant::now();
        let key_hex = job.hash.to_hex();

        // Reject ciphertext whose length cannot come out of the chunked
        // format before touching the local filesystem.
        let cipher_size = self.store.stat_object(&key_hex).await?;
        crypto::decrypted_size(cipher_size)?;

        if let Some(parent) = job.dest.parent() {
            // Safe under concurrent invocation for sibling paths.
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = self.store.get_object(&key_hex).await?;
        let dest = tokio::fs::File::create(&job.dest).await?;
        let mut decompressor = ZstdDecoder::new(BufWriter::new(dest));
        crypto::decrypt_stream(key, source, &mut decompressor).await?;
        decompressor.shutdown().await?;

        // Integrity gate: the written file must hash back to the content
        // hash it was stored under.
        let actual = hash_file_async(&job.dest).await?;
        if actual != job.hash {
            return Err(HashtreeError::ChecksumMismatch {
                key: key_hex,
                expected: job.hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let bytes = tokio::fs::metadata(&job.dest).await?.len();
        Ok((bytes, start.elapsed()))
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
