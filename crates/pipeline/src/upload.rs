//! Upload coordinator: resumable, chunked transfer of a staged archive.
//!
//! Every acknowledged chunk is recorded in a per-job checkpoint file before
//! the next completion is processed, so a restarted upload only sends the
//! chunks the store never acknowledged. Chunks are retried with capped
//! exponential backoff; an unreachable store parks the upload on the
//! connectivity monitor instead of burning attempts.

use crate::builder::ArchiveBlob;
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::CredentialProvider;
use crate::error::PipelineError;
use crate::events::{emit, EventSender, PipelineEvent};
use crate::job::{CancelFlag, JobId};
use crate::remote::{RemoteError, RemoteReceipt, RemoteStore};
use media_archive_config::UploadConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Tunables for one coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub chunk_size: u64,
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_suspension: Duration,
}

impl UploadSettings {
    pub fn from_config(cfg: &UploadConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size_bytes.max(1),
            max_in_flight: cfg.max_in_flight_chunks.max(1) as usize,
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
            max_suspension: Duration::from_secs(cfg.max_suspension_secs),
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

/// Delay before retry number `attempt` (1-based): doubles each time, capped.
pub fn backoff_delay(settings: &UploadSettings, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    settings
        .initial_backoff
        .saturating_mul(factor)
        .min(settings.max_backoff)
}

/// Number of chunks needed for `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size.max(1)) as u32
}

fn chunk_range(index: u32, chunk_size: u64, size: u64) -> Range<u64> {
    let start = u64::from(index) * chunk_size;
    start..(start + chunk_size).min(size)
}

/// Durable record of which chunks of an archive the store acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub job_id: JobId,
    pub destination: String,
    pub blob_checksum: String,
    pub blob_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub acked: BTreeSet<u32>,
}

impl UploadCheckpoint {
    fn fresh(job_id: &str, destination: &str, blob: &ArchiveBlob, chunk_size: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            destination: destination.to_string(),
            blob_checksum: blob.checksum().to_string(),
            blob_size: blob.len(),
            chunk_size,
            total_chunks: chunk_count(blob.len(), chunk_size),
            acked: BTreeSet::new(),
        }
    }

    /// A checkpoint is only reusable for the exact same archive and layout.
    fn applies_to(&self, destination: &str, blob: &ArchiveBlob, chunk_size: u64) -> bool {
        self.destination == destination
            && self.blob_checksum == blob.checksum()
            && self.blob_size == blob.len()
            && self.chunk_size == chunk_size
    }

    pub fn bytes_acked(&self) -> u64 {
        self.acked
            .iter()
            .map(|i| {
                let range = chunk_range(*i, self.chunk_size, self.blob_size);
                range.end - range.start
            })
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.acked.len() as u32 == self.total_chunks
    }
}

/// Checkpoint files, one JSON document per job.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Load the checkpoint for `job_id`. An unreadable checkpoint is treated
    /// as absent: re-sending acknowledged chunks is always safe.
    pub fn load(&self, job_id: &str) -> Result<Option<UploadCheckpoint>, PipelineError> {
        let content = match fs::read_to_string(self.path_for(job_id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "ignoring unreadable upload checkpoint");
                Ok(None)
            }
        }
    }

    /// Replace the checkpoint atomically (write to a temp file, then rename).
    pub fn save(&self, checkpoint: &UploadCheckpoint) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.job_id);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.job_id));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(checkpoint)?)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, job_id: &str) -> Result<(), PipelineError> {
        match fs::remove_file(self.path_for(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Per-request retry bookkeeping.
struct RetryState {
    operation: String,
    attempts: u32,
    suspended: Duration,
}

impl RetryState {
    fn new(operation: String) -> Self {
        Self {
            operation,
            attempts: 0,
            suspended: Duration::ZERO,
        }
    }
}

/// Everything one remote request needs, cheap to clone into chunk tasks.
#[derive(Clone)]
struct RemoteCall {
    store: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    settings: UploadSettings,
    events: EventSender,
    job_id: JobId,
    destination: String,
    token: String,
}

impl RemoteCall {
    /// Park until online, bounded by what is left of the suspension budget.
    async fn park(&self, retry: &mut RetryState) -> Result<(), PipelineError> {
        let limit = self.settings.max_suspension;
        let remaining = limit.saturating_sub(retry.suspended);
        tracing::info!(job_id = %self.job_id, operation = %retry.operation, "upload suspended, waiting for connectivity");
        emit(
            &self.events,
            PipelineEvent::Suspended {
                job_id: self.job_id.clone(),
            },
        );

        let started = Instant::now();
        let online = self.connectivity.wait_online(remaining).await;
        retry.suspended += started.elapsed();
        if !online {
            return Err(PipelineError::SuspensionTimeout(limit));
        }

        tracing::info!(job_id = %self.job_id, "connectivity restored, resuming upload");
        emit(
            &self.events,
            PipelineEvent::Resumed {
                job_id: self.job_id.clone(),
            },
        );
        Ok(())
    }

    async fn await_connectivity(&self, retry: &mut RetryState) -> Result<(), PipelineError> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            self.park(retry).await
        }
    }

    /// Decide what a failed request means: wait and try again, or give up.
    async fn absorb(&self, retry: &mut RetryState, err: RemoteError) -> Result<(), PipelineError> {
        match err {
            RemoteError::Unavailable(reason) => {
                tracing::warn!(job_id = %self.job_id, %reason, "remote store unreachable");
                self.connectivity.set_online(false);
                self.park(retry).await
            }
            RemoteError::Transient(reason) => {
                retry.attempts += 1;
                if retry.attempts >= self.settings.max_attempts {
                    return Err(PipelineError::RetriesExhausted {
                        operation: retry.operation.clone(),
                        attempts: retry.attempts,
                        last_error: reason,
                    });
                }
                let delay = backoff_delay(&self.settings, retry.attempts);
                tracing::debug!(
                    job_id = %self.job_id,
                    operation = %retry.operation,
                    attempt = retry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RemoteError::AuthExpired => Err(PipelineError::AuthExpired),
            RemoteError::Rejected(reason) => Err(PipelineError::RemoteRejected(reason)),
        }
    }

    async fn put_chunk(&self, index: u32, offset: u64, data: &[u8]) -> Result<(), PipelineError> {
        let mut retry = RetryState::new(format!("chunk {}", index));
        loop {
            self.await_connectivity(&mut retry).await?;
            match self
                .store
                .put_chunk(&self.destination, offset, data, &self.token)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => self.absorb(&mut retry, err).await?,
            }
        }
    }

    async fn finalize(&self, size: u64) -> Result<RemoteReceipt, PipelineError> {
        let mut retry = RetryState::new("finalize".to_string());
        loop {
            self.await_connectivity(&mut retry).await?;
            match self
                .store
                .finalize(&self.destination, size, &self.token)
                .await
            {
                Ok(receipt) => return Ok(receipt),
                Err(err) => self.absorb(&mut retry, err).await?,
            }
        }
    }
}

/// Transfers archives to the remote store and verifies what arrived.
pub struct UploadCoordinator {
    store: Arc<dyn RemoteStore>,
    credentials: Arc<dyn CredentialProvider>,
    connectivity: ConnectivityMonitor,
    checkpoints: CheckpointStore,
    settings: UploadSettings,
    events: EventSender,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
        connectivity: ConnectivityMonitor,
        checkpoints: CheckpointStore,
        settings: UploadSettings,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            credentials,
            connectivity,
            checkpoints,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    fn remote_call(&self, job_id: &str, destination: &str) -> Result<RemoteCall, PipelineError> {
        Ok(RemoteCall {
            store: self.store.clone(),
            connectivity: self.connectivity.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            job_id: job_id.to_string(),
            destination: destination.to_string(),
            token: self.credentials.bearer_token()?,
        })
    }

    fn report_progress(&self, checkpoint: &UploadCheckpoint) {
        emit(
            &self.events,
            PipelineEvent::UploadProgress {
                job_id: checkpoint.job_id.clone(),
                bytes_acked: checkpoint.bytes_acked(),
                total_bytes: checkpoint.blob_size,
                chunks_acked: checkpoint.acked.len() as u32,
                total_chunks: checkpoint.total_chunks,
            },
        );
    }

    /// Send every chunk of `blob` the store has not yet acknowledged, then
    /// verify the stored object.
    pub async fn upload(
        &self,
        job_id: &str,
        blob: Arc<ArchiveBlob>,
        destination: &str,
        cancel: &CancelFlag,
    ) -> Result<RemoteReceipt, PipelineError> {
        self.upload_chunks(job_id, blob.clone(), destination, cancel)
            .await?;
        self.verify(job_id, destination, blob.checksum(), blob.len())
            .await
    }

    /// Transfer phase only.
    ///
    /// Up to `max_in_flight` chunks are sent concurrently; completions are
    /// recorded one at a time. Cancellation and failures stop new chunks from
    /// starting, but chunks already in flight are allowed to finish so their
    /// acknowledgement is not lost.
    pub async fn upload_chunks(
        &self,
        job_id: &str,
        blob: Arc<ArchiveBlob>,
        destination: &str,
        cancel: &CancelFlag,
    ) -> Result<(), PipelineError> {
        let call = self.remote_call(job_id, destination)?;
        let chunk_size = self.settings.chunk_size;

        let mut checkpoint = match self.checkpoints.load(job_id)? {
            Some(cp) if cp.applies_to(destination, &blob, chunk_size) => {
                tracing::info!(
                    job_id,
                    acked = cp.acked.len(),
                    total = cp.total_chunks,
                    "resuming upload from checkpoint"
                );
                cp
            }
            Some(_) => {
                tracing::warn!(job_id, "discarding checkpoint for a different archive");
                UploadCheckpoint::fresh(job_id, destination, &blob, chunk_size)
            }
            None => UploadCheckpoint::fresh(job_id, destination, &blob, chunk_size),
        };
        self.checkpoints.save(&checkpoint)?;
        self.report_progress(&checkpoint);

        let mut pending: VecDeque<u32> = (0..checkpoint.total_chunks)
            .filter(|i| !checkpoint.acked.contains(i))
            .collect();
        let mut in_flight = JoinSet::new();
        let mut failure: Option<PipelineError> = None;

        loop {
            while failure.is_none() && in_flight.len() < self.settings.max_in_flight {
                if pending.is_empty() {
                    break;
                }
                if cancel.is_cancelled() {
                    tracing::info!(job_id, "upload cancelled at chunk boundary");
                    failure = Some(PipelineError::Cancelled);
                    break;
                }
                let Some(index) = pending.pop_front() else {
                    break;
                };

                let range = chunk_range(index, chunk_size, blob.len());
                let call = call.clone();
                let blob = blob.clone();
                in_flight.spawn(async move {
                    let data = &blob.bytes()[range.start as usize..range.end as usize];
                    call.put_chunk(index, range.start, data).await.map(|()| index)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(index)) => {
                    checkpoint.acked.insert(index);
                    if let Err(e) = self.checkpoints.save(&checkpoint) {
                        failure.get_or_insert(e);
                    }
                    tracing::debug!(job_id, chunk = index, "chunk acknowledged");
                    self.report_progress(&checkpoint);
                }
                Ok(Err(e)) => {
                    tracing::warn!(job_id, error = %e, "chunk upload failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(PipelineError::Transient(format!(
                        "chunk task aborted: {}",
                        e
                    )));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finalize the upload and compare the store's checksum with the
    /// archive's. A mismatch discards the checkpoint so a retry re-sends the
    /// whole archive.
    pub async fn verify(
        &self,
        job_id: &str,
        destination: &str,
        expected_checksum: &str,
        size: u64,
    ) -> Result<RemoteReceipt, PipelineError> {
        let call = self.remote_call(job_id, destination)?;
        let receipt = call.finalize(size).await?;

        if receipt.remote_checksum.as_bytes() != expected_checksum.as_bytes() {
            tracing::error!(
                job_id,
                expected = expected_checksum,
                actual = %receipt.remote_checksum,
                "remote checksum mismatch"
            );
            self.checkpoints.remove(job_id)?;
            return Err(PipelineError::IntegrityMismatch {
                expected: expected_checksum.to_string(),
                actual: receipt.remote_checksum,
            });
        }

        self.checkpoints.remove(job_id)?;
        tracing::info!(job_id, remote_path = %receipt.remote_path, "upload verified");
        Ok(receipt)
    }
}
