//! Pipeline orchestrator: drives archive jobs through the ledger state
//! machine.
//!
//! Each job runs through Planned -> Building -> Built -> Uploading ->
//! Verifying -> Completed, with every transition committed to the ledger
//! before the next stage starts. A stage failure is recorded on the job and
//! the job stops; only an explicit `retry` moves it again, re-entering at the
//! stage recorded at failure time.
//!
//! Job concurrency is bounded by a semaphore, and archive building runs on the
//! blocking pool behind a second, smaller semaphore so that file reads never
//! starve uploads.

use crate::archives::ArchiveListing;
use crate::builder::{self, ArchiveBlob, BuildMode, BuildOutput, StagingArea};
use crate::catalog::{FileCatalog, ScanSummary};
use crate::concurrency::WorkerPlan;
use crate::config::{ArchivePolicy, Config};
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::CredentialProvider;
use crate::error::PipelineError;
use crate::events::{emit, event_channel, EventSender, PipelineEvent};
use crate::job::{current_timestamp_ms, ArchiveJob, CancelFlag, JobId, JobState};
use crate::ledger::{ArchiveLedger, JobFilter, TransitionMetadata};
use crate::metrics::{record_event, SharedMetrics};
use crate::planner::{plan_excluding, PlanOutcome};
use crate::reclaim::{reclaim_originals, ReclaimReport};
use crate::remote::RemoteStore;
use crate::source::FileSource;
use crate::upload::{CheckpointStore, UploadCoordinator, UploadSettings};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

pub const STAGING_DIR: &str = "staging";
pub const CHECKPOINT_DIR: &str = "uploads";

/// External collaborators the pipeline talks to.
pub struct Collaborators {
    pub source: Arc<dyn FileSource>,
    pub store: Arc<dyn RemoteStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub connectivity: ConnectivityMonitor,
}

/// Result of `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(JobId),
    /// No eligible file is left to archive.
    NothingToArchive,
}

pub struct PipelineOrchestrator {
    catalog: FileCatalog,
    ledger: Arc<ArchiveLedger>,
    source: Arc<dyn FileSource>,
    uploader: UploadCoordinator,
    staging: StagingArea,
    policy: ArchivePolicy,
    destination_prefix: String,
    job_slots: Arc<Semaphore>,
    build_slots: Arc<Semaphore>,
    running: Mutex<HashMap<JobId, CancelFlag>>,
    events: EventSender,
    metrics: SharedMetrics,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &Config,
        plan: &WorkerPlan,
        ledger: Arc<ArchiveLedger>,
        collaborators: Collaborators,
        metrics: SharedMetrics,
    ) -> Arc<Self> {
        let state_dir = &config.pipeline.state_dir;
        let events = event_channel();

        let mut settings = UploadSettings::from_config(&config.upload);
        settings.max_in_flight = plan.max_in_flight_chunks.max(1) as usize;

        let uploader = UploadCoordinator::new(
            collaborators.store,
            collaborators.credentials,
            collaborators.connectivity,
            CheckpointStore::new(state_dir.join(CHECKPOINT_DIR)),
            settings,
            events.clone(),
        );

        Arc::new(Self {
            catalog: FileCatalog::new(),
            ledger,
            source: collaborators.source,
            uploader,
            staging: StagingArea::new(state_dir.join(STAGING_DIR)),
            policy: config.policy.clone(),
            destination_prefix: config.upload.destination_prefix.clone(),
            job_slots: Arc::new(Semaphore::new(plan.max_concurrent_jobs.max(1) as usize)),
            build_slots: Arc::new(Semaphore::new(plan.build_workers.max(1) as usize)),
            running: Mutex::new(HashMap::new()),
            events,
            metrics,
        })
    }

    pub fn ledger(&self) -> &Arc<ArchiveLedger> {
        &self.ledger
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.uploader.connectivity()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Progress events for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancelFlag>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the file source and replace the catalog.
    pub async fn scan(&self) -> Result<ScanSummary, PipelineError> {
        let source = self.source.clone();
        let listing = tokio::task::spawn_blocking(move || source.list_files())
            .await
            .map_err(|e| PipelineError::Transient(format!("scan task failed: {}", e)))??;

        let count = self.catalog.ingest(listing)?;
        let summary = self
            .catalog
            .summarize(self.policy.age_threshold_days, current_timestamp_ms());
        tracing::info!(
            files = count,
            stale_files = summary.stale_files,
            stale_bytes = summary.stale_bytes,
            "scan complete"
        );
        Ok(summary)
    }

    /// Plan a job over the current catalog, skipping files that are claimed
    /// or already archived.
    pub fn plan(&self, policy: &ArchivePolicy) -> Result<PlanOutcome, PipelineError> {
        plan_excluding(
            &self.catalog,
            policy,
            current_timestamp_ms(),
            &self.ledger.unavailable_files(),
        )
    }

    /// Plan and admit a job without starting it.
    pub fn admit(&self, policy: &ArchivePolicy) -> Result<SubmitOutcome, PipelineError> {
        let Some(plan) = self.plan(policy)?.into_plan() else {
            tracing::info!("nothing to archive");
            return Ok(SubmitOutcome::NothingToArchive);
        };

        let job = self.ledger.admit(&plan)?;
        emit(
            &self.events,
            PipelineEvent::JobAdmitted {
                job_id: job.id.clone(),
                file_count: job.file_ids.len(),
                planned_bytes: job.planned_bytes(),
            },
        );
        Ok(SubmitOutcome::Submitted(job.id))
    }

    /// Plan, admit and start a job in the background.
    pub fn submit(self: &Arc<Self>, policy: &ArchivePolicy) -> Result<SubmitOutcome, PipelineError> {
        let outcome = self.admit(policy)?;
        if let SubmitOutcome::Submitted(job_id) = &outcome {
            self.spawn_execute(job_id.clone());
        }
        Ok(outcome)
    }

    fn spawn_execute(self: &Arc<Self>, job_id: JobId) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.execute(&job_id).await {
                Ok(_) => {}
                Err(PipelineError::JobActive(_)) => {
                    tracing::debug!(job_id = %job_id, "job already running");
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "job stopped"),
            }
        })
    }

    /// Snapshot of one job.
    pub fn status(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        self.ledger
            .get(job_id)
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<ArchiveJob> {
        self.ledger.query(filter)
    }

    pub fn archives(&self) -> ArchiveListing {
        ArchiveListing::from_jobs(&self.ledger.query(&JobFilter::all()))
    }

    /// Run a job from its current state until it completes, fails or is
    /// cancelled. Returns the final snapshot; a stage failure is returned as
    /// the error after it has been recorded on the job.
    pub async fn execute(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let cancel = {
            let mut running = self.running();
            if running.contains_key(job_id) {
                return Err(PipelineError::JobActive(job_id.to_string()));
            }
            let cancel = CancelFlag::new();
            running.insert(job_id.to_string(), cancel.clone());
            cancel
        };

        let result = match self.job_slots.clone().acquire_owned().await {
            Ok(_permit) => self.run_stages(job_id, &cancel).await,
            Err(_) => Err(PipelineError::Transient("job pool closed".to_string())),
        };

        let result = match result {
            Ok(job) => Ok(job),
            Err(err) => Err(self.record_failure(job_id, err)),
        };
        self.running().remove(job_id);
        result
    }

    /// Commit a transition and announce it.
    fn step(
        &self,
        job: &ArchiveJob,
        to: JobState,
        metadata: TransitionMetadata,
    ) -> Result<ArchiveJob, PipelineError> {
        let next = self.ledger.transition(&job.id, to, metadata)?;
        emit(
            &self.events,
            PipelineEvent::StateChanged {
                job_id: job.id.clone(),
                from: job.state,
                to,
            },
        );
        Ok(next)
    }

    async fn run_stages(&self, job_id: &str, cancel: &CancelFlag) -> Result<ArchiveJob, PipelineError> {
        let mut job = self.status(job_id)?;
        let destination = job.destination(&self.destination_prefix);
        let mut built: Option<Arc<ArchiveBlob>> = None;

        loop {
            if job.is_terminal() {
                return Ok(job);
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            job = match job.state {
                JobState::Planned => self.step(&job, JobState::Building, TransitionMetadata::none())?,
                JobState::Building => {
                    // A job that has failed before is rebuilt without the
                    // files that disappeared in the meantime.
                    let mode = if job.retry_count > 0 {
                        BuildMode::DropVanished
                    } else {
                        BuildMode::Strict
                    };
                    let output = self.build_archive(&job, mode, cancel).await?;
                    if !output.dropped.is_empty() {
                        job = self.ledger.drop_files(&job.id, output.dropped.clone())?;
                        emit(
                            &self.events,
                            PipelineEvent::FilesDropped {
                                job_id: job.id.clone(),
                                file_ids: output.dropped,
                            },
                        );
                    }
                    self.staging.store(&job.id, &output.blob)?;
                    let metadata = TransitionMetadata::built(output.blob.checksum(), output.blob.len());
                    built = Some(Arc::new(output.blob));
                    self.step(&job, JobState::Built, metadata)?
                }
                JobState::Built => {
                    self.step(&job, JobState::Uploading, TransitionMetadata::uploading(&destination))?
                }
                JobState::Uploading => {
                    let blob = match built.take() {
                        Some(blob) => blob,
                        None => self.load_staged(&job)?,
                    };
                    self.uploader
                        .upload_chunks(&job.id, blob, &destination, cancel)
                        .await?;
                    self.step(&job, JobState::Verifying, TransitionMetadata::none())?
                }
                JobState::Verifying => {
                    let (Some(checksum), Some(size)) = (job.archive_checksum.clone(), job.archive_size) else {
                        return Err(PipelineError::StagingCorrupt(format!(
                            "job {} reached verification without an archive checksum",
                            job.id
                        )));
                    };
                    let receipt = self
                        .uploader
                        .verify(&job.id, &destination, &checksum, size)
                        .await?;
                    let done = self.step(
                        &job,
                        JobState::Completed,
                        TransitionMetadata::completed(receipt.remote_path, receipt.remote_checksum),
                    )?;
                    if let Err(e) = self.staging.remove(&done.id) {
                        tracing::warn!(job_id = %done.id, error = %e, "could not remove staged archive");
                    }
                    tracing::info!(job_id = %done.id, files = done.file_ids.len(), "job completed");
                    done
                }
                JobState::Completed | JobState::Failed | JobState::Cancelled => return Ok(job),
            };
        }
    }

    async fn build_archive(
        &self,
        job: &ArchiveJob,
        mode: BuildMode,
        cancel: &CancelFlag,
    ) -> Result<BuildOutput, PipelineError> {
        let _permit = self
            .build_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Transient("build pool closed".to_string()))?;

        let job = job.clone();
        let source = self.source.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || builder::build(&job, source.as_ref(), mode, &cancel))
            .await
            .map_err(|e| PipelineError::Transient(format!("build task failed: {}", e)))?
    }

    fn load_staged(&self, job: &ArchiveJob) -> Result<Arc<ArchiveBlob>, PipelineError> {
        let checksum = job.archive_checksum.as_deref().unwrap_or_default();
        match self.staging.load(&job.id, checksum)? {
            Some(blob) => Ok(Arc::new(blob)),
            None => Err(PipelineError::StagingCorrupt(format!(
                "staged archive for job {} is missing",
                job.id
            ))),
        }
    }

    /// Record a stage failure on the job and hand the error back.
    ///
    /// Cancellation ends the job as Cancelled. Anything else fails it with
    /// the re-entry point a retry will use: a lost staged archive or a build
    /// failure re-enters at Planned, upload and verification failures at
    /// Built.
    fn record_failure(&self, job_id: &str, err: PipelineError) -> PipelineError {
        let Some(job) = self.ledger.get(job_id) else {
            return err;
        };

        let (to, metadata) = match &err {
            PipelineError::Cancelled => (JobState::Cancelled, TransitionMetadata::cancelled()),
            PipelineError::StagingCorrupt(_) => {
                (JobState::Failed, TransitionMetadata::failed(&err, JobState::Planned))
            }
            _ if job.has_built_archive() => {
                (JobState::Failed, TransitionMetadata::failed(&err, JobState::Built))
            }
            _ => (JobState::Failed, TransitionMetadata::failed(&err, JobState::Planned)),
        };

        // Left active and idle; the next resume_in_flight pass picks it up.
        if !job.state.can_transition_to(to) {
            tracing::error!(job_id, state = %job.state, error = %err, "cannot record failure in current state");
            return err;
        }

        match self.step(&job, to, metadata) {
            Ok(_) => {
                if to == JobState::Cancelled {
                    self.discard_artifacts(job_id);
                }
                tracing::warn!(job_id, state = %to, class = %err.class(), error = %err, "job stopped");
            }
            Err(record_err) => {
                tracing::error!(job_id, error = %err, record_error = %record_err, "could not record job failure");
            }
        }
        err
    }

    fn discard_artifacts(&self, job_id: &str) {
        if let Err(e) = self.staging.remove(job_id) {
            tracing::warn!(job_id, error = %e, "could not remove staged archive");
        }
        if let Err(e) = self.uploader.checkpoints().remove(job_id) {
            tracing::warn!(job_id, error = %e, "could not remove upload checkpoint");
        }
    }

    /// Cancel a job. A running job stops at its next chunk or file boundary;
    /// an idle one is cancelled immediately.
    pub fn cancel(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let running = self.running();
        let job = self.status(job_id)?;
        if job.is_terminal() {
            return Err(PipelineError::AlreadyTerminal(job_id.to_string()));
        }

        if let Some(flag) = running.get(job_id) {
            tracing::info!(job_id, state = %job.state, "cancellation requested");
            flag.cancel();
            return Ok(job);
        }

        let cancelled = self.step(&job, JobState::Cancelled, TransitionMetadata::cancelled())?;
        drop(running);
        self.discard_artifacts(job_id);
        tracing::info!(job_id, "job cancelled");
        Ok(cancelled)
    }

    /// Re-enter a failed job at its recorded stage, without starting it.
    pub fn reenter(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let job = self.ledger.retry(job_id)?;
        emit(
            &self.events,
            PipelineEvent::StateChanged {
                job_id: job.id.clone(),
                from: JobState::Failed,
                to: job.state,
            },
        );
        tracing::info!(job_id, state = %job.state, retry = job.retry_count, "job re-entered");
        Ok(job)
    }

    /// Retry a failed job in the background.
    pub fn retry(self: &Arc<Self>, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let job = self.reenter(job_id)?;
        self.spawn_execute(job.id.clone());
        Ok(job)
    }

    /// Restart every job left mid-flight by a previous process.
    pub fn resume_in_flight(self: &Arc<Self>) -> Vec<JobId> {
        let jobs: Vec<JobId> = self
            .ledger
            .in_flight()
            .into_iter()
            .map(|job| job.id)
            .filter(|id| !self.running().contains_key(id))
            .collect();
        for job_id in &jobs {
            tracing::info!(job_id = %job_id, "resuming job");
            self.spawn_execute(job_id.clone());
        }
        jobs
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let mut rx = self.events.subscribe();
        loop {
            let job = self.status(job_id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.status(job_id),
            }
        }
    }

    /// Delete the originals of a verified job.
    pub async fn reclaim_originals(&self, job_id: &str) -> Result<ReclaimReport, PipelineError> {
        let ledger = self.ledger.clone();
        let source = self.source.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || reclaim_originals(&ledger, source.as_ref(), &job_id))
            .await
            .map_err(|e| PipelineError::Transient(format!("reclaim task failed: {}", e)))?
    }

    /// Remove a terminal job and its local artifacts.
    pub fn purge(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        let job = self.ledger.purge(job_id)?;
        self.discard_artifacts(job_id);
        tracing::info!(job_id, "job purged");
        Ok(job)
    }

    /// Keep the shared metrics in step with pipeline events.
    ///
    /// The task holds the ledger weakly and ends once the orchestrator is
    /// gone.
    pub fn spawn_metrics_recorder(&self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let ledger = Arc::downgrade(&self.ledger);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "metrics recorder lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(ledger) = ledger.upgrade() else {
                    break;
                };
                let job = ledger.get(event.job_id());
                drop(ledger);
                record_event(&mut *metrics.write().await, &event, job.as_ref());
            }
        })
    }
}
