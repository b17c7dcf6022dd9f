//! Archive ledger: the durable record of every archive job.
//!
//! All writes are JSON events appended to `ledger.jsonl` and fsynced before
//! they are applied in memory; opening the ledger replays the log. Live
//! updates and replay share one `apply` path, so the state after a restart is
//! exactly the state before it.
//!
//! The ledger also owns the `FileId -> JobId` claim index. Checking claims
//! and recording the event happen under one lock, which makes admission (and
//! retry, which re-claims) a single atomic check-and-claim.

use crate::error::{JobError, PipelineError};
use crate::job::{create_job, current_timestamp_ms, ArchiveJob, FileId, JobId, JobState};
use crate::planner::PlanResult;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const LOCK_FILE: &str = "ledger.lock";

/// Data attached to a state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_from: Option<JobState>,
}

impl TransitionMetadata {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn built(archive_checksum: impl Into<String>, archive_size: u64) -> Self {
        Self {
            archive_checksum: Some(archive_checksum.into()),
            archive_size: Some(archive_size),
            ..Self::default()
        }
    }

    pub fn uploading(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: Some(remote_path.into()),
            ..Self::default()
        }
    }

    pub fn completed(remote_path: impl Into<String>, remote_checksum: impl Into<String>) -> Self {
        Self {
            remote_path: Some(remote_path.into()),
            remote_checksum: Some(remote_checksum.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: &PipelineError, retry_from: JobState) -> Self {
        Self {
            error: Some(error.to_job_error()),
            retry_from: Some(retry_from),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            error: Some(PipelineError::Cancelled.to_job_error()),
            ..Self::default()
        }
    }
}

/// One line of the ledger log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    JobCreated {
        job: ArchiveJob,
    },
    Transitioned {
        job_id: JobId,
        from: JobState,
        to: JobState,
        at: i64,
        #[serde(default)]
        metadata: TransitionMetadata,
    },
    FilesDropped {
        job_id: JobId,
        file_ids: Vec<FileId>,
        at: i64,
    },
    OriginalsReclaimed {
        job_id: JobId,
        at: i64,
    },
    Purged {
        job_id: JobId,
        at: i64,
    },
}

impl LedgerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            LedgerEvent::JobCreated { job } => &job.id,
            LedgerEvent::Transitioned { job_id, .. }
            | LedgerEvent::FilesDropped { job_id, .. }
            | LedgerEvent::OriginalsReclaimed { job_id, .. }
            | LedgerEvent::Purged { job_id, .. } => job_id,
        }
    }
}

/// Selects jobs in `ArchiveLedger::query`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Only jobs in one of these states; `None` means any state.
    pub states: Option<Vec<JobState>>,
    /// Only jobs containing this file.
    pub file_id: Option<FileId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active() -> Self {
        Self::in_states([
            JobState::Planned,
            JobState::Building,
            JobState::Built,
            JobState::Uploading,
            JobState::Verifying,
        ])
    }

    pub fn in_states(states: impl IntoIterator<Item = JobState>) -> Self {
        Self {
            states: Some(states.into_iter().collect()),
            file_id: None,
        }
    }

    pub fn containing(mut self, file_id: impl Into<FileId>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    pub fn matches(&self, job: &ArchiveJob) -> bool {
        let state_ok = self
            .states
            .as_ref()
            .map_or(true, |states| states.contains(&job.state));
        let file_ok = self
            .file_id
            .as_ref()
            .map_or(true, |id| job.file_ids.contains(id));
        state_ok && file_ok
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    jobs: BTreeMap<JobId, ArchiveJob>,
    claims: HashMap<FileId, JobId>,
}

impl LedgerState {
    fn job(&self, job_id: &str) -> Result<&ArchiveJob, PipelineError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    fn check_unclaimed<'a>(
        &self,
        job_id: &str,
        files: impl IntoIterator<Item = &'a FileId>,
    ) -> Result<(), PipelineError> {
        for file_id in files {
            if let Some(owner) = self.claims.get(file_id) {
                if owner != job_id {
                    return Err(PipelineError::ConflictingFile {
                        file_id: file_id.clone(),
                        job_id: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate an event against the current state without changing it.
    fn check(&self, event: &LedgerEvent) -> Result<(), PipelineError> {
        match event {
            LedgerEvent::JobCreated { job } => {
                if self.jobs.contains_key(&job.id) {
                    return Err(PipelineError::InvalidMetadata(format!(
                        "job {} already exists",
                        job.id
                    )));
                }
                if job.file_ids.is_empty() {
                    return Err(PipelineError::InvalidMetadata(
                        "a job needs at least one file".to_string(),
                    ));
                }
                self.check_unclaimed(&job.id, &job.file_ids)
            }
            LedgerEvent::Transitioned {
                job_id,
                from,
                to,
                metadata,
                ..
            } => {
                let job = self.job(job_id)?;
                if job.state != *from {
                    return Err(PipelineError::InvalidTransition {
                        job_id: job_id.clone(),
                        from: job.state,
                        to: *to,
                    });
                }
                if *to == JobState::Cancelled && from.is_terminal() {
                    return Err(PipelineError::AlreadyTerminal(job_id.clone()));
                }
                if !from.can_transition_to(*to) {
                    return Err(PipelineError::InvalidTransition {
                        job_id: job_id.clone(),
                        from: *from,
                        to: *to,
                    });
                }
                if *from == JobState::Failed {
                    let reentry = job.retry_from.unwrap_or(JobState::Planned);
                    if *to != reentry {
                        return Err(PipelineError::InvalidTransition {
                            job_id: job_id.clone(),
                            from: *from,
                            to: *to,
                        });
                    }
                    self.check_unclaimed(job_id, &job.file_ids)?;
                }
                check_metadata(job, *from, *to, metadata)
            }
            LedgerEvent::FilesDropped {
                job_id, file_ids, ..
            } => {
                let job = self.job(job_id)?;
                if job.is_terminal() {
                    return Err(PipelineError::AlreadyTerminal(job_id.clone()));
                }
                match file_ids.iter().find(|id| !job.file_ids.contains(*id)) {
                    Some(stray) => Err(PipelineError::InvalidMetadata(format!(
                        "file {} is not part of job {}",
                        stray, job_id
                    ))),
                    None => Ok(()),
                }
            }
            LedgerEvent::OriginalsReclaimed { job_id, .. } => {
                let job = self.job(job_id)?;
                if job.originals_deletable() {
                    Ok(())
                } else {
                    Err(PipelineError::NotReclaimable {
                        job_id: job_id.clone(),
                        reason: format!("job is {}, not verified complete", job.state),
                    })
                }
            }
            LedgerEvent::Purged { job_id, .. } => {
                if self.job(job_id)?.is_terminal() {
                    Ok(())
                } else {
                    Err(PipelineError::JobActive(job_id.clone()))
                }
            }
        }
    }

    fn claim(&mut self, job: &ArchiveJob) {
        for file_id in &job.file_ids {
            self.claims.insert(file_id.clone(), job.id.clone());
        }
    }

    fn release<'a>(&mut self, job_id: &str, files: impl IntoIterator<Item = &'a FileId>) {
        for file_id in files {
            if self.claims.get(file_id).map_or(false, |owner| owner == job_id) {
                self.claims.remove(file_id);
            }
        }
    }

    /// Apply a validated event. Also used verbatim during replay.
    fn apply(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::JobCreated { job } => {
                self.claim(&job);
                self.jobs.insert(job.id.clone(), job);
            }
            LedgerEvent::Transitioned {
                job_id,
                from,
                to,
                at,
                metadata,
            } => {
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                job.state = to;
                job.updated_at = at.max(job.updated_at);

                if from == JobState::Failed {
                    job.retry_count += 1;
                    job.interrupted_at = None;
                    job.retry_from = None;
                    job.last_error = None;
                    if to == JobState::Planned {
                        job.archive_checksum = None;
                        job.archive_size = None;
                        job.remote_path = None;
                        job.remote_checksum = None;
                    }
                }

                match to {
                    JobState::Built => {
                        if from != JobState::Failed {
                            job.archive_checksum = metadata.archive_checksum;
                            job.archive_size = metadata.archive_size;
                        }
                    }
                    JobState::Uploading => {
                        if metadata.remote_path.is_some() {
                            job.remote_path = metadata.remote_path;
                        }
                    }
                    JobState::Completed => {
                        job.remote_path = metadata.remote_path;
                        job.remote_checksum = metadata.remote_checksum;
                    }
                    JobState::Failed => {
                        job.interrupted_at = Some(from);
                        job.last_error = metadata.error;
                        job.retry_from = Some(metadata.retry_from.unwrap_or(JobState::Planned));
                    }
                    JobState::Cancelled => {
                        job.interrupted_at = Some(from);
                        job.last_error = metadata.error;
                        job.retry_from = None;
                    }
                    JobState::Planned | JobState::Building | JobState::Verifying => {}
                }

                let job = job.clone();
                if to.is_terminal() {
                    self.release(&job.id, &job.file_ids);
                } else if from == JobState::Failed {
                    self.claim(&job);
                }
            }
            LedgerEvent::FilesDropped {
                job_id,
                file_ids,
                at,
            } => {
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                for file_id in &file_ids {
                    job.file_ids.remove(file_id);
                    job.files.remove(file_id);
                    job.dropped_file_ids.insert(file_id.clone());
                }
                job.updated_at = at.max(job.updated_at);
                self.release(&job_id, &file_ids);
            }
            LedgerEvent::OriginalsReclaimed { job_id, at } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.reclaimed_at = Some(at);
                }
            }
            LedgerEvent::Purged { job_id, .. } => {
                if let Some(job) = self.jobs.remove(&job_id) {
                    self.release(&job_id, &job.file_ids);
                }
            }
        }
    }
}

/// Keep the archive/remote fields consistent with the lifecycle: the
/// archive checksum appears exactly when the job reaches Built, and a job
/// only completes with a remote checksum equal to its archive checksum.
fn check_metadata(
    job: &ArchiveJob,
    from: JobState,
    to: JobState,
    metadata: &TransitionMetadata,
) -> Result<(), PipelineError> {
    let invalid = |what: &str| {
        Err(PipelineError::InvalidMetadata(format!(
            "{} -> {} for job {}: {}",
            from, to, job.id, what
        )))
    };

    let is_built = to == JobState::Built && from != JobState::Failed;
    if is_built != metadata.archive_checksum.is_some()
        || is_built != metadata.archive_size.is_some()
    {
        return invalid("archive checksum and size are set exactly when the archive is built");
    }

    if to == JobState::Completed {
        let (Some(_), Some(remote)) = (&metadata.remote_path, &metadata.remote_checksum) else {
            return invalid("completion needs the remote path and checksum");
        };
        if job.archive_checksum.as_deref() != Some(remote.as_str()) {
            return Err(PipelineError::IntegrityMismatch {
                expected: job.archive_checksum.clone().unwrap_or_default(),
                actual: remote.clone(),
            });
        }
    } else {
        if metadata.remote_checksum.is_some() {
            return invalid("remote checksum is only recorded on completion");
        }
        if metadata.remote_path.is_some() && to != JobState::Uploading {
            return invalid("remote path is only recorded when uploading or completing");
        }
    }

    if metadata.error.is_some() && !matches!(to, JobState::Failed | JobState::Cancelled) {
        return invalid("errors are only recorded on failure or cancellation");
    }

    match (to, metadata.retry_from) {
        (_, None) => Ok(()),
        (JobState::Failed, Some(JobState::Planned)) => Ok(()),
        (JobState::Failed, Some(JobState::Built)) if job.has_built_archive() => Ok(()),
        _ => invalid("retry may only re-enter at Planned, or at Built once an archive exists"),
    }
}

/// The event log as the ledger writes it.
pub(crate) trait LogFile: Write + Send {
    fn size(&self) -> io::Result<u64>;
    fn rollback(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn rollback(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append one record and make it durable, or truncate the log back to its
/// previous length.
fn append_record(log: &mut dyn LogFile, line: &[u8]) -> Result<(), AppendError> {
    let len = log.size().map_err(AppendError::Failed)?;
    let written = log
        .write_all(line)
        .and_then(|()| log.flush())
        .and_then(|()| log.sync());
    match written {
        Ok(()) => Ok(()),
        Err(e) => match log.rollback(len).and_then(|()| log.sync()) {
            Ok(()) => Err(AppendError::Failed(e)),
            Err(undo) => {
                tracing::error!(error = %e, rollback = %undo, "ledger log left with a partial record");
                Err(AppendError::Torn(e))
            }
        },
    }
}

enum AppendError {
    /// Nothing was recorded.
    Failed(io::Error),
    /// The log may end in a partial record.
    Torn(io::Error),
}

struct LedgerInner {
    log: Box<dyn LogFile>,
    state: LedgerState,
    /// Set when a failed write could not be rolled back; no further
    /// commits until the ledger is reopened and replayed.
    poisoned: bool,
}

/// Durable job store shared by every pipeline component.
pub struct ArchiveLedger {
    dir: PathBuf,
    inner: Mutex<LedgerInner>,
    _lock: File,
}

impl std::fmt::Debug for ArchiveLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveLedger")
            .field("dir", &self.dir)
            .finish()
    }
}

/// Rebuild state from log content. Returns the state and the length of the
/// valid prefix; a final line without its newline is a torn write and is
/// dropped.
fn replay(content: &str) -> Result<(LedgerState, usize, usize), PipelineError> {
    let mut state = LedgerState::default();
    let mut valid_len = 0;
    let mut events = 0;

    for line in content.split_inclusive('\n') {
        if !line.ends_with('\n') {
            tracing::warn!(bytes = line.len(), "discarding torn ledger record");
            break;
        }
        valid_len += line.len();
        if line.trim().is_empty() {
            continue;
        }
        let event: LedgerEvent = serde_json::from_str(line)?;
        state.apply(event);
        events += 1;
    }

    Ok((state, valid_len, events))
}

impl ArchiveLedger {
    /// Open (or create) the ledger in `dir`, taking an exclusive lock and
    /// replaying the event log.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| PipelineError::LedgerLocked(dir.display().to_string()))?;

        let path = dir.join(LEDGER_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (state, valid_len, events) = replay(&content)?;

        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        if valid_len < content.len() {
            log.set_len(valid_len as u64)?;
            log.sync_all()?;
        }

        tracing::info!(
            path = %path.display(),
            events,
            jobs = state.jobs.len(),
            "ledger opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(LedgerInner {
                log: Box::new(log),
                state,
                poisoned: false,
            }),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    pub(crate) fn replace_log(&self, log: Box<dyn LogFile>) {
        self.lock().log = log;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build an event from the current state, validate it, persist it, then
    /// apply it. Returns the affected job as it stands afterwards (or, for a
    /// purge, as it stood before).
    fn commit<F>(&self, make: F) -> Result<Option<ArchiveJob>, PipelineError>
    where
        F: FnOnce(&LedgerState) -> Result<LedgerEvent, PipelineError>,
    {
        let mut inner = self.lock();
        let event = make(&inner.state)?;
        inner.state.check(&event)?;

        if inner.poisoned {
            return Err(PipelineError::Io(io::Error::other(
                "ledger log has a partial record; reopen the ledger to recover",
            )));
        }

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let appended = append_record(inner.log.as_mut(), &line);
        match appended {
            Ok(()) => {}
            Err(AppendError::Failed(e)) => return Err(e.into()),
            Err(AppendError::Torn(e)) => {
                inner.poisoned = true;
                return Err(e.into());
            }
        }

        let job_id = event.job_id().to_string();
        let before = inner.state.jobs.get(&job_id).cloned();
        inner.state.apply(event);
        Ok(inner.state.jobs.get(&job_id).cloned().or(before))
    }

    /// Create a job for `plan`, atomically claiming all of its files.
    pub fn admit(&self, plan: &PlanResult) -> Result<ArchiveJob, PipelineError> {
        let job = create_job(plan);
        let job_id = job.id.clone();
        let admitted = self
            .commit(|_| Ok(LedgerEvent::JobCreated { job }))?
            .ok_or(PipelineError::UnknownJob(job_id))?;
        tracing::info!(job_id = %admitted.id, files = admitted.file_ids.len(), "job admitted");
        Ok(admitted)
    }

    /// Move `job_id` to `to`, recording `metadata`.
    pub fn transition(
        &self,
        job_id: &str,
        to: JobState,
        metadata: TransitionMetadata,
    ) -> Result<ArchiveJob, PipelineError> {
        let job = self
            .commit(|state| {
                let job = state.job(job_id)?;
                Ok(LedgerEvent::Transitioned {
                    job_id: job_id.to_string(),
                    from: job.state,
                    to,
                    at: current_timestamp_ms(),
                    metadata,
                })
            })?
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
        tracing::debug!(job_id, state = %job.state, "job transitioned");
        Ok(job)
    }

    /// Re-enter a failed job at the stage recorded when it failed,
    /// re-claiming its files.
    pub fn retry(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        self.commit(|state| {
            let job = state.job(job_id)?;
            let reentry = job.retry_from.unwrap_or(JobState::Planned);
            if job.state != JobState::Failed {
                return Err(PipelineError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.state,
                    to: reentry,
                });
            }
            Ok(LedgerEvent::Transitioned {
                job_id: job_id.to_string(),
                from: JobState::Failed,
                to: reentry,
                at: current_timestamp_ms(),
                metadata: TransitionMetadata::none(),
            })
        })?
        .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    /// Remove files that could not be archived from an active job.
    pub fn drop_files(
        &self,
        job_id: &str,
        file_ids: Vec<FileId>,
    ) -> Result<ArchiveJob, PipelineError> {
        self.commit(|_| {
            Ok(LedgerEvent::FilesDropped {
                job_id: job_id.to_string(),
                file_ids,
                at: current_timestamp_ms(),
            })
        })?
        .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    /// Record that the originals of a verified job were deleted.
    pub fn mark_reclaimed(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        self.commit(|_| {
            Ok(LedgerEvent::OriginalsReclaimed {
                job_id: job_id.to_string(),
                at: current_timestamp_ms(),
            })
        })?
        .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    /// Drop a terminal job from the live view. Returns the purged job.
    pub fn purge(&self, job_id: &str) -> Result<ArchiveJob, PipelineError> {
        self.commit(|_| {
            Ok(LedgerEvent::Purged {
                job_id: job_id.to_string(),
                at: current_timestamp_ms(),
            })
        })?
        .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    pub fn get(&self, job_id: &str) -> Option<ArchiveJob> {
        self.lock().state.jobs.get(job_id).cloned()
    }

    /// Jobs matching `filter`, oldest first.
    pub fn query(&self, filter: &JobFilter) -> Vec<ArchiveJob> {
        let mut jobs: Vec<ArchiveJob> = self
            .lock()
            .state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Jobs left mid-flight, to be resumed after a restart.
    pub fn in_flight(&self) -> Vec<ArchiveJob> {
        self.query(&JobFilter::active())
    }

    /// Completed jobs whose originals may be deleted.
    pub fn eligible_for_deletion(&self) -> Vec<ArchiveJob> {
        self.query(&JobFilter::in_states([JobState::Completed]))
            .into_iter()
            .filter(|job| job.originals_deletable() && job.reclaimed_at.is_none())
            .collect()
    }

    /// Active job currently holding `file_id`.
    pub fn claimed_by(&self, file_id: &str) -> Option<JobId> {
        self.lock().state.claims.get(file_id).cloned()
    }

    /// Files the planner should not pick again: claimed by an active job or
    /// already archived by a completed one.
    pub fn unavailable_files(&self) -> HashSet<FileId> {
        let inner = self.lock();
        let mut files: HashSet<FileId> = inner.state.claims.keys().cloned().collect();
        for job in inner.state.jobs.values() {
            if job.state == JobState::Completed {
                files.extend(job.file_ids.iter().cloned());
            }
        }
        files
    }
}
