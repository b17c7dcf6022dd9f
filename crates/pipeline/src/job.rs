//! Archive job model and its lifecycle rules.
//!
//! Jobs are owned by the ledger; everything else works on snapshots and asks
//! the ledger to apply transitions.

use crate::error::JobError;
use crate::planner::PlanResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type FileId = String;
pub type JobId = String;

/// State of an archive job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Files selected and claimed, nothing built yet.
    Planned,
    /// Archive container is being assembled.
    Building,
    /// Archive staged locally with a known checksum.
    Built,
    /// Chunks are being transferred.
    Uploading,
    /// Waiting on the remote checksum.
    Verifying,
    /// Remote copy verified.
    Completed,
    /// Stopped on an error; may be retried.
    Failed,
    /// Stopped by the caller.
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Planned
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Planned => "planned",
            JobState::Building => "building",
            JobState::Built => "built",
            JobState::Uploading => "uploading",
            JobState::Verifying => "verifying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Position on the forward chain; `None` for the side exits.
    pub fn rank(&self) -> Option<u8> {
        match self {
            JobState::Planned => Some(0),
            JobState::Building => Some(1),
            JobState::Built => Some(2),
            JobState::Uploading => Some(3),
            JobState::Verifying => Some(4),
            JobState::Completed => Some(5),
            JobState::Failed | JobState::Cancelled => None,
        }
    }

    /// Completed, Failed and Cancelled hold no file claims.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Planned through Verifying.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    ///
    /// Forward steps are one at a time. `Failed` is reachable from the three
    /// working stages, `Cancelled` from anything non-terminal, and a failed
    /// job may re-enter at `Planned` or `Built` through a retry.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        match (*self, to) {
            (Planned, Building)
            | (Building, Built)
            | (Built, Uploading)
            | (Uploading, Verifying)
            | (Verifying, Completed) => true,
            (Building | Uploading | Verifying, Failed) => true,
            (Failed, Planned) | (Failed, Built) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "planned" => Some(JobState::Planned),
            "building" => Some(JobState::Building),
            "built" => Some(JobState::Built),
            "uploading" => Some(JobState::Uploading),
            "verifying" => Some(JobState::Verifying),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

/// Source file as it looked when the job was planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub id: FileId,
    pub path: String,
    pub size_bytes: u64,
}

/// One archive-and-upload unit of work over a fixed file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveJob {
    pub id: JobId,
    pub file_ids: BTreeSet<FileId>,
    /// Planned snapshot of every claimed file, keyed by id.
    pub files: BTreeMap<FileId, PlannedFile>,
    pub state: JobState,
    pub archive_checksum: Option<String>,
    pub archive_size: Option<u64>,
    pub remote_path: Option<String>,
    pub remote_checksum: Option<String>,
    /// Unix timestamp (milliseconds) when the job was admitted.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last transition.
    pub updated_at: i64,
    pub retry_count: u32,
    pub last_error: Option<JobError>,
    /// State left when the job entered Failed or Cancelled.
    pub interrupted_at: Option<JobState>,
    /// Where a retry re-enters the pipeline.
    pub retry_from: Option<JobState>,
    /// Files removed from the job because they vanished before a rebuild.
    #[serde(default)]
    pub dropped_file_ids: BTreeSet<FileId>,
    /// When the originals were deleted after completion.
    #[serde(default)]
    pub reclaimed_at: Option<i64>,
}

impl ArchiveJob {
    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms().max(self.updated_at);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Summed planned size of the files still in the job.
    pub fn planned_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size_bytes).sum()
    }

    /// Stage the job effectively reached, looking through Failed/Cancelled.
    pub fn effective_stage(&self) -> JobState {
        match self.state {
            JobState::Failed | JobState::Cancelled => {
                self.interrupted_at.unwrap_or(JobState::Planned)
            }
            state => state,
        }
    }

    /// True once an archive exists for the job's current file set.
    pub fn has_built_archive(&self) -> bool {
        let built = JobState::Built.rank();
        self.effective_stage().rank() >= built
    }

    /// Originals may only go once the remote copy is verified.
    pub fn originals_deletable(&self) -> bool {
        self.state == JobState::Completed
            && self.archive_checksum.is_some()
            && self.archive_checksum == self.remote_checksum
    }

    /// Human-facing archive file name.
    pub fn archive_name(&self) -> String {
        let short: String = self.id.chars().take(8).collect();
        format!("archive-{}.marc", short)
    }

    /// Remote destination under the given prefix.
    pub fn destination(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}.marc", self.id)
        } else {
            format!("{}/{}.marc", prefix, self.id)
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running job.
///
/// Stages poll it at safe boundaries only (between files, between chunks).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Creates a new job from a plan.
///
/// Generates a UUID for the job id and starts it in `Planned`.
pub fn create_job(plan: &PlanResult) -> ArchiveJob {
    let now = current_timestamp_ms();
    let files: BTreeMap<FileId, PlannedFile> = plan
        .files
        .iter()
        .map(|f| {
            (
                f.id.clone(),
                PlannedFile {
                    id: f.id.clone(),
                    path: f.path.clone(),
                    size_bytes: f.size_bytes,
                },
            )
        })
        .collect();

    ArchiveJob {
        id: Uuid::new_v4().to_string(),
        file_ids: files.keys().cloned().collect(),
        files,
        state: JobState::Planned,
        archive_checksum: None,
        archive_size: None,
        remote_path: None,
        remote_checksum: None,
        created_at: now,
        updated_at: now,
        retry_count: 0,
        last_error: None,
        interrupted_at: None,
        retry_from: None,
        dropped_file_ids: BTreeSet::new(),
        reclaimed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{media_file, plan_of};

    const ALL_STATES: [JobState; 8] = [
        JobState::Planned,
        JobState::Building,
        JobState::Built,
        JobState::Uploading,
        JobState::Verifying,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    #[test]
    fn test_job_state_display_round_trips_through_parse() {
        for state in ALL_STATES {
            assert_eq!(JobState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(JobState::parse("compressing"), None);
    }

    #[test]
    fn test_forward_chain_is_single_step() {
        assert!(JobState::Planned.can_transition_to(JobState::Building));
        assert!(JobState::Building.can_transition_to(JobState::Built));
        assert!(JobState::Built.can_transition_to(JobState::Uploading));
        assert!(JobState::Uploading.can_transition_to(JobState::Verifying));
        assert!(JobState::Verifying.can_transition_to(JobState::Completed));

        assert!(!JobState::Planned.can_transition_to(JobState::Built));
        assert!(!JobState::Built.can_transition_to(JobState::Building));
        assert!(!JobState::Uploading.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_failed_only_from_working_stages() {
        assert!(JobState::Building.can_transition_to(JobState::Failed));
        assert!(JobState::Uploading.can_transition_to(JobState::Failed));
        assert!(JobState::Verifying.can_transition_to(JobState::Failed));
        assert!(!JobState::Planned.can_transition_to(JobState::Failed));
        assert!(!JobState::Built.can_transition_to(JobState::Failed));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_completed_is_never_revisited() {
        for state in ALL_STATES {
            assert!(!JobState::Completed.can_transition_to(state));
        }
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for state in ALL_STATES {
            assert_eq!(
                state.can_transition_to(JobState::Cancelled),
                !state.is_terminal(),
                "cancel from {}",
                state
            );
        }
    }

    #[test]
    fn test_retry_reentry_points() {
        assert!(JobState::Failed.can_transition_to(JobState::Planned));
        assert!(JobState::Failed.can_transition_to(JobState::Built));
        assert!(!JobState::Failed.can_transition_to(JobState::Uploading));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Planned));
    }

    #[test]
    fn test_create_job() {
        let plan = plan_of(vec![
            media_file("b", "/DCIM/b.jpg", 200, 10),
            media_file("a", "/DCIM/a.mp4", 300, 20),
        ]);

        let job = create_job(&plan);

        assert_eq!(job.id.len(), 36);
        assert_eq!(job.state, JobState::Planned);
        assert_eq!(
            job.file_ids.iter().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(job.planned_bytes(), 500);
        assert!(job.archive_checksum.is_none());
        assert_eq!(job.created_at, job.updated_at);
        assert!(!job.has_built_archive());
    }

    #[test]
    fn test_effective_stage_looks_through_failure() {
        let plan = plan_of(vec![media_file("a", "/DCIM/a.mp4", 300, 20)]);
        let mut job = create_job(&plan);
        job.state = JobState::Failed;
        job.interrupted_at = Some(JobState::Uploading);

        assert_eq!(job.effective_stage(), JobState::Uploading);
        assert!(job.has_built_archive());
    }

    #[test]
    fn test_destination_and_name() {
        let plan = plan_of(vec![media_file("a", "/DCIM/a.mp4", 300, 20)]);
        let job = create_job(&plan);

        assert_eq!(
            job.destination("/archives/"),
            format!("archives/{}.marc", job.id)
        );
        assert_eq!(job.destination(""), format!("{}.marc", job.id));
        assert!(job.archive_name().starts_with("archive-"));
    }

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());

        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_originals_deletable_requires_verified_completion() {
        let plan = plan_of(vec![media_file("a", "/DCIM/a.mp4", 300, 20)]);
        let mut job = create_job(&plan);
        job.state = JobState::Completed;
        job.archive_checksum = Some("abc".into());
        job.remote_checksum = Some("abd".into());
        assert!(!job.originals_deletable());

        job.remote_checksum = Some("abc".into());
        assert!(job.originals_deletable());

        job.state = JobState::Verifying;
        assert!(!job.originals_deletable());
    }
}
