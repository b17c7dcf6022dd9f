//! Metrics for the archive pipeline
//!
//! Snapshot of active jobs, aggregate counters, device storage and
//! connectivity, serialized as JSON by the status server.

use crate::events::PipelineEvent;
use crate::job::{current_timestamp_ms, ArchiveJob, JobState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub state: String,
    pub file_count: usize,
    pub planned_bytes: u64,
    pub bytes_acked: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Upload parked waiting for connectivity
    pub suspended: bool,
}

impl JobMetrics {
    pub fn from_job(job: &ArchiveJob) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state.to_string(),
            file_count: job.file_ids.len(),
            planned_bytes: job.planned_bytes(),
            bytes_acked: 0,
            total_bytes: job.archive_size.unwrap_or(0),
            retry_count: job.retry_count,
            last_error: job.last_error.as_ref().map(|e| e.to_string()),
            suspended: false,
        }
    }
}

/// Device storage for the volume holding the state directory
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageMetrics {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Jobs that are not yet terminal
    pub jobs: Vec<JobMetrics>,
    pub storage: StorageMetrics,
    pub online: bool,
    pub active_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub total_bytes_uploaded: u64,
}

/// Shared metrics state for concurrent access across pipeline components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Fold one pipeline event into the snapshot.
///
/// `job` is the ledger's view of the event's job after the event, or `None`
/// if it has been purged.
pub fn record_event(snapshot: &mut MetricsSnapshot, event: &PipelineEvent, job: Option<&ArchiveJob>) {
    match event {
        PipelineEvent::StateChanged { to, .. } => match to {
            JobState::Completed => {
                snapshot.completed_jobs += 1;
                snapshot.total_bytes_uploaded += job.and_then(|j| j.archive_size).unwrap_or(0);
            }
            JobState::Failed => snapshot.failed_jobs += 1,
            JobState::Cancelled => snapshot.cancelled_jobs += 1,
            _ => {}
        },
        PipelineEvent::UploadProgress {
            job_id,
            bytes_acked,
            total_bytes,
            ..
        } => {
            if let Some(m) = snapshot.jobs.iter_mut().find(|m| &m.id == job_id) {
                m.bytes_acked = *bytes_acked;
                m.total_bytes = *total_bytes;
            }
        }
        PipelineEvent::Suspended { job_id } | PipelineEvent::Resumed { job_id } => {
            let suspended = matches!(event, PipelineEvent::Suspended { .. });
            if let Some(m) = snapshot.jobs.iter_mut().find(|m| &m.id == job_id) {
                m.suspended = suspended;
            }
        }
        PipelineEvent::JobAdmitted { .. } | PipelineEvent::FilesDropped { .. } => {}
    }

    let job_id = event.job_id();
    match job {
        Some(job) if job.is_active() => {
            let mut fresh = JobMetrics::from_job(job);
            match snapshot.jobs.iter_mut().find(|m| m.id == job_id) {
                Some(existing) => {
                    fresh.bytes_acked = existing.bytes_acked;
                    fresh.total_bytes = fresh.total_bytes.max(existing.total_bytes);
                    fresh.suspended = existing.suspended;
                    *existing = fresh;
                }
                None => snapshot.jobs.push(fresh),
            }
        }
        _ => snapshot.jobs.retain(|m| m.id != job_id),
    }

    snapshot.active_jobs = snapshot.jobs.len();
    snapshot.timestamp_unix_ms = current_timestamp_ms();
}

/// Collects storage figures for the disk holding `path` using sysinfo
///
/// Picks the disk with the longest mount point that prefixes `path`.
pub fn collect_storage_metrics(path: &Path) -> StorageMetrics {
    use sysinfo::Disks;

    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| StorageMetrics {
            mount_point: disk.mount_point().display().to_string(),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
        .unwrap_or_default()
}
