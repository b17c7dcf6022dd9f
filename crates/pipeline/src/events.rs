//! Progress events broadcast to in-process subscribers.

use crate::job::{FileId, JobId, JobState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers see `Lagged` past this.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobAdmitted {
        job_id: JobId,
        file_count: usize,
        planned_bytes: u64,
    },
    StateChanged {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    UploadProgress {
        job_id: JobId,
        bytes_acked: u64,
        total_bytes: u64,
        chunks_acked: u32,
        total_chunks: u32,
    },
    /// Upload parked waiting for connectivity.
    Suspended { job_id: JobId },
    Resumed { job_id: JobId },
    FilesDropped {
        job_id: JobId,
        file_ids: Vec<FileId>,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> &str {
        match self {
            PipelineEvent::JobAdmitted { job_id, .. }
            | PipelineEvent::StateChanged { job_id, .. }
            | PipelineEvent::UploadProgress { job_id, .. }
            | PipelineEvent::Suspended { job_id }
            | PipelineEvent::Resumed { job_id }
            | PipelineEvent::FilesDropped { job_id, .. } => job_id,
        }
    }
}

pub type EventSender = broadcast::Sender<PipelineEvent>;

pub fn event_channel() -> EventSender {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Send without caring whether anyone listens.
pub fn emit(events: &EventSender, event: PipelineEvent) {
    let _ = events.send(event);
}
