//! Error taxonomy shared by every pipeline component.

use crate::job::{FileId, JobId, JobState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Coarse category deciding how a failure is handled and surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input, rejected before any state change.
    Validation,
    /// A file is already claimed by another active job.
    Conflict,
    /// Checksum mismatch; originals are preserved.
    Integrity,
    /// Network or IO hiccup, retried inside the component.
    Transient,
    /// Requires caller action (re-auth, retry, investigation).
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Integrity => write!(f, "integrity"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid file listing: {0}")]
    InvalidListing(String),

    #[error("Invalid archive policy: {0}")]
    InvalidPolicy(String),

    #[error("File {file_id} is already claimed by active job {job_id}")]
    ConflictingFile { file_id: FileId, job_id: JobId },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("Job {0} is still active")]
    JobActive(JobId),

    #[error("Invalid transition metadata: {0}")]
    InvalidMetadata(String),

    #[error("Source file {file_id} is unreadable: {reason}")]
    SourceUnreadable { file_id: FileId, reason: String },

    #[error("Remote checksum {actual} does not match archive checksum {expected}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Remote credentials expired; re-authentication required")]
    AuthExpired,

    #[error("Remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Upload suspended longer than {0:?} waiting for connectivity")]
    SuspensionTimeout(Duration),

    #[error("Originals of job {job_id} cannot be deleted: {reason}")]
    NotReclaimable { job_id: JobId, reason: String },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Staged archive is corrupt: {0}")]
    StagingCorrupt(String),

    #[error("Ledger at {0} is locked by another process")]
    LedgerLocked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Map the error onto the pipeline's handling taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidListing(_)
            | PipelineError::InvalidPolicy(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::UnknownJob(_)
            | PipelineError::AlreadyTerminal(_)
            | PipelineError::JobActive(_)
            | PipelineError::InvalidMetadata(_)
            | PipelineError::NotReclaimable { .. } => ErrorClass::Validation,
            PipelineError::ConflictingFile { .. } => ErrorClass::Conflict,
            PipelineError::IntegrityMismatch { .. } | PipelineError::StagingCorrupt(_) => {
                ErrorClass::Integrity
            }
            PipelineError::Transient(_) => ErrorClass::Transient,
            PipelineError::SourceUnreadable { .. }
            | PipelineError::RetriesExhausted { .. }
            | PipelineError::AuthExpired
            | PipelineError::RemoteRejected(_)
            | PipelineError::SuspensionTimeout(_)
            | PipelineError::Cancelled
            | PipelineError::LedgerLocked(_)
            | PipelineError::Io(_)
            | PipelineError::Serialization(_) => ErrorClass::Fatal,
        }
    }

    /// Snapshot of this error suitable for persisting in the ledger.
    pub fn to_job_error(&self) -> JobError {
        JobError {
            class: self.class(),
            message: self.to_string(),
        }
    }
}

/// Error recorded against a job, surfaced verbatim to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_follow_taxonomy() {
        assert_eq!(
            PipelineError::InvalidListing("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            PipelineError::ConflictingFile {
                file_id: "f1".into(),
                job_id: "j1".into()
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            PipelineError::IntegrityMismatch {
                expected: "aa".into(),
                actual: "bb".into()
            }
            .class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            PipelineError::Transient("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(PipelineError::AuthExpired.class(), ErrorClass::Fatal);
        assert_eq!(
            PipelineError::SourceUnreadable {
                file_id: "f1".into(),
                reason: "gone".into()
            }
            .class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_job_error_keeps_message_verbatim() {
        let err = PipelineError::RetriesExhausted {
            operation: "chunk 3".into(),
            attempts: 5,
            last_error: "connection reset".into(),
        };
        let recorded = err.to_job_error();

        assert_eq!(recorded.class, ErrorClass::Fatal);
        assert_eq!(recorded.message, err.to_string());
        assert_eq!(
            recorded.to_string(),
            "[fatal] chunk 3 failed after 5 attempts: connection reset"
        );
    }
}
