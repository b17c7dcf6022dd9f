//! Media Archive Pipeline
//!
//! Selects stale media files, packs them into checksummed archives, uploads
//! them in resumable chunks and only lets originals go once the remote copy
//! is verified. Every job transition is recorded in a durable ledger.

pub mod archives;
pub mod builder;
pub mod catalog;
pub mod concurrency;
pub mod connectivity;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod events;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod planner;
pub mod reclaim;
pub mod remote;
pub mod source;
pub mod startup;
pub mod upload;

#[cfg(test)]
mod testing;

pub use media_archive_config as config;
pub use media_archive_config::Config;

pub use archives::{ArchiveListing, ArchiveSummary, UploadStatus};
pub use builder::{build, ArchiveBlob, BuildMode, BuildOutput, StagingArea};
pub use catalog::{
    format_bytes, FileCatalog, FilePredicate, MediaFile, MediaKind, RawFileRecord, ScanSummary,
};
pub use concurrency::WorkerPlan;
pub use connectivity::ConnectivityMonitor;
pub use credentials::{CredentialProvider, SessionContext, SessionCredentials};
pub use daemon::{build_collaborators, Daemon, DaemonError, ScanReport};
pub use error::{ErrorClass, JobError, PipelineError};
pub use events::PipelineEvent;
pub use job::{ArchiveJob, CancelFlag, FileId, JobId, JobState};
pub use ledger::{ArchiveLedger, JobFilter, TransitionMetadata};
pub use metrics::{new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics, StorageMetrics};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError, ServerState};
pub use orchestrator::{Collaborators, PipelineOrchestrator, SubmitOutcome};
pub use planner::{plan, plan_excluding, validate_policy, PlanOutcome, PlanResult};
pub use reclaim::{reclaim_originals, ReclaimReport};
pub use remote::{DirectoryStore, HttpStore, RemoteError, RemoteReceipt, RemoteStore};
pub use source::{FileSource, LocalFileSource};
pub use startup::{run_startup_checks, StartupError};
pub use upload::{UploadCoordinator, UploadSettings};
