//! Deleting originals once their archive is verified remotely.
//!
//! Only a job whose remote checksum matched its archive checksum may have its
//! source files removed. Each file is re-checked against its planned size
//! first; a file that changed since planning is not the file that was
//! archived and is left in place.

use crate::builder::{compare_sizes, SizeCheck};
use crate::error::PipelineError;
use crate::job::FileId;
use crate::ledger::ArchiveLedger;
use crate::source::FileSource;
use serde::{Deserialize, Serialize};
use std::io;

/// What a reclaim pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub job_id: String,
    pub removed: Vec<FileId>,
    /// Already gone before the pass.
    pub missing: Vec<FileId>,
    /// Modified since planning, kept.
    pub changed: Vec<FileId>,
    /// Could not be checked or removed, kept.
    pub failed: Vec<FileId>,
    pub bytes_freed: u64,
}

impl ReclaimReport {
    /// Every original was removed, already gone or deliberately kept.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete the originals of a verified job and record it in the ledger.
pub fn reclaim_originals(
    ledger: &ArchiveLedger,
    source: &dyn FileSource,
    job_id: &str,
) -> Result<ReclaimReport, PipelineError> {
    let job = ledger
        .get(job_id)
        .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;

    if !job.originals_deletable() {
        return Err(PipelineError::NotReclaimable {
            job_id: job_id.to_string(),
            reason: format!("job is {} without a verified remote copy", job.state),
        });
    }
    if job.reclaimed_at.is_some() {
        return Err(PipelineError::NotReclaimable {
            job_id: job_id.to_string(),
            reason: "originals were already reclaimed".to_string(),
        });
    }

    let mut report = ReclaimReport {
        job_id: job_id.to_string(),
        ..ReclaimReport::default()
    };

    for file in job.files.values() {
        let size = match source.file_size(&file.path) {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.missing.push(file.id.clone());
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id, file_id = %file.id, error = %e, "could not stat original, keeping it");
                report.failed.push(file.id.clone());
                continue;
            }
        };

        if let SizeCheck::Changed { expected, actual } = compare_sizes(file.size_bytes, size) {
            tracing::warn!(job_id, file_id = %file.id, expected, actual, "original changed since archiving, keeping it");
            report.changed.push(file.id.clone());
            continue;
        }

        match source.remove_file(&file.path) {
            Ok(()) => {
                report.removed.push(file.id.clone());
                report.bytes_freed += size;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing.push(file.id.clone()),
            Err(e) => {
                tracing::warn!(job_id, file_id = %file.id, error = %e, "could not remove original");
                report.failed.push(file.id.clone());
            }
        }
    }

    // Only a full pass is recorded; a partial one can be run again.
    if report.is_complete() {
        ledger.mark_reclaimed(job_id)?;
    }
    tracing::info!(
        job_id,
        removed = report.removed.len(),
        missing = report.missing.len(),
        changed = report.changed.len(),
        failed = report.failed.len(),
        bytes_freed = report.bytes_freed,
        "originals reclaimed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::derive_file_id;
    use crate::job::JobState;
    use crate::ledger::TransitionMetadata;
    use crate::testing::{media_file, plan_of, MemorySource};
    use tempfile::TempDir;

    fn completed_job(ledger: &ArchiveLedger, source: &MemorySource, paths: &[&str]) -> String {
        let files = paths
            .iter()
            .map(|p| media_file(&derive_file_id(p), p, source.file_size(p).unwrap(), 60))
            .collect();
        let job = ledger.admit(&plan_of(files)).unwrap();
        for (to, metadata) in [
            (JobState::Building, TransitionMetadata::none()),
            (JobState::Built, TransitionMetadata::built("cafe", 10)),
            (JobState::Uploading, TransitionMetadata::none()),
            (JobState::Verifying, TransitionMetadata::none()),
            (JobState::Completed, TransitionMetadata::completed("a/x.marc", "cafe")),
        ] {
            ledger.transition(&job.id, to, metadata).unwrap();
        }
        job.id
    }

    #[test]
    fn test_reclaim_removes_unchanged_originals() {
        let dir = TempDir::new().unwrap();
        let ledger = ArchiveLedger::open(dir.path()).unwrap();
        let source = MemorySource::new();
        source.insert("/DCIM/a.jpg", vec![1; 10], 60);
        source.insert("/DCIM/b.jpg", vec![2; 20], 60);
        source.insert("/DCIM/c.jpg", vec![3; 30], 60);
        let job_id = completed_job(&ledger, &source, &["/DCIM/a.jpg", "/DCIM/b.jpg", "/DCIM/c.jpg"]);

        source.remove("/DCIM/b.jpg");
        source.set_bytes("/DCIM/c.jpg", vec![3; 31]);

        let report = reclaim_originals(&ledger, &source, &job_id).unwrap();

        assert_eq!(report.removed, vec![derive_file_id("/DCIM/a.jpg")]);
        assert_eq!(report.missing, vec![derive_file_id("/DCIM/b.jpg")]);
        assert_eq!(report.changed, vec![derive_file_id("/DCIM/c.jpg")]);
        assert_eq!(report.bytes_freed, 10);
        assert!(!source.contains("/DCIM/a.jpg"));
        assert!(source.contains("/DCIM/c.jpg"));
        assert!(ledger.get(&job_id).unwrap().reclaimed_at.is_some());

        assert!(matches!(
            reclaim_originals(&ledger, &source, &job_id),
            Err(PipelineError::NotReclaimable { .. })
        ));
    }

    #[test]
    fn test_failed_removal_reports_progress_and_allows_another_pass() {
        let dir = TempDir::new().unwrap();
        let ledger = ArchiveLedger::open(dir.path()).unwrap();
        let source = MemorySource::new();
        source.insert("/DCIM/a.jpg", vec![1; 10], 60);
        source.insert("/DCIM/b.jpg", vec![2; 20], 60);
        let job_id = completed_job(&ledger, &source, &["/DCIM/a.jpg", "/DCIM/b.jpg"]);
        source.protect("/DCIM/b.jpg");

        let report = reclaim_originals(&ledger, &source, &job_id).unwrap();
        assert_eq!(report.removed, vec![derive_file_id("/DCIM/a.jpg")]);
        assert_eq!(report.failed, vec![derive_file_id("/DCIM/b.jpg")]);
        assert_eq!(report.bytes_freed, 10);
        assert!(!report.is_complete());
        assert!(source.contains("/DCIM/b.jpg"));
        assert!(ledger.get(&job_id).unwrap().reclaimed_at.is_none());

        let source_after = MemorySource::new();
        source_after.insert("/DCIM/b.jpg", vec![2; 20], 60);
        let report = reclaim_originals(&ledger, &source_after, &job_id).unwrap();
        assert_eq!(report.missing, vec![derive_file_id("/DCIM/a.jpg")]);
        assert_eq!(report.removed, vec![derive_file_id("/DCIM/b.jpg")]);
        assert!(report.is_complete());
        assert!(ledger.get(&job_id).unwrap().reclaimed_at.is_some());
    }

    #[test]
    fn test_unverified_job_keeps_originals() {
        let dir = TempDir::new().unwrap();
        let ledger = ArchiveLedger::open(dir.path()).unwrap();
        let source = MemorySource::new();
        source.insert("/DCIM/a.jpg", vec![1; 10], 60);
        let job = ledger
            .admit(&plan_of(vec![media_file(
                &derive_file_id("/DCIM/a.jpg"),
                "/DCIM/a.jpg",
                10,
                60,
            )]))
            .unwrap();

        let err = reclaim_originals(&ledger, &source, &job.id).unwrap_err();
        assert!(matches!(err, PipelineError::NotReclaimable { .. }));
        assert!(source.contains("/DCIM/a.jpg"));

        assert!(matches!(
            reclaim_originals(&ledger, &source, "missing"),
            Err(PipelineError::UnknownJob(_))
        ));
    }
}
