//! Archive listing: the caller-facing view of jobs as archives.

use crate::catalog::format_bytes;
use crate::job::{ArchiveJob, JobState};
use serde::{Deserialize, Serialize};

/// Upload progress as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn from_state(state: JobState) -> Self {
        match state {
            JobState::Planned | JobState::Building | JobState::Built => UploadStatus::Pending,
            JobState::Uploading | JobState::Verifying => UploadStatus::Uploading,
            JobState::Completed => UploadStatus::Completed,
            JobState::Failed => UploadStatus::Failed,
            JobState::Cancelled => UploadStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub id: String,
    pub name: String,
    pub file_count: usize,
    /// Archive size once built, planned bytes before that.
    pub size_bytes: u64,
    pub created_at: i64,
    pub upload_status: UploadStatus,
    pub remote_path: Option<String>,
    pub checksum: Option<String>,
    pub reclaimed: bool,
}

impl ArchiveSummary {
    pub fn from_job(job: &ArchiveJob) -> Self {
        Self {
            id: job.id.clone(),
            name: job.archive_name(),
            file_count: job.file_ids.len(),
            size_bytes: job.archive_size.unwrap_or_else(|| job.planned_bytes()),
            created_at: job.created_at,
            upload_status: UploadStatus::from_state(job.state),
            remote_path: job.remote_path.clone(),
            checksum: job.archive_checksum.clone(),
            reclaimed: job.reclaimed_at.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveListing {
    /// Newest first.
    pub archives: Vec<ArchiveSummary>,
    pub total_files: usize,
    pub total_bytes: u64,
    pub uploaded_count: usize,
    pub uploaded_bytes: u64,
}

impl ArchiveListing {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a ArchiveJob>) -> Self {
        let mut listing = Self::default();
        for job in jobs {
            let summary = ArchiveSummary::from_job(job);
            listing.total_files += summary.file_count;
            listing.total_bytes += summary.size_bytes;
            if summary.upload_status == UploadStatus::Completed {
                listing.uploaded_count += 1;
                listing.uploaded_bytes += summary.size_bytes;
            }
            listing.archives.push(summary);
        }
        listing.archives.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        listing
    }

    /// One line per archive plus a totals line, for terminal output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for archive in &self.archives {
            out.push_str(&format!(
                "{}  {:<10} {:>5} files  {:>10}  {}\n",
                archive.name,
                archive.upload_status,
                archive.file_count,
                format_bytes(archive.size_bytes),
                archive.id,
            ));
        }
        out.push_str(&format!(
            "{} archives, {} files, {} ({} uploaded, {})\n",
            self.archives.len(),
            self.total_files,
            format_bytes(self.total_bytes),
            self.uploaded_count,
            format_bytes(self.uploaded_bytes),
        ));
        out
    }
}
