//! Archive planner: picks the files for one archive job.
//!
//! Candidates are the catalog entries matching the policy predicate, ordered
//! oldest first and then largest first (ties broken by id so the result is
//! fully deterministic), and packed first-fit into the job's size budget.

use crate::catalog::{FileCatalog, FilePredicate, MediaFile};
use crate::error::PipelineError;
use crate::job::FileId;
use media_archive_config::ArchivePolicy;
use std::collections::HashSet;

/// Files selected for a prospective job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    /// Selected ids in priority order.
    pub file_ids: Vec<FileId>,
    pub estimated_size: u64,
    /// Snapshots of the selected files, same order as `file_ids`.
    pub files: Vec<MediaFile>,
}

/// Outcome of planning. An empty plan is a legitimate result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Planned(PlanResult),
    Empty,
}

impl PlanOutcome {
    pub fn into_plan(self) -> Option<PlanResult> {
        match self {
            PlanOutcome::Planned(plan) => Some(plan),
            PlanOutcome::Empty => None,
        }
    }
}

/// Reject policies that could never produce a sensible job.
pub fn validate_policy(policy: &ArchivePolicy) -> Result<(), PipelineError> {
    if policy.max_job_size_bytes == 0 {
        return Err(PipelineError::InvalidPolicy(
            "max_job_size_bytes must be greater than zero".to_string(),
        ));
    }

    if policy
        .excluded_path_prefixes
        .iter()
        .any(|prefix| prefix.trim().is_empty())
    {
        return Err(PipelineError::InvalidPolicy(
            "excluded path prefixes must not be empty".to_string(),
        ));
    }

    if policy
        .excluded_folders
        .iter()
        .any(|folder| folder.trim().is_empty() || folder.contains(['/', '\\']))
    {
        return Err(PipelineError::InvalidPolicy(
            "excluded folders must be plain folder names".to_string(),
        ));
    }

    Ok(())
}

/// Plan one job from the catalog under `policy`, evaluated at `now_ms`.
///
/// Files larger than the whole budget can never fit and are skipped; smaller
/// files further down the priority order may still fill the remaining space.
pub fn plan(
    catalog: &FileCatalog,
    policy: &ArchivePolicy,
    now_ms: i64,
) -> Result<PlanOutcome, PipelineError> {
    plan_excluding(catalog, policy, now_ms, &HashSet::new())
}

/// Like [`plan`], but never selects any file in `skip` (files already
/// claimed by an active job or already archived).
pub fn plan_excluding(
    catalog: &FileCatalog,
    policy: &ArchivePolicy,
    now_ms: i64,
    skip: &HashSet<FileId>,
) -> Result<PlanOutcome, PipelineError> {
    validate_policy(policy)?;

    let query = catalog.query(FilePredicate::from_policy(policy, now_ms));
    let mut candidates: Vec<&MediaFile> = query
        .iter()
        .filter(|file| !skip.contains(&file.id))
        .collect();
    candidates.sort_by(|a, b| {
        a.last_used_at()
            .cmp(&b.last_used_at())
            .then_with(|| b.size_bytes.cmp(&a.size_bytes))
            .then_with(|| a.id.cmp(&b.id))
    });

    let budget = policy.max_job_size_bytes;
    let mut total: u64 = 0;
    let mut selected: Vec<MediaFile> = Vec::new();

    for file in candidates {
        if total == budget {
            break;
        }
        match total.checked_add(file.size_bytes) {
            Some(next) if next <= budget => {
                total = next;
                selected.push(file.clone());
            }
            _ => continue,
        }
    }

    if selected.is_empty() {
        return Ok(PlanOutcome::Empty);
    }

    Ok(PlanOutcome::Planned(PlanResult {
        file_ids: selected.iter().map(|f| f.id.clone()).collect(),
        estimated_size: total,
        files: selected,
    }))
}
