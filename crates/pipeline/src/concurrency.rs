//! Worker planning for the archive pipeline
//!
//! Derives job, build and upload concurrency from CPU core count and configuration.

use crate::config::Config;

/// Worker limits derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of archive jobs running at once
    pub max_concurrent_jobs: u32,
    /// Size of the pool that builds archives (blocking file reads)
    pub build_workers: u32,
    /// Chunk uploads in flight per job
    pub max_in_flight_chunks: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration, detecting cores via num_cpus
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a worker plan for a known core count
    ///
    /// Uses the following rules:
    /// - max_concurrent_jobs: 1 below 4 cores, 2 below 16, 4 otherwise (unless explicit)
    /// - build_workers: a quarter of the cores, at least 1 and at most
    ///   max_concurrent_jobs, so building never starves uploads (unless explicit)
    /// - max_in_flight_chunks: taken from the upload section, at least 1
    pub fn derive_with_cores(cfg: &Config, cores: u32) -> Self {
        let total_cores = cores.max(1);

        let max_concurrent_jobs = if cfg.pipeline.max_concurrent_jobs > 0 {
            cfg.pipeline.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        let build_workers = if cfg.pipeline.build_workers > 0 {
            cfg.pipeline.build_workers
        } else {
            derive_build_workers(total_cores, max_concurrent_jobs)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
            build_workers,
            max_in_flight_chunks: cfg.upload.max_in_flight_chunks.max(1),
        }
    }
}

fn derive_max_jobs(cores: u32) -> u32 {
    if cores < 4 {
        1
    } else if cores < 16 {
        2
    } else {
        4
    }
}

fn derive_build_workers(cores: u32, max_jobs: u32) -> u32 {
    (cores / 4).clamp(1, max_jobs.max(1))
}
