//! CLI entry point for the media archive pipeline
//!
//! `run` starts the daemon; every other subcommand opens the same state
//! directory, performs one operation and exits. The ledger lock means only
//! one of them can use a state directory at a time.

mod logging;

use clap::{Parser, Subcommand};
use media_archive::{
    format_bytes, ArchiveJob, Config, Daemon, DaemonError, JobFilter, PipelineError,
    PipelineOrchestrator, SubmitOutcome,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

/// Media archive - move stale photos and videos into verified remote archives
#[derive(Parser, Debug)]
#[command(name = "media-archive")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Skip startup checks (state dir, library roots, remote). For testing only.
    #[arg(long, default_value = "false", global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: status server, periodic scans, resumed jobs
    Run,
    /// Scan the library and print a summary
    Scan,
    /// Show which files the next job would archive
    Plan,
    /// Plan a job and run it to completion in the foreground
    Archive,
    /// Print one job as JSON
    Status { job_id: String },
    /// List jobs
    List {
        /// Include completed, failed and cancelled jobs
        #[arg(long)]
        all: bool,
    },
    /// List archives and their upload status
    Archives,
    /// Cancel a job
    Cancel { job_id: String },
    /// Re-enter a failed job and run it in the foreground
    Retry { job_id: String },
    /// Delete the originals of a verified job
    Reclaim { job_id: String },
    /// Forget a finished job and its local artifacts
    Purge { job_id: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Daemon(DaemonError),
    #[error("[{}] {0}", .0.class())]
    Pipeline(#[from] PipelineError),
    #[error("could not render output: {0}")]
    Output(#[from] serde_json::Error),
}

impl From<DaemonError> for CliError {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::Pipeline(e) => CliError::Pipeline(e),
            e => CliError::Daemon(e),
        }
    }
}

fn open_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    let config = Config::load(&args.config)?;
    if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config)
    }
}

fn job_line(job: &ArchiveJob) -> String {
    let mut line = format!(
        "{}  {:<10} {:>5} files  {:>10}",
        job.id,
        job.state.as_str(),
        job.file_ids.len(),
        format_bytes(job.archive_size.unwrap_or_else(|| job.planned_bytes())),
    );
    if job.retry_count > 0 {
        line.push_str(&format!("  retries={}", job.retry_count));
    }
    if let Some(err) = &job.last_error {
        line.push_str(&format!("  {}", err));
    }
    line
}

async fn scan(orchestrator: &PipelineOrchestrator) -> Result<(), CliError> {
    let summary = orchestrator.scan().await?;
    println!(
        "{} files, {} ({} photos, {} videos, {} other)",
        summary.total_files,
        format_bytes(summary.total_bytes),
        summary.photos,
        summary.videos,
        summary.others
    );
    println!(
        "{} files unused for {} days, {}",
        summary.stale_files,
        orchestrator.policy().age_threshold_days,
        format_bytes(summary.stale_bytes)
    );
    for folder in summary.folders.iter().take(10) {
        println!("  {:<24} {:>6} files  {:>10}", folder.name, folder.count, format_bytes(folder.bytes));
    }
    Ok(())
}

async fn execute(orchestrator: &PipelineOrchestrator, job_id: &str) -> Result<(), CliError> {
    let result = orchestrator.execute(job_id).await;
    let job = orchestrator.status(job_id)?;
    println!("{}", job_line(&job));
    result?;
    Ok(())
}

async fn dispatch(args: &Args, daemon: &Daemon) -> Result<(), CliError> {
    let orchestrator: &Arc<PipelineOrchestrator> = daemon.orchestrator();

    match &args.command {
        Command::Run => {
            tracing::info!(
                build_workers = daemon.worker_plan.build_workers,
                jobs = daemon.worker_plan.max_concurrent_jobs,
                addr = %daemon.config.server.bind_addr,
                "daemon starting"
            );
            daemon.run_with_server().await?;
        }
        Command::Scan => scan(orchestrator).await?,
        Command::Plan => {
            orchestrator.scan().await?;
            match orchestrator.plan(orchestrator.policy())?.into_plan() {
                Some(plan) => {
                    for file in &plan.files {
                        println!("{:>10}  {}", format_bytes(file.size_bytes), file.path);
                    }
                    println!("{} files, {}", plan.files.len(), format_bytes(plan.estimated_size));
                }
                None => println!("nothing to archive"),
            }
        }
        Command::Archive => {
            orchestrator.scan().await?;
            match orchestrator.admit(orchestrator.policy())? {
                SubmitOutcome::Submitted(job_id) => execute(orchestrator, &job_id).await?,
                SubmitOutcome::NothingToArchive => println!("nothing to archive"),
            }
        }
        Command::Status { job_id } => {
            let job = orchestrator.status(job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::List { all } => {
            let filter = if *all { JobFilter::all() } else { JobFilter::active() };
            for job in orchestrator.list(&filter) {
                println!("{}", job_line(&job));
            }
        }
        Command::Archives => print!("{}", orchestrator.archives().render()),
        Command::Cancel { job_id } => {
            let job = orchestrator.cancel(job_id)?;
            println!("{}", job_line(&job));
        }
        Command::Retry { job_id } => {
            orchestrator.reenter(job_id)?;
            execute(orchestrator, job_id).await?;
        }
        Command::Reclaim { job_id } => {
            let report = orchestrator.reclaim_originals(job_id).await?;
            println!(
                "removed {} files, freed {} ({} already gone, {} changed and kept)",
                report.removed.len(),
                format_bytes(report.bytes_freed),
                report.missing.len(),
                report.changed.len()
            );
            if !report.is_complete() {
                println!(
                    "{} files could not be removed; run reclaim again once they are writable",
                    report.failed.len()
                );
            }
        }
        Command::Purge { job_id } => {
            orchestrator.purge(job_id)?;
            println!("purged {}", job_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init_logger(args.log_file.as_deref());

    let daemon = match open_daemon(&args) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Failed to initialize: {}", CliError::from(e));
            return ExitCode::FAILURE;
        }
    };

    match dispatch(&args, &daemon).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
