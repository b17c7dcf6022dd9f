//! Daemon startup and main loop for the archive pipeline
//!
//! Provides the daemon entry point, the startup sequence and the periodic
//! scan loop that feeds the orchestrator.

use crate::catalog::ScanSummary;
use crate::concurrency::WorkerPlan;
use crate::config::{Config, ConfigError, RemoteKind};
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::{CredentialProvider, SessionContext, SessionCredentials};
use crate::error::PipelineError;
use crate::job::{current_timestamp_ms, JobId};
use crate::ledger::ArchiveLedger;
use crate::metrics::{collect_storage_metrics, new_shared_metrics, SharedMetrics};
use crate::metrics_server::{run_metrics_server, ServerState};
use crate::orchestrator::{Collaborators, PipelineOrchestrator, SubmitOutcome};
use crate::remote::{DirectoryStore, HttpStore, RemoteStore};
use crate::source::LocalFileSource;
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bearer token for the HTTP store
pub const ACCESS_TOKEN_ENV: &str = "REMOTE_ACCESS_TOKEN";
/// Account name reported with the HTTP session
pub const ACCOUNT_ENV: &str = "REMOTE_ACCOUNT";

const METRICS_REFRESH: Duration = Duration::from_secs(2);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Pipeline operation failed
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Remote store cannot be constructed from the configuration
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// What one daemon scan did.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub summary: ScanSummary,
    /// Job started by auto-archive, if any.
    pub submitted: Option<JobId>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived worker plan
    pub worker_plan: WorkerPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    /// Orchestrator driving archive jobs
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Run startup checks
    /// 4. Derive worker plan
    /// 5. Open the ledger and wire the collaborators
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// The ledger is still opened, so this fails if another process holds it.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let worker_plan = WorkerPlan::derive(&config);
        tracing::info!(
            cores = worker_plan.total_cores,
            jobs = worker_plan.max_concurrent_jobs,
            build_workers = worker_plan.build_workers,
            in_flight_chunks = worker_plan.max_in_flight_chunks,
            "worker plan derived"
        );

        let metrics = new_shared_metrics();
        let ledger = Arc::new(ArchiveLedger::open(&config.pipeline.state_dir)?);
        let collaborators = build_collaborators(&config)?;
        let orchestrator =
            PipelineOrchestrator::new(&config, &worker_plan, ledger, collaborators, metrics.clone());

        Ok(Self {
            config,
            worker_plan,
            metrics,
            orchestrator,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_metrics_server(&self) -> tokio::task::JoinHandle<()> {
        let state = ServerState {
            metrics: self.metrics.clone(),
            connectivity: self.orchestrator.connectivity().clone(),
        };
        let bind_addr = self.config.server.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(state, &bind_addr).await {
                tracing::error!(error = %e, "status server stopped");
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically refreshes storage and connectivity in the shared state.
    pub fn start_metrics_updater(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let connectivity = self.orchestrator.connectivity().clone();
        let state_dir = self.config.pipeline.state_dir.clone();
        tokio::spawn(async move {
            loop {
                let dir = state_dir.clone();
                let storage = tokio::task::spawn_blocking(move || collect_storage_metrics(&dir))
                    .await
                    .unwrap_or_default();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.storage = storage;
                    snapshot.online = connectivity.is_online();
                    snapshot.timestamp_unix_ms = current_timestamp_ms();
                }
                tokio::time::sleep(METRICS_REFRESH).await;
            }
        })
    }

    /// Rescan the library and, with auto-archive on, submit a job for
    /// whatever became eligible.
    pub async fn scan_once(&self) -> Result<ScanReport, DaemonError> {
        let summary = self.orchestrator.scan().await?;

        let submitted = if self.config.pipeline.auto_archive {
            match self.orchestrator.submit(self.orchestrator.policy())? {
                SubmitOutcome::Submitted(job_id) => {
                    tracing::info!(job_id = %job_id, "archive job submitted");
                    Some(job_id)
                }
                SubmitOutcome::NothingToArchive => None,
            }
        } else {
            None
        };

        Ok(ScanReport { summary, submitted })
    }

    /// Run the daemon main loop
    ///
    /// Every `scan_interval_secs` until ctrl-c: restart in-flight jobs that
    /// nothing is running, then rescan.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let period = Duration::from_secs(self.config.pipeline.scan_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Covers jobs left by a previous process and jobs whose
                    // failure could not be recorded.
                    let resumed = self.orchestrator.resume_in_flight();
                    if !resumed.is_empty() {
                        tracing::info!(count = resumed.len(), "resumed idle in-flight jobs");
                    }
                    if let Err(e) = self.scan_once().await {
                        tracing::error!(error = %e, "scan failed");
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|e| DaemonError::Server(format!("signal handler failed: {}", e)))?;
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the status server, the metrics updater and recorder, and the
    /// main loop.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _server_handle = self.start_metrics_server();
        let _updater_handle = self.start_metrics_updater();
        let _recorder_handle = self.orchestrator.spawn_metrics_recorder();

        self.run().await
    }
}

/// Wire the local library, the configured remote store and its credentials.
pub fn build_collaborators(config: &Config) -> Result<Collaborators, DaemonError> {
    let (store, credentials): (Arc<dyn RemoteStore>, Arc<dyn CredentialProvider>) =
        match config.remote.kind {
            RemoteKind::Directory => {
                let root = config.remote.root.clone().ok_or_else(|| {
                    DaemonError::Remote("directory remote requires remote.root".to_string())
                })?;
                (
                    Arc::new(DirectoryStore::new(root)),
                    Arc::new(SessionCredentials::new(SessionContext::local())),
                )
            }
            RemoteKind::Http => {
                let base_url = config.remote.base_url.clone().ok_or_else(|| {
                    DaemonError::Remote("http remote requires remote.base_url".to_string())
                })?;
                let credentials = match std::env::var(ACCESS_TOKEN_ENV) {
                    Ok(token) if !token.trim().is_empty() => {
                        let account =
                            std::env::var(ACCOUNT_ENV).unwrap_or_else(|_| "default".to_string());
                        SessionCredentials::new(SessionContext::new(account, token.trim()))
                    }
                    _ => {
                        tracing::warn!(
                            "{} is not set, uploads will fail until a session is provided",
                            ACCESS_TOKEN_ENV
                        );
                        SessionCredentials::signed_out()
                    }
                };
                (Arc::new(HttpStore::new(base_url)), Arc::new(credentials))
            }
        };

    Ok(Collaborators {
        source: Arc::new(LocalFileSource::new(config.pipeline.library_roots.clone())),
        store,
        credentials,
        connectivity: ConnectivityMonitor::new(true),
    })
}
