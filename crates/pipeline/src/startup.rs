//! Startup checks for the archive pipeline
//!
//! Preflight checks run before the ledger is opened:
//! - The archive policy is usable
//! - The state directory exists and is writable
//! - Every library root exists
//! - The remote store is fully configured

use crate::config::{Config, RemoteKind};
use crate::planner::validate_policy;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const PROBE_FILE: &str = ".write-probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid archive policy: {0}")]
    Policy(String),

    #[error("State directory {path} is not writable: {reason}")]
    StateDirUnwritable { path: String, reason: String },

    #[error("Library root {0} does not exist or is not a directory")]
    MissingLibraryRoot(String),

    #[error("Remote store misconfigured: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the state directory if needed and prove a file can be written there.
pub fn check_state_dir_writable(dir: &Path) -> Result<(), StartupError> {
    let unwritable = |e: std::io::Error| StartupError::StateDirUnwritable {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };

    fs::create_dir_all(dir).map_err(unwritable)?;
    let probe = dir.join(PROBE_FILE);
    let mut file = fs::File::create(&probe).map_err(unwritable)?;
    file.write_all(b"ok").map_err(unwritable)?;
    file.sync_all().map_err(unwritable)?;
    drop(file);
    fs::remove_file(&probe)?;
    Ok(())
}

pub fn check_library_roots(roots: &[impl AsRef<Path>]) -> Result<(), StartupError> {
    for root in roots {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StartupError::MissingLibraryRoot(root.display().to_string()));
        }
    }
    Ok(())
}

/// A directory store needs a root; an HTTP store needs a parseable base URL.
pub fn check_remote(cfg: &Config) -> Result<(), StartupError> {
    match cfg.remote.kind {
        RemoteKind::Directory => match &cfg.remote.root {
            Some(root) if !root.as_os_str().is_empty() => {
                if root.is_dir() {
                    Ok(())
                } else {
                    Err(StartupError::Remote(format!(
                        "remote root {} is not a directory",
                        root.display()
                    )))
                }
            }
            _ => Err(StartupError::Remote(
                "directory remote requires remote.root".to_string(),
            )),
        },
        RemoteKind::Http => {
            let Some(base_url) = cfg.remote.base_url.as_deref() else {
                return Err(StartupError::Remote(
                    "http remote requires remote.base_url".to_string(),
                ));
            };
            let url = reqwest::Url::parse(base_url)
                .map_err(|e| StartupError::Remote(format!("invalid base_url '{}': {}", base_url, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(StartupError::Remote(format!(
                    "base_url must be http or https, got '{}'",
                    url.scheme()
                )));
            }
            Ok(())
        }
    }
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Archive policy
/// 2. State directory
/// 3. Library roots
/// 4. Remote store
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    validate_policy(&cfg.policy).map_err(|e| StartupError::Policy(e.to_string()))?;
    check_state_dir_writable(&cfg.pipeline.state_dir)?;
    check_library_roots(&cfg.pipeline.library_roots)?;
    check_remote(cfg)?;
    tracing::debug!(state_dir = %cfg.pipeline.state_dir.display(), "startup checks passed");
    Ok(())
}
