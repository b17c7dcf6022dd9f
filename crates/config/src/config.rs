//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Selection policy for a single archive job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivePolicy {
    /// Files not accessed for longer than this many days are candidates
    #[serde(default = "default_age_threshold_days")]
    pub age_threshold_days: u32,
    /// Files must be strictly larger than this to be archived
    #[serde(default)]
    pub min_file_size_bytes: u64,
    /// Paths starting with any of these prefixes are never archived
    #[serde(default)]
    pub excluded_path_prefixes: BTreeSet<String>,
    /// Folder names that exclude every file below them, wherever they appear
    #[serde(default = "default_excluded_folders")]
    pub excluded_folders: BTreeSet<String>,
    /// Upper bound on the summed size of files in one job
    #[serde(default = "default_max_job_size_bytes")]
    pub max_job_size_bytes: u64,
}

fn default_age_threshold_days() -> u32 {
    30
}

fn default_excluded_folders() -> BTreeSet<String> {
    ["Screenshots", "App-private", "System"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_job_size_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            age_threshold_days: default_age_threshold_days(),
            min_file_size_bytes: 0,
            excluded_path_prefixes: BTreeSet::new(),
            excluded_folders: default_excluded_folders(),
            max_job_size_bytes: default_max_job_size_bytes(),
        }
    }
}

/// Pipeline runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Maximum concurrent archive jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Workers reserved for archive building (0 = auto-derive)
    #[serde(default)]
    pub build_workers: u32,
    /// Directory holding the ledger, upload checkpoints and staged archives
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directories scanned by the local file source
    #[serde(default)]
    pub library_roots: Vec<PathBuf>,
    /// Submit an archive job after every daemon scan
    #[serde(default)]
    pub auto_archive: bool,
    /// Seconds between daemon rescans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("media-archive-state")
}

fn default_scan_interval_secs() -> u64 {
    600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            build_workers: 0,
            state_dir: default_state_dir(),
            library_roots: Vec::new(),
            auto_archive: false,
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

/// Chunked upload configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    /// Size of each uploaded chunk in bytes
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    /// Chunks of one job that may be in flight at once
    #[serde(default = "default_max_in_flight_chunks")]
    pub max_in_flight_chunks: u32,
    /// Attempts per chunk before the upload is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay, doubled on every further attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling for the retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How long an upload may stay parked waiting for connectivity
    #[serde(default = "default_max_suspension_secs")]
    pub max_suspension_secs: u64,
    /// Remote path prefix for archive destinations
    #[serde(default = "default_destination_prefix")]
    pub destination_prefix: String,
}

fn default_chunk_size_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_in_flight_chunks() -> u32 {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_suspension_secs() -> u64 {
    3600
}

fn default_destination_prefix() -> String {
    "archives".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size_bytes(),
            max_in_flight_chunks: default_max_in_flight_chunks(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_suspension_secs: default_max_suspension_secs(),
            destination_prefix: default_destination_prefix(),
        }
    }
}

/// Which remote store implementation to use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// A mounted directory acting as the object store
    #[default]
    Directory,
    /// An HTTP object store speaking the chunk/finalize protocol
    Http,
}

/// Remote store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RemoteConfig {
    #[serde(default)]
    pub kind: RemoteKind,
    /// Root directory for the directory store
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Base URL for the HTTP store
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub policy: ArchivePolicy,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ARCHIVE_AGE_THRESHOLD_DAYS -> policy.age_threshold_days
    /// - ARCHIVE_MIN_FILE_SIZE_BYTES -> policy.min_file_size_bytes
    /// - ARCHIVE_MAX_JOB_SIZE_BYTES -> policy.max_job_size_bytes
    /// - PIPELINE_MAX_CONCURRENT_JOBS -> pipeline.max_concurrent_jobs
    /// - PIPELINE_BUILD_WORKERS -> pipeline.build_workers
    /// - PIPELINE_STATE_DIR -> pipeline.state_dir
    /// - PIPELINE_AUTO_ARCHIVE -> pipeline.auto_archive
    /// - UPLOAD_CHUNK_SIZE_BYTES -> upload.chunk_size_bytes
    /// - UPLOAD_MAX_IN_FLIGHT_CHUNKS -> upload.max_in_flight_chunks
    /// - UPLOAD_MAX_ATTEMPTS -> upload.max_attempts
    /// - REMOTE_BASE_URL -> remote.base_url
    ///
    /// Values that fail to parse leave the existing setting in place.
    pub fn apply_env_overrides(&mut self) {
        if let Some(days) = parse_env::<u32>("ARCHIVE_AGE_THRESHOLD_DAYS") {
            self.policy.age_threshold_days = days;
        }

        if let Some(bytes) = parse_env::<u64>("ARCHIVE_MIN_FILE_SIZE_BYTES") {
            self.policy.min_file_size_bytes = bytes;
        }

        if let Some(bytes) = parse_env::<u64>("ARCHIVE_MAX_JOB_SIZE_BYTES") {
            self.policy.max_job_size_bytes = bytes;
        }

        if let Some(jobs) = parse_env::<u32>("PIPELINE_MAX_CONCURRENT_JOBS") {
            self.pipeline.max_concurrent_jobs = jobs;
        }

        if let Some(workers) = parse_env::<u32>("PIPELINE_BUILD_WORKERS") {
            self.pipeline.build_workers = workers;
        }

        if let Ok(val) = env::var("PIPELINE_STATE_DIR") {
            if !val.trim().is_empty() {
                self.pipeline.state_dir = PathBuf::from(val);
            }
        }

        // Accept "true", "1", "yes" as true; "false", "0", "no" as false
        if let Ok(val) = env::var("PIPELINE_AUTO_ARCHIVE") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.pipeline.auto_archive = true,
                "false" | "0" | "no" => self.pipeline.auto_archive = false,
                _ => {}
            }
        }

        if let Some(bytes) = parse_env::<u64>("UPLOAD_CHUNK_SIZE_BYTES") {
            self.upload.chunk_size_bytes = bytes;
        }

        if let Some(chunks) = parse_env::<u32>("UPLOAD_MAX_IN_FLIGHT_CHUNKS") {
            self.upload.max_in_flight_chunks = chunks;
        }

        if let Some(attempts) = parse_env::<u32>("UPLOAD_MAX_ATTEMPTS") {
            self.upload.max_attempts = attempts;
        }

        if let Ok(val) = env::var("REMOTE_BASE_URL") {
            if !val.trim().is_empty() {
                self.remote.base_url = Some(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
