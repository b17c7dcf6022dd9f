//! Shared fixtures for unit tests: canned records, an in-memory file source
//! and a scriptable remote store.

use crate::builder::{sha256_hex, ArchiveBlob};
use crate::catalog::{classify_kind, derive_file_id, MediaFile, RawFileRecord};
use crate::job::{create_job, current_timestamp_ms, ArchiveJob, CancelFlag};
use crate::ledger::{ArchiveLedger, LogFile, LEDGER_FILE};
use crate::planner::PlanResult;
use crate::remote::{RemoteError, RemoteReceipt, RemoteStore};
use crate::source::FileSource;
use crate::upload::UploadSettings;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed "now" for catalog and planner tests.
pub const NOW_MS: i64 = 1_700_000_000_000;
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Record whose timestamps all lie `days_ago` days before `NOW_MS`.
pub fn raw_record(id: Option<&str>, path: &str, size: i64, days_ago: i64) -> RawFileRecord {
    let at = NOW_MS - days_ago * DAY_MS;
    RawFileRecord {
        id: id.map(str::to_string),
        path: path.to_string(),
        size,
        created_at: at,
        modified_at: at,
        accessed_at: Some(at),
    }
}

pub fn media_file(id: &str, path: &str, size: u64, days_ago: i64) -> MediaFile {
    let at = NOW_MS - days_ago * DAY_MS;
    MediaFile {
        id: id.to_string(),
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        size_bytes: size,
        kind: classify_kind(path),
        created_at: at,
        modified_at: at,
        last_accessed_at: Some(at),
    }
}

pub fn plan_of(files: Vec<MediaFile>) -> PlanResult {
    PlanResult {
        file_ids: files.iter().map(|f| f.id.clone()).collect(),
        estimated_size: files.iter().map(|f| f.size_bytes).sum(),
        files,
    }
}

struct MemoryFile {
    bytes: Vec<u8>,
    days_ago: i64,
    grows: bool,
}

/// File source held entirely in memory.
#[derive(Default)]
pub struct MemorySource {
    files: Mutex<BTreeMap<String, MemoryFile>>,
    undeletable: Mutex<BTreeSet<String>>,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>, days_ago: i64) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            MemoryFile {
                bytes,
                days_ago,
                grows: false,
            },
        );
    }

    /// Replace a file's contents, keeping its age.
    pub fn set_bytes(&self, path: &str, bytes: Vec<u8>) {
        if let Some(file) = self.files.lock().unwrap().get_mut(path) {
            file.bytes = bytes;
        }
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    /// Make every read of `path` append a byte afterwards, as if the file
    /// were still being written.
    pub fn grow_during_read(&self, path: &str) {
        if let Some(file) = self.files.lock().unwrap().get_mut(path) {
            file.grows = true;
        }
    }

    /// Make removing `path` fail with a permission error.
    pub fn protect(&self, path: &str) {
        self.undeletable.lock().unwrap().insert(path.to_string());
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn not_found(path: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path))
    }
}

impl FileSource for MemorySource {
    /// Ages are relative to the wall clock, as the orchestrator plans
    /// against it.
    fn list_files(&self) -> io::Result<Vec<RawFileRecord>> {
        let now = current_timestamp_ms();
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, file)| {
                let at = now - file.days_ago * DAY_MS;
                RawFileRecord {
                    id: None,
                    path: path.clone(),
                    size: file.bytes.len() as i64,
                    created_at: at,
                    modified_at: at,
                    accessed_at: Some(at),
                }
            })
            .collect())
    }

    fn read_bytes(&self, path: &str, range: Range<u64>) -> io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(path).ok_or_else(|| Self::not_found(path))?;
        let end = (range.end as usize).min(file.bytes.len());
        let start = (range.start as usize).min(end);
        let data = file.bytes[start..end].to_vec();
        if file.grows {
            file.bytes.push(0);
        }
        Ok(data)
    }

    fn file_size(&self, path: &str) -> io::Result<u64> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|f| f.bytes.len() as u64)
            .ok_or_else(|| Self::not_found(path))
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        if self.undeletable.lock().unwrap().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path),
            ));
        }
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }
}

/// Job over `paths` as they currently exist in `source`.
pub fn job_over(source: &MemorySource, paths: &[&str]) -> ArchiveJob {
    let files = paths
        .iter()
        .map(|path| {
            let size = source.file_size(path).unwrap();
            media_file(&derive_file_id(path), path, size, 45)
        })
        .collect();
    create_job(&plan_of(files))
}

/// Container with a single entry, exactly `size` bytes long (at least 23).
pub fn blob_of_size(size: usize) -> ArchiveBlob {
    const OVERHEAD: usize = 9 + 2 + 1 + 2 + 1 + 8;
    assert!(size >= OVERHEAD, "blob must be at least {} bytes", OVERHEAD);

    let data: Vec<u8> = (0..size - OVERHEAD).map(|i| (i % 251) as u8).collect();
    let mut bytes = Vec::with_capacity(size);
    bytes.extend_from_slice(b"MARC");
    bytes.push(1);
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.push(b'x');
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.push(b'p');
    bytes.extend_from_slice(&(data.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&data);
    ArchiveBlob::parse(bytes).unwrap()
}

/// Upload settings with millisecond backoff so retry tests run fast.
pub fn fast_settings(chunk_size: u64, max_in_flight: usize) -> UploadSettings {
    UploadSettings {
        chunk_size,
        max_in_flight,
        max_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        max_suspension: Duration::from_secs(30),
    }
}

#[derive(Default)]
struct Script {
    objects: HashMap<String, Vec<u8>>,
    put_log: Vec<u64>,
    attempts: usize,
    successful: usize,
    finalized: usize,
    fail_after: Option<usize>,
    transient_failures: u32,
    auth_expired: bool,
    unavailable: bool,
    corrupt_at: Option<u64>,
    cancel_after: Option<(usize, CancelFlag)>,
}

/// In-memory remote store whose failures are scripted by the test.
#[derive(Default)]
pub struct ScriptedStore {
    script: Mutex<Script>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every put once `n` puts have succeeded.
    pub fn fail_after_puts(&self, n: usize) {
        self.script.lock().unwrap().fail_after = Some(n);
    }

    /// Fail the next `n` put attempts with a transient error.
    pub fn fail_transiently(&self, n: u32) {
        self.script.lock().unwrap().transient_failures = n;
    }

    pub fn expire_auth(&self, expired: bool) {
        self.script.lock().unwrap().auth_expired = expired;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unwrap().unavailable = unavailable;
    }

    /// Flip the first byte of the chunk stored at `offset`.
    pub fn corrupt_chunk_at(&self, offset: u64) {
        self.script.lock().unwrap().corrupt_at = Some(offset);
    }

    /// Trip `flag` once `n` puts have succeeded.
    pub fn cancel_after_puts(&self, n: usize, flag: CancelFlag) {
        self.script.lock().unwrap().cancel_after = Some((n, flag));
    }

    pub fn clear_failures(&self) {
        let mut script = self.script.lock().unwrap();
        script.fail_after = None;
        script.transient_failures = 0;
        script.auth_expired = false;
        script.unavailable = false;
        script.corrupt_at = None;
        script.cancel_after = None;
    }

    pub fn clear_log(&self) {
        let mut script = self.script.lock().unwrap();
        script.put_log.clear();
        script.attempts = 0;
    }

    /// Offsets of successful puts, in completion order.
    pub fn put_offsets(&self) -> Vec<u64> {
        self.script.lock().unwrap().put_log.clone()
    }

    pub fn put_attempts(&self) -> usize {
        self.script.lock().unwrap().attempts
    }

    pub fn finalize_count(&self) -> usize {
        self.script.lock().unwrap().finalized
    }

    pub fn object(&self, destination: &str) -> Option<Vec<u8>> {
        self.script.lock().unwrap().objects.get(destination).cloned()
    }
}

#[async_trait]
impl RemoteStore for ScriptedStore {
    async fn put_chunk(
        &self,
        destination: &str,
        offset: u64,
        bytes: &[u8],
        _token: &str,
    ) -> Result<(), RemoteError> {
        let mut script = self.script.lock().unwrap();
        script.attempts += 1;

        if script.unavailable {
            return Err(RemoteError::Unavailable("scripted outage".into()));
        }
        if script.auth_expired {
            return Err(RemoteError::AuthExpired);
        }
        if script.transient_failures > 0 {
            script.transient_failures -= 1;
            return Err(RemoteError::Transient("connection reset".into()));
        }
        if script.fail_after.map_or(false, |n| script.successful >= n) {
            return Err(RemoteError::Rejected("scripted rejection".into()));
        }

        let corrupt = script.corrupt_at == Some(offset);
        let object = script.objects.entry(destination.to_string()).or_default();
        let start = offset as usize;
        let end = start + bytes.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(bytes);
        if corrupt && !bytes.is_empty() {
            object[start] ^= 0xff;
        }

        script.successful += 1;
        script.put_log.push(offset);
        if let Some((n, flag)) = &script.cancel_after {
            if script.successful >= *n {
                flag.cancel();
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        destination: &str,
        size: u64,
        _token: &str,
    ) -> Result<RemoteReceipt, RemoteError> {
        let mut script = self.script.lock().unwrap();
        if script.unavailable {
            return Err(RemoteError::Unavailable("scripted outage".into()));
        }
        if script.auth_expired {
            return Err(RemoteError::AuthExpired);
        }
        script.finalized += 1;

        let object = script
            .objects
            .get_mut(destination)
            .ok_or_else(|| RemoteError::Rejected(format!("{} was never uploaded", destination)))?;
        object.resize(size as usize, 0);
        Ok(RemoteReceipt {
            remote_path: destination.to_string(),
            remote_checksum: sha256_hex(object),
        })
    }
}

/// Failures to inject into a ledger's event log.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    /// Write this many bytes of the next record, then fail.
    pub partial_write: Option<usize>,
    pub sync_failures: u32,
    pub fail_rollback: bool,
}

struct FaultyLog {
    file: File,
    faults: Arc<Mutex<Faults>>,
}

impl Write for FaultyLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let partial = self.faults.lock().unwrap().partial_write;
        match partial {
            Some(n) => {
                self.file.write_all(&buf[..n.min(buf.len())])?;
                Err(io::Error::other("no space left on device"))
            }
            None => self.file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl LogFile for FaultyLog {
    fn size(&self) -> io::Result<u64> {
        self.file.size()
    }

    fn rollback(&mut self, len: u64) -> io::Result<()> {
        if self.faults.lock().unwrap().fail_rollback {
            return Err(io::Error::other("read-only file system"));
        }
        self.file.rollback(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        let mut faults = self.faults.lock().unwrap();
        if faults.sync_failures > 0 {
            faults.sync_failures -= 1;
            return Err(io::Error::other("input/output error"));
        }
        drop(faults);
        self.file.sync()
    }
}

/// Route `ledger`'s writes through a log whose failures the test controls.
pub fn inject_faults(ledger: &ArchiveLedger) -> Arc<Mutex<Faults>> {
    let file = OpenOptions::new()
        .append(true)
        .open(ledger.dir().join(LEDGER_FILE))
        .unwrap();
    let faults = Arc::new(Mutex::new(Faults::default()));
    ledger.replace_log(Box::new(FaultyLog {
        file,
        faults: faults.clone(),
    }));
    faults
}
