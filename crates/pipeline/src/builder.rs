//! Archive builder: packages a job's files into one verifiable container.
//!
//! Container layout (all integers little-endian):
//!
//! ```text
//! "MARC" | version: u8 | entry count: u32
//! per entry, ascending file id:
//!   id len: u16 | id | path len: u16 | path | data len: u64 | data
//! ```
//!
//! The whole-archive checksum is the SHA-256 of that byte layout, so two
//! builds over the same files always produce the same checksum no matter how
//! the source enumerated them.

use crate::error::PipelineError;
use crate::job::{ArchiveJob, CancelFlag, FileId, PlannedFile};
use crate::source::FileSource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

const MAGIC: &[u8; 4] = b"MARC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Location and checksum of one file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_id: FileId,
    pub path: String,
    /// Offset of the file data within the archive bytes.
    pub offset: u64,
    pub length: u64,
    pub checksum: String,
}

/// Immutable archive container plus its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBlob {
    bytes: Vec<u8>,
    checksum: String,
    manifest: Vec<ManifestEntry>,
}

impl ArchiveBlob {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn entry(&self, file_id: &str) -> Option<&ManifestEntry> {
        self.manifest.iter().find(|e| e.file_id == file_id)
    }

    /// Bytes of one archived file.
    pub fn extract(&self, file_id: &str) -> Option<&[u8]> {
        let entry = self.entry(file_id)?;
        let start = entry.offset as usize;
        self.bytes.get(start..start + entry.length as usize)
    }

    /// Decode a container and re-verify its structure and entry checksums.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, PipelineError> {
        let mut reader = ByteReader::new(&bytes);

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(PipelineError::StagingCorrupt("bad magic".to_string()));
        }
        let version = reader.take(1)?[0];
        if version != FORMAT_VERSION {
            return Err(PipelineError::StagingCorrupt(format!(
                "unsupported container version {}",
                version
            )));
        }

        let count = reader.u32()?;
        let mut manifest = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let id_len = reader.u16()? as usize;
            let file_id = reader.string(id_len)?;
            let path_len = reader.u16()? as usize;
            let path = reader.string(path_len)?;
            let length = reader.u64()?;
            let offset = reader.pos as u64;
            let data = reader.take(length as usize)?;

            if manifest
                .last()
                .map_or(false, |prev: &ManifestEntry| prev.file_id >= file_id)
            {
                return Err(PipelineError::StagingCorrupt(format!(
                    "entries out of order at {}",
                    file_id
                )));
            }

            manifest.push(ManifestEntry {
                checksum: sha256_hex(data),
                file_id,
                path,
                offset,
                length,
            });
        }

        if reader.pos != bytes.len() {
            return Err(PipelineError::StagingCorrupt(format!(
                "{} trailing bytes",
                bytes.len() - reader.pos
            )));
        }

        Ok(Self {
            checksum: sha256_hex(&bytes),
            bytes,
            manifest,
        })
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PipelineError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| PipelineError::StagingCorrupt("truncated container".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, PipelineError> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(raw))
    }

    fn u32(&mut self) -> Result<u32, PipelineError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, PipelineError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self, len: usize) -> Result<String, PipelineError> {
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| PipelineError::StagingCorrupt("entry name is not UTF-8".to_string()))
    }
}

/// Incrementally assembles the container bytes.
struct ContainerWriter {
    bytes: Vec<u8>,
    manifest: Vec<ManifestEntry>,
}

impl ContainerWriter {
    fn new(capacity: u64) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + capacity as usize);
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        // Entry count, patched in finish()
        bytes.extend_from_slice(&0u32.to_le_bytes());
        Self {
            bytes,
            manifest: Vec::new(),
        }
    }

    fn push(&mut self, file: &PlannedFile, data: &[u8]) -> Result<(), PipelineError> {
        let id_len = u16::try_from(file.id.len()).map_err(|_| {
            PipelineError::InvalidListing(format!("file id {} is too long to archive", file.id))
        })?;
        let path_len = u16::try_from(file.path.len()).map_err(|_| {
            PipelineError::InvalidListing(format!("path of {} is too long to archive", file.id))
        })?;

        self.bytes.extend_from_slice(&id_len.to_le_bytes());
        self.bytes.extend_from_slice(file.id.as_bytes());
        self.bytes.extend_from_slice(&path_len.to_le_bytes());
        self.bytes.extend_from_slice(file.path.as_bytes());
        self.bytes
            .extend_from_slice(&(data.len() as u64).to_le_bytes());
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(data);

        self.manifest.push(ManifestEntry {
            file_id: file.id.clone(),
            path: file.path.clone(),
            offset,
            length: data.len() as u64,
            checksum: sha256_hex(data),
        });
        Ok(())
    }

    fn finish(mut self) -> ArchiveBlob {
        let count = self.manifest.len() as u32;
        self.bytes[MAGIC.len() + 1..HEADER_LEN].copy_from_slice(&count.to_le_bytes());
        ArchiveBlob {
            checksum: sha256_hex(&self.bytes),
            bytes: self.bytes,
            manifest: self.manifest,
        }
    }
}

/// How the builder treats files that no longer match their planned snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Any unreadable or resized file aborts the build.
    Strict,
    /// Unreadable or resized files are dropped from the archive; used when a
    /// failed job is rebuilt.
    DropVanished,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub blob: ArchiveBlob,
    /// Planned files left out of the archive, ascending id.
    pub dropped: Vec<FileId>,
}

/// Outcome of comparing a file's size at two points in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Unchanged,
    Changed { expected: u64, actual: u64 },
}

#[inline]
pub fn compare_sizes(expected: u64, actual: u64) -> SizeCheck {
    if expected == actual {
        SizeCheck::Unchanged
    } else {
        SizeCheck::Changed { expected, actual }
    }
}

fn read_unchanged(source: &dyn FileSource, file: &PlannedFile) -> Result<Vec<u8>, String> {
    let before = source.file_size(&file.path).map_err(|e| e.to_string())?;
    if let SizeCheck::Changed { expected, actual } = compare_sizes(file.size_bytes, before) {
        return Err(format!(
            "size changed from {} to {} since planning",
            expected, actual
        ));
    }

    let data = source
        .read_bytes(&file.path, 0..before)
        .map_err(|e| e.to_string())?;

    let after = source.file_size(&file.path).map_err(|e| e.to_string())?;
    if let SizeCheck::Changed { expected, actual } = compare_sizes(before, after) {
        return Err(format!(
            "size changed from {} to {} while reading",
            expected, actual
        ));
    }
    if data.len() as u64 != before {
        return Err(format!(
            "short read: {} of {} bytes",
            data.len(),
            before
        ));
    }

    Ok(data)
}

/// Build the archive for `job` from `source`.
///
/// Entries are written in ascending file id order. Cancellation is checked
/// between files.
pub fn build(
    job: &ArchiveJob,
    source: &dyn FileSource,
    mode: BuildMode,
    cancel: &CancelFlag,
) -> Result<BuildOutput, PipelineError> {
    let mut writer = ContainerWriter::new(job.planned_bytes());
    let mut dropped = Vec::new();

    for file in job.files.values() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match read_unchanged(source, file) {
            Ok(data) => writer.push(file, &data)?,
            Err(reason) => match mode {
                BuildMode::Strict => {
                    return Err(PipelineError::SourceUnreadable {
                        file_id: file.id.clone(),
                        reason,
                    })
                }
                BuildMode::DropVanished => {
                    tracing::warn!(job_id = %job.id, file_id = %file.id, %reason, "dropping file from rebuilt archive");
                    dropped.push(file.id.clone());
                }
            },
        }
    }

    if writer.manifest.is_empty() {
        let file_id = dropped
            .first()
            .cloned()
            .unwrap_or_else(|| "<none>".to_string());
        return Err(PipelineError::SourceUnreadable {
            file_id,
            reason: "no planned file is still readable".to_string(),
        });
    }

    let blob = writer.finish();
    tracing::debug!(
        job_id = %job.id,
        entries = blob.manifest().len(),
        bytes = blob.len(),
        checksum = %blob.checksum(),
        "archive built"
    );
    Ok(BuildOutput { blob, dropped })
}

/// Local directory holding built archives until their upload completes.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.marc", job_id))
    }

    /// Persist `blob` for `job_id`, replacing any previous archive atomically.
    pub fn store(&self, job_id: &str, blob: &ArchiveBlob) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(job_id);
        let tmp = self.dir.join(format!("{}.marc.tmp", job_id));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(blob.bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Reload the staged archive for `job_id`.
    ///
    /// Returns `Ok(None)` when nothing is staged and `StagingCorrupt` when the
    /// file no longer parses or its checksum differs from `expected_checksum`.
    pub fn load(
        &self,
        job_id: &str,
        expected_checksum: &str,
    ) -> Result<Option<ArchiveBlob>, PipelineError> {
        let bytes = match fs::read(self.path_for(job_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let blob = ArchiveBlob::parse(bytes)?;
        if blob.checksum() != expected_checksum {
            return Err(PipelineError::StagingCorrupt(format!(
                "staged archive checksum {} does not match {}",
                blob.checksum(),
                expected_checksum
            )));
        }
        Ok(Some(blob))
    }

    pub fn remove(&self, job_id: &str) -> Result<(), PipelineError> {
        match fs::remove_file(self.path_for(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
