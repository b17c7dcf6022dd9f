//! File source collaborator: lists device files and reads their bytes.
//!
//! The pipeline only sees the `FileSource` trait. `LocalFileSource` is the
//! filesystem-backed implementation used by the daemon: it recursively walks
//! the configured library roots, skipping hidden directories.

use crate::catalog::RawFileRecord;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Access to the files being archived.
///
/// Calls are blocking; the pipeline runs them on the blocking thread pool.
pub trait FileSource: Send + Sync {
    /// Enumerate every file the source knows about.
    fn list_files(&self) -> io::Result<Vec<RawFileRecord>>;

    /// Read the byte range `range` of the file at `path`.
    fn read_bytes(&self, path: &str, range: Range<u64>) -> io::Result<Vec<u8>>;

    /// Current size of the file at `path`.
    fn file_size(&self, path: &str) -> io::Result<u64>;

    /// Delete the file at `path`.
    fn remove_file(&self, path: &str) -> io::Result<()>;
}

/// Files under a set of local library roots.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    roots: Vec<PathBuf>,
}

impl LocalFileSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

fn to_unix_ms(time: io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn record_for(path: &Path, metadata: &fs::Metadata) -> RawFileRecord {
    let modified_at = to_unix_ms(metadata.modified()).unwrap_or(0);
    RawFileRecord {
        id: None,
        path: path.to_string_lossy().to_string(),
        size: metadata.len() as i64,
        created_at: to_unix_ms(metadata.created()).unwrap_or(modified_at),
        modified_at,
        accessed_at: to_unix_ms(metadata.accessed()),
    }
}

impl FileSource for LocalFileSource {
    fn list_files(&self) -> io::Result<Vec<RawFileRecord>> {
        use walkdir::WalkDir;

        let mut records = Vec::new();

        for root in &self.roots {
            if !root.exists() {
                tracing::warn!(root = %root.display(), "library root does not exist, skipping");
                continue;
            }

            let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
                // Skip hidden directories, but allow a hidden root
                if entry.file_type().is_dir() && entry.depth() > 0 {
                    if let Some(name) = entry.file_name().to_str() {
                        return !name.starts_with('.');
                    }
                }
                true
            });

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(metadata) = entry.metadata() {
                    records.push(record_for(entry.path(), &metadata));
                }
            }
        }

        Ok(records)
    }

    fn read_bytes(&self, path: &str, range: Range<u64>) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let len = range.end.saturating_sub(range.start) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn file_size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_list_files_walks_roots_and_skips_hidden_dirs() {
        let dir = TempDir::new().unwrap();
        let camera = dir.path().join("DCIM").join("Camera");
        let hidden = dir.path().join(".thumbnails");
        fs::create_dir_all(&camera).unwrap();
        fs::create_dir_all(&hidden).unwrap();
        fs::write(camera.join("a.jpg"), b"jpeg-bytes").unwrap();
        fs::write(dir.path().join("b.mp4"), b"video").unwrap();
        fs::write(hidden.join("thumb.jpg"), b"x").unwrap();

        let source = LocalFileSource::new(vec![
            dir.path().to_path_buf(),
            dir.path().join("missing"),
        ]);
        let mut records = source.list_files().unwrap();
        records.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(records.len(), 2);
        assert!(records[0].path.ends_with("a.jpg"));
        assert_eq!(records[0].size, 10);
        assert!(records[0].id.is_none());
        assert!(records[0].modified_at > 0);
        assert!(records[1].path.ends_with("b.mp4"));
    }

    #[test]
    fn test_read_bytes_honours_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"0123456789").unwrap();
        let path = path.to_string_lossy().to_string();
        let source = LocalFileSource::new(vec![dir.path().to_path_buf()]);

        assert_eq!(source.read_bytes(&path, 2..6).unwrap(), b"2345");
        assert_eq!(source.file_size(&path).unwrap(), 10);
        assert!(source.read_bytes(&path, 8..20).is_err());
    }

    #[test]
    fn test_remove_file_reports_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.jpg");
        fs::write(&path, b"x").unwrap();
        let path = path.to_string_lossy().to_string();
        let source = LocalFileSource::new(vec![dir.path().to_path_buf()]);

        source.remove_file(&path).unwrap();
        let err = source.remove_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
