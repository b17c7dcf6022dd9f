//! File catalog: normalizes raw file-source listings into `MediaFile` records.
//!
//! A catalog holds one immutable scan snapshot. Ingesting a new listing
//! validates every record first and then swaps the snapshot, so readers never
//! observe a half-applied rescan.

use crate::error::PipelineError;
use crate::job::FileId;
use media_archive_config::ArchivePolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Photo file extensions (case-insensitive matching).
pub const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "gif", "webp", "dng", "raw",
];

/// Video file extensions (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "mkv", "avi", "3gp", "webm", "ts", "m2ts",
];

/// Record as returned by a file source, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileRecord {
    /// Stable identifier supplied by the source, if it has one.
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
    pub size: i64,
    pub created_at: i64,
    pub modified_at: i64,
    #[serde(default)]
    pub accessed_at: Option<i64>,
}

/// Broad media category derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Other,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Photo => write!(f, "photo"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Other => write!(f, "other"),
        }
    }
}

/// Classify a path by its extension.
pub fn classify_kind(path: &str) -> MediaKind {
    let name = file_name(path);
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => return MediaKind::Other,
    };

    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Photo
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

/// Snapshot of a device file at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: FileId,
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub kind: MediaKind,
    pub created_at: i64,
    pub modified_at: i64,
    pub last_accessed_at: Option<i64>,
}

impl MediaFile {
    /// Last access, or last modification when the source does not track access.
    pub fn last_used_at(&self) -> i64 {
        self.last_accessed_at.unwrap_or(self.modified_at)
    }

    fn folder(&self) -> &str {
        let mut parts = path_components(&self.path);
        parts.next_back();
        parts.next_back().unwrap_or("/")
    }
}

/// Stable id for a record without one: hash of its path.
pub fn derive_file_id(path: &str) -> FileId {
    let digest = Sha256::digest(path.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

fn path_components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split(|c: char| c == '/' || c == '\\').filter(|part| !part.is_empty())
}

fn file_name(path: &str) -> &str {
    path_components(path).next_back().unwrap_or("")
}

fn normalize(record: RawFileRecord) -> Result<MediaFile, PipelineError> {
    let id = match record.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ if !record.path.trim().is_empty() => derive_file_id(&record.path),
        _ => {
            return Err(PipelineError::InvalidListing(
                "record has neither an id nor a path".to_string(),
            ))
        }
    };

    if record.size < 0 {
        return Err(PipelineError::InvalidListing(format!(
            "record {} has negative size {}",
            id, record.size
        )));
    }

    Ok(MediaFile {
        name: file_name(&record.path).to_string(),
        kind: classify_kind(&record.path),
        size_bytes: record.size as u64,
        created_at: record.created_at,
        modified_at: record.modified_at,
        last_accessed_at: record.accessed_at,
        path: record.path,
        id,
    })
}

/// Composable filter over catalog entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePredicate {
    /// Reference time for age checks.
    pub now_ms: i64,
    /// Keep files whose last use is strictly older than this.
    pub min_age_ms: Option<i64>,
    /// Keep files strictly larger than this.
    pub min_size_bytes: Option<u64>,
    pub excluded_prefixes: BTreeSet<String>,
    pub excluded_folders: BTreeSet<String>,
}

impl FilePredicate {
    /// Matches every file.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn older_than_days(mut self, days: u32, now_ms: i64) -> Self {
        self.now_ms = now_ms;
        self.min_age_ms = Some(i64::from(days) * MS_PER_DAY);
        self
    }

    pub fn larger_than(mut self, bytes: u64) -> Self {
        self.min_size_bytes = Some(bytes);
        self
    }

    pub fn excluding_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_prefixes.insert(prefix.into());
        self
    }

    pub fn excluding_folder(mut self, folder: impl Into<String>) -> Self {
        self.excluded_folders.insert(folder.into());
        self
    }

    /// Eligibility predicate of an archive policy.
    pub fn from_policy(policy: &ArchivePolicy, now_ms: i64) -> Self {
        let mut predicate = Self::any()
            .older_than_days(policy.age_threshold_days, now_ms)
            .larger_than(policy.min_file_size_bytes);
        predicate.excluded_prefixes = policy.excluded_path_prefixes.clone();
        predicate.excluded_folders = policy.excluded_folders.clone();
        predicate
    }

    pub fn matches(&self, file: &MediaFile) -> bool {
        if let Some(min_age) = self.min_age_ms {
            if self.now_ms.saturating_sub(file.last_used_at()) <= min_age {
                return false;
            }
        }

        if let Some(min_size) = self.min_size_bytes {
            if file.size_bytes <= min_size {
                return false;
            }
        }

        if self
            .excluded_prefixes
            .iter()
            .any(|prefix| file.path.starts_with(prefix.as_str()))
        {
            return false;
        }

        if !self.excluded_folders.is_empty() {
            let mut dirs = path_components(&file.path);
            dirs.next_back();
            if dirs.any(|dir| self.excluded_folders.contains(dir)) {
                return false;
            }
        }

        true
    }
}

/// Lazy, restartable view over one catalog snapshot.
///
/// The view pins the snapshot it was created from, so iterating again after a
/// rescan still yields the original files.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    snapshot: Arc<Vec<MediaFile>>,
    predicate: FilePredicate,
}

impl CatalogQuery {
    pub fn iter(&self) -> Matches<'_> {
        Matches {
            inner: self.snapshot.iter(),
            predicate: &self.predicate,
        }
    }
}

impl<'a> IntoIterator for &'a CatalogQuery {
    type Item = &'a MediaFile;
    type IntoIter = Matches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the files matching a `CatalogQuery`.
pub struct Matches<'a> {
    inner: std::slice::Iter<'a, MediaFile>,
    predicate: &'a FilePredicate,
}

impl<'a> Iterator for Matches<'a> {
    type Item = &'a MediaFile;

    fn next(&mut self) -> Option<Self::Item> {
        let predicate = self.predicate;
        self.inner.by_ref().find(|file| predicate.matches(file))
    }
}

/// Per-folder totals for the scan summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    pub name: String,
    pub count: usize,
    pub bytes: u64,
}

/// Aggregate view of a scan, as shown after scanning a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_files: usize,
    pub total_bytes: u64,
    /// Files unused for longer than the age threshold.
    pub stale_files: usize,
    pub stale_bytes: u64,
    pub photos: usize,
    pub videos: usize,
    pub others: usize,
    /// Largest folders first.
    pub folders: Vec<FolderSummary>,
}

/// In-memory catalog of the latest scan.
#[derive(Debug, Default)]
pub struct FileCatalog {
    snapshot: RwLock<Arc<Vec<MediaFile>>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole catalog with a new listing.
    ///
    /// Every record is validated before anything is replaced; on error the
    /// previous snapshot stays in place. Returns the number of files ingested.
    pub fn ingest(&self, listing: Vec<RawFileRecord>) -> Result<usize, PipelineError> {
        let mut seen = HashSet::with_capacity(listing.len());
        let mut files = Vec::with_capacity(listing.len());

        for record in listing {
            let file = normalize(record)?;
            if !seen.insert(file.id.clone()) {
                return Err(PipelineError::InvalidListing(format!(
                    "duplicate file id {}",
                    file.id
                )));
            }
            files.push(file);
        }

        let count = files.len();
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(files);
        Ok(count)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Vec<MediaFile>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<MediaFile> {
        self.snapshot().iter().find(|f| f.id == id).cloned()
    }

    pub fn query(&self, predicate: FilePredicate) -> CatalogQuery {
        CatalogQuery {
            snapshot: self.snapshot(),
            predicate,
        }
    }

    /// Summarize the current snapshot against an age threshold.
    pub fn summarize(&self, age_threshold_days: u32, now_ms: i64) -> ScanSummary {
        let snapshot = self.snapshot();
        let stale = FilePredicate::any().older_than_days(age_threshold_days, now_ms);
        let mut summary = ScanSummary::default();
        let mut folders: BTreeMap<&str, (usize, u64)> = BTreeMap::new();

        for file in snapshot.iter() {
            summary.total_files += 1;
            summary.total_bytes += file.size_bytes;
            if stale.matches(file) {
                summary.stale_files += 1;
                summary.stale_bytes += file.size_bytes;
            }
            match file.kind {
                MediaKind::Photo => summary.photos += 1,
                MediaKind::Video => summary.videos += 1,
                MediaKind::Other => summary.others += 1,
            }
            let entry = folders.entry(file.folder()).or_default();
            entry.0 += 1;
            entry.1 += file.size_bytes;
        }

        summary.folders = folders
            .into_iter()
            .map(|(name, (count, bytes))| FolderSummary {
                name: name.to_string(),
                count,
                bytes,
            })
            .collect();
        summary
            .folders
            .sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));
        summary
    }
}

/// Format a byte count with a binary unit, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let mut text = format!("{:.2}", value);
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    format!("{} {}", text, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{media_file, raw_record, DAY_MS, NOW_MS};
    use proptest::prelude::*;

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind("/DCIM/Camera/IMG_001.JPG"), MediaKind::Photo);
        assert_eq!(classify_kind("/DCIM/Camera/clip.MoV"), MediaKind::Video);
        assert_eq!(classify_kind("/Download/report.pdf"), MediaKind::Other);
        assert_eq!(classify_kind("/Download/.jpg"), MediaKind::Other);
        assert_eq!(classify_kind("/Download/noext"), MediaKind::Other);
    }

    #[test]
    fn test_ingest_normalizes_records() {
        let catalog = FileCatalog::new();
        let count = catalog
            .ingest(vec![raw_record(Some("f1"), "/DCIM/Camera/a.jpg", 100, 40)])
            .unwrap();

        assert_eq!(count, 1);
        let file = catalog.get("f1").unwrap();
        assert_eq!(file.name, "a.jpg");
        assert_eq!(file.kind, MediaKind::Photo);
        assert_eq!(file.size_bytes, 100);
        assert_eq!(file.last_accessed_at, Some(NOW_MS - 40 * DAY_MS));
    }

    #[test]
    fn test_ingest_derives_stable_ids_from_path() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![raw_record(None, "/DCIM/Camera/a.jpg", 100, 40)])
            .unwrap();
        let first = catalog.snapshot()[0].id.clone();

        catalog
            .ingest(vec![raw_record(None, "/DCIM/Camera/a.jpg", 150, 1)])
            .unwrap();
        let second = catalog.snapshot()[0].id.clone();

        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert_eq!(first, derive_file_id("/DCIM/Camera/a.jpg"));
    }

    #[test]
    fn test_invalid_listing_leaves_catalog_untouched() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![raw_record(Some("keep"), "/DCIM/keep.jpg", 10, 1)])
            .unwrap();

        let negative = catalog.ingest(vec![
            raw_record(Some("ok"), "/DCIM/ok.jpg", 10, 1),
            raw_record(Some("bad"), "/DCIM/bad.jpg", -1, 1),
        ]);
        assert!(matches!(negative, Err(PipelineError::InvalidListing(_))));

        let anonymous = catalog.ingest(vec![raw_record(None, "  ", 10, 1)]);
        assert!(matches!(anonymous, Err(PipelineError::InvalidListing(_))));

        let duplicate = catalog.ingest(vec![
            raw_record(Some("dup"), "/DCIM/a.jpg", 10, 1),
            raw_record(Some("dup"), "/DCIM/b.jpg", 10, 1),
        ]);
        assert!(matches!(duplicate, Err(PipelineError::InvalidListing(_))));

        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("keep").is_some());
    }

    #[test]
    fn test_rescan_replaces_wholesale() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![
                raw_record(Some("a"), "/DCIM/a.jpg", 10, 1),
                raw_record(Some("b"), "/DCIM/b.jpg", 10, 1),
            ])
            .unwrap();
        catalog
            .ingest(vec![raw_record(Some("c"), "/DCIM/c.jpg", 10, 1)])
            .unwrap();

        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("a").is_none());
        assert!(catalog.get("c").is_some());
    }

    #[test]
    fn test_query_composes_predicates() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![
                raw_record(Some("old-big"), "/DCIM/Camera/a.mp4", 5_000, 90),
                raw_record(Some("old-small"), "/DCIM/Camera/b.jpg", 50, 90),
                raw_record(Some("new-big"), "/DCIM/Camera/c.mp4", 5_000, 2),
                raw_record(Some("shot"), "/Pictures/Screenshots/d.png", 5_000, 90),
                raw_record(Some("private"), "/Android/data/e.mp4", 5_000, 90),
            ])
            .unwrap();

        let predicate = FilePredicate::any()
            .older_than_days(30, NOW_MS)
            .larger_than(100)
            .excluding_folder("Screenshots")
            .excluding_prefix("/Android");
        let ids: Vec<_> = catalog
            .query(predicate)
            .iter()
            .map(|f| f.id.clone())
            .collect();

        assert_eq!(ids, vec!["old-big".to_string()]);
    }

    #[test]
    fn test_age_falls_back_to_modified_time() {
        let mut record = raw_record(Some("a"), "/DCIM/a.jpg", 10, 0);
        record.accessed_at = None;
        record.modified_at = NOW_MS - 60 * DAY_MS;
        let catalog = FileCatalog::new();
        catalog.ingest(vec![record]).unwrap();

        let stale = catalog.query(FilePredicate::any().older_than_days(30, NOW_MS));
        assert_eq!(stale.iter().count(), 1);
    }

    #[test]
    fn test_age_saturates_on_extreme_timestamps() {
        let predicate = FilePredicate::any().older_than_days(30, NOW_MS);

        let mut ancient = media_file("a", "/DCIM/a.jpg", 10, 0);
        ancient.last_accessed_at = Some(i64::MIN);
        assert!(predicate.matches(&ancient));

        let mut future = media_file("b", "/DCIM/b.jpg", 10, 0);
        future.last_accessed_at = Some(i64::MAX);
        assert!(!predicate.matches(&future));

        let far_future = FilePredicate::any().older_than_days(30, i64::MAX);
        assert!(far_future.matches(&ancient));
    }

    #[test]
    fn test_query_is_restartable_and_pinned_to_snapshot() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![
                raw_record(Some("a"), "/DCIM/a.jpg", 10, 1),
                raw_record(Some("b"), "/DCIM/b.jpg", 10, 1),
            ])
            .unwrap();

        let query = catalog.query(FilePredicate::any());
        assert_eq!(query.iter().count(), 2);

        catalog.ingest(Vec::new()).unwrap();
        assert_eq!(query.iter().count(), 2);
        assert_eq!((&query).into_iter().count(), 2);
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_summarize_groups_by_folder() {
        let catalog = FileCatalog::new();
        catalog
            .ingest(vec![
                raw_record(Some("a"), "/DCIM/Camera/a.jpg", 100, 40),
                raw_record(Some("b"), "/DCIM/Camera/b.mp4", 300, 2),
                raw_record(Some("c"), "/WhatsApp/Media/c.jpg", 500, 40),
                raw_record(Some("d"), "/Download/d.pdf", 50, 100),
            ])
            .unwrap();

        let summary = catalog.summarize(30, NOW_MS);

        assert_eq!(summary.total_files, 4);
        assert_eq!(summary.total_bytes, 950);
        assert_eq!(summary.stale_files, 3);
        assert_eq!(summary.stale_bytes, 650);
        assert_eq!((summary.photos, summary.videos, summary.others), (2, 1, 1));
        assert_eq!(summary.folders[0].name, "Media");
        assert_eq!(summary.folders[0].bytes, 500);
        assert_eq!(summary.folders[1].name, "Camera");
        assert_eq!(summary.folders[1].count, 2);
        assert_eq!(summary.folders[2].name, "Download");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(890 * 1024 * 1024), "890 MB");
        assert_eq!(format_bytes(1288490189), "1.2 GB");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_min_size_is_strict(size in 0u64..10_000, threshold in 0u64..10_000) {
            let catalog = FileCatalog::new();
            catalog.ingest(vec![raw_record(Some("a"), "/DCIM/a.jpg", size as i64, 1)]).unwrap();

            let matched = catalog.query(FilePredicate::any().larger_than(threshold)).iter().count();
            prop_assert_eq!(matched == 1, size > threshold);
        }
    }
}
