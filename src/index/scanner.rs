//! Filesystem scanner for the content root.
//!
//! Walks the root recursively, deriving ownership from two kinds of files:
//! metadata-bearing `.osu` files (line-parsed `[Metadata]` section) and
//! archive-only `.osz` files (set id from the leading digits of the
//! filename). Unreadable or malformed files are skipped with a warning and
//! never abort the walk.
//!
//! The scan writes through to the [`Store`](super::store::Store): each
//! attributed file is upserted, progress is updated every few files, and
//! stale rows not backed by a scanned file are pruned at the end.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use super::metadata::{parse_metadata_text, record_from_archive_stem, RecordSource, SetRecord};
use super::store::Store;

/// Progress rows are written once per this many processed files.
const PROGRESS_EVERY: usize = 10;

/// Extensions the scanner attributes ownership from.
#[derive(Debug, Clone)]
pub struct ScanExtensions {
    /// Metadata-bearing text files.
    pub metadata: Vec<String>,
    /// Archive files attributed by filename only.
    pub archive: Vec<String>,
}

impl Default for ScanExtensions {
    fn default() -> Self {
        Self {
            metadata: vec!["osu".to_string()],
            archive: vec!["osz".to_string()],
        }
    }
}

/// Result of one filesystem scan pass.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub owned: HashSet<u64>,
    pub metadata: HashMap<u64, SetRecord>,
    pub files_seen: usize,
}

/// Scan `root` synchronously, writing rows and progress through `store`.
///
/// Blocking; run via `spawn_blocking` from async callers. A missing root is
/// created rather than treated as fatal (first run against a fresh content
/// directory). Only an unrecoverable root failure returns `Err`.
pub fn scan_content_root(
    root: &Path,
    extensions: &ScanExtensions,
    store: &Store,
) -> anyhow::Result<ScanResult> {
    if !root.exists() {
        fs::create_dir_all(root)?;
    }

    let mut files = Vec::new();
    collect_files(root, extensions, &mut files)?;
    store.start_scan(files.len() as u64)?;
    debug!(root = %root.display(), files = files.len(), "content scan started");

    let mut result = ScanResult {
        files_seen: files.len(),
        ..Default::default()
    };
    let mut valid_paths: Vec<String> = Vec::with_capacity(files.len());

    for (i, path) in files.iter().enumerate() {
        if i % PROGRESS_EVERY == 0 {
            store.update_progress(i as u64, Some(&path.display().to_string()))?;
        }
        valid_paths.push(path.display().to_string());

        match process_file(path, extensions, store) {
            Ok(Some(Attribution::Metadata(record))) => {
                result.owned.insert(record.set_id);
                // Full metadata from a `.osu` file overrides anything a
                // filename yielded earlier.
                result.metadata.insert(record.set_id, record);
            }
            Ok(Some(Attribution::FromName(record))) => {
                result.owned.insert(record.set_id);
                result.metadata.entry(record.set_id).or_insert(record);
            }
            Ok(None) => {}
            Err(err) => {
                // Per-file failures are skipped, not fatal to the walk.
                warn!(path = %path.display(), error = %err, "skipping unreadable file");
            }
        }
    }

    let deleted = store.delete_not_in(&valid_paths)?;
    if deleted > 0 {
        debug!(deleted, "pruned stale catalog rows");
    }

    store.update_progress(files.len() as u64, None)?;
    store.complete_scan()?;
    Ok(result)
}

/// How a file contributed to ownership.
enum Attribution {
    /// Record parsed from a metadata-bearing file.
    Metadata(SetRecord),
    /// Record derived from an archive filename only.
    FromName(SetRecord),
}

/// Attribute one file, writing the row through to the store.
fn process_file(
    path: &Path,
    extensions: &ScanExtensions,
    store: &Store,
) -> anyhow::Result<Option<Attribution>> {
    let Some(ext) = extension_of(path) else {
        return Ok(None);
    };

    if extensions.archive.iter().any(|e| *e == ext) {
        let Some(stem) = path.file_stem().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        // Archives without leading digits cannot be attributed.
        let Some(record) = record_from_archive_stem(stem) else {
            return Ok(None);
        };
        let meta = fs::metadata(path)?;
        store.upsert(&record, &path.display().to_string(), meta.len(), mtime_of(&meta))?;
        return Ok(Some(Attribution::FromName(record)));
    }

    if extensions.metadata.iter().any(|e| *e == ext) {
        let content = fs::read_to_string(path)?;
        let parsed = parse_metadata_text(&content);
        let Some(set_id) = parsed.set_id else {
            return Ok(None);
        };
        let record = SetRecord::new(set_id, parsed.artist, parsed.title, parsed.creator)
            .with_source(RecordSource::Filesystem);
        let meta = fs::metadata(path)?;
        store.upsert(&record, &path.display().to_string(), meta.len(), mtime_of(&meta))?;
        return Ok(Some(Attribution::Metadata(record)));
    }

    Ok(None)
}

fn collect_files(
    dir: &Path,
    extensions: &ScanExtensions,
    out: &mut Vec<PathBuf>,
) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            if let Err(err) = collect_files(&path, extensions, out) {
                warn!(dir = %path.display(), error = %err, "skipping unreadable directory");
            }
            continue;
        }
        if let Some(ext) = extension_of(&path) {
            if extensions.metadata.iter().any(|e| *e == ext)
                || extensions.archive.iter().any(|e| *e == ext)
            {
                out.push(path);
            }
        }
    }
    Ok(())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn mtime_of(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::store::ScanState;
    use tempfile::TempDir;

    fn scan(root: &Path, store: &Store) -> ScanResult {
        scan_content_root(root, &ScanExtensions::default(), store).unwrap()
    }

    #[test]
    fn attributes_osz_by_filename() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("100 Artist - Title.osz"), b"zipbytes").unwrap();
        std::fs::write(temp.path().join("no-digits.osz"), b"zipbytes").unwrap();

        let store = Store::open_in_memory().unwrap();
        let result = scan(temp.path(), &store);

        assert_eq!(result.owned, HashSet::from([100]));
        let record = &result.metadata[&100];
        assert_eq!(record.artist, "Artist");
        assert_eq!(record.title, "Title");
        assert_eq!(record.creator, "");
    }

    #[test]
    fn osu_metadata_overrides_archive_filename() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("600 Wrong - Name.osz"), b"zip").unwrap();
        std::fs::write(
            temp.path().join("map.osu"),
            "[Metadata]\nTitle:Real Title\nArtist:Real Artist\nCreator:mapper\nBeatmapSetID:600\n",
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        let result = scan(temp.path(), &store);
        assert_eq!(result.metadata[&600].artist, "Real Artist");
    }

    #[test]
    fn parses_osu_metadata_in_subdirectories() {
        let temp = TempDir::new().unwrap();
        let set_dir = temp.path().join("200 Somebody - Song");
        std::fs::create_dir_all(&set_dir).unwrap();
        std::fs::write(
            set_dir.join("map.osu"),
            "[Metadata]\nTitle:Song\nArtist:Somebody\nCreator:mapper\nBeatmapSetID:200\n",
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        let result = scan(temp.path(), &store);

        assert_eq!(result.owned, HashSet::from([200]));
        let record = &result.metadata[&200];
        assert_eq!(record.artist, "Somebody");
        assert_eq!(record.title, "Song");
        assert_eq!(record.creator, "mapper");
    }

    #[test]
    fn malformed_files_are_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        // Invalid UTF-8 so read_to_string fails.
        std::fs::write(temp.path().join("broken.osu"), [0xff, 0xfe, 0x00]).unwrap();
        std::fs::write(
            temp.path().join("good.osu"),
            "[Metadata]\nTitle:T\nArtist:A\nBeatmapSetID:300\n",
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        let result = scan(temp.path(), &store);
        assert_eq!(result.owned, HashSet::from([300]));
    }

    #[test]
    fn writes_rows_and_completes_status() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("400 x.osz"), b"zip").unwrap();

        let store = Store::open_in_memory().unwrap();
        scan(temp.path(), &store);

        assert!(store.get_all().unwrap().contains_key(&400));
        assert_eq!(store.scan_status().unwrap().state, ScanState::Completed);
    }

    #[test]
    fn rescan_prunes_deleted_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("500 gone.osz");
        std::fs::write(&path, b"zip").unwrap();

        let store = Store::open_in_memory().unwrap();
        scan(temp.path(), &store);
        assert!(store.get_all().unwrap().contains_key(&500));

        std::fs::remove_file(&path).unwrap();
        let result = scan(temp.path(), &store);
        assert!(result.owned.is_empty());
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_created() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("fresh");
        let store = Store::open_in_memory().unwrap();
        let result = scan(&root, &store);
        assert!(result.owned.is_empty());
        assert!(root.exists());
    }
}
