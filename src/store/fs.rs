//! Local filesystem backend
//!
//! [`FsStore`] treats a directory on a mounted filesystem as an object store.
//! Object paths map one-to-one onto files below the store root.
//!
//! ## Hash cache
//!
//! Hashing file content dominates the cost of scanning a large tree. Before
//! a scan, the newest snapshot persisted in this store (if any) is loaded
//! once. A file whose relative path appears in that snapshot with the same
//! size reuses the recorded hash instead of being read again; any size change
//! forces a fresh hash. Files that cannot be stat'ed or read are logged and
//! left out of the scan instead of failing it.

use crate::error::{Result, VaultError};
use crate::snapshot::SnapshotMetadata;
use crate::store::{is_snapshot_file, ObjectStore, OpenMode, StoreFile};
use crate::types::{Entries, FileFingerprint, ScanStats};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

/// Object store backed by a local directory
#[derive(Debug)]
pub struct FsStore {
    /// Root of the store namespace
    root: PathBuf,
    /// Tree below the root that gets scanned
    prefix: String,
    /// Statistics of the most recent scan
    last_scan: Mutex<ScanStats>,
}

impl FsStore {
    /// Create a store rooted at `root` whose synchronised tree is `root/prefix`
    ///
    /// An empty prefix scans the whole root. Persisted snapshot files in the
    /// root are never part of a scan.
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let prefix = if prefix.trim_matches('/').is_empty() {
            String::new()
        } else {
            utils::normalize_relative(prefix)?
        };

        Ok(Self {
            root: root.into(),
            prefix,
            last_scan: Mutex::new(ScanStats::default()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the synchronised tree
    pub fn tree_dir(&self) -> PathBuf {
        if self.prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.prefix)
        }
    }

    /// Statistics of the most recent [`FsStore::scan`]
    pub fn last_scan_stats(&self) -> ScanStats {
        *self.last_scan.lock()
    }

    /// Resolve an object path to its location on disk
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(utils::normalize_relative(path)?))
    }

    /// Walk the tree and fingerprint every regular file
    pub fn scan(&self) -> Result<(Entries, ScanStats)> {
        let start = Instant::now();
        let previous = match SnapshotMetadata::load_latest(self) {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Ignoring unreadable previous snapshot in {:?}: {}", self.root, e);
                None
            }
        };
        if let Some(previous) = &previous {
            debug!(
                "Reusing hashes from snapshot {} ({} entries)",
                previous.file_name(),
                previous.len()
            );
        }

        let mut entries = Entries::new();
        let mut stats = ScanStats::default();
        let tree = self.tree_dir();
        if !tree.exists() {
            debug!("Tree {:?} does not exist, nothing to scan", tree);
            *self.last_scan.lock() = stats;
            return Ok((entries, stats));
        }

        for entry in WalkDir::new(&tree).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Error walking {:?}, skipping: {}", tree, e);
                    stats.files_skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let key = match utils::make_relative(path, &self.root)
                .ok()
                .and_then(|relative| utils::path_to_key(&relative))
            {
                Some(key) => key,
                None => {
                    warn!("Skipping file with unrepresentable path {:?}", path);
                    stats.files_skipped += 1;
                    continue;
                }
            };
            if self.prefix.is_empty() && is_snapshot_file(&key) {
                continue;
            }
            stats.files_seen += 1;

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    error!("Error stating {:?} while collecting fingerprints, skipping: {}", path, e);
                    stats.files_skipped += 1;
                    continue;
                }
            };
            let size = metadata.len();
            let mtime = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();

            let cached = previous
                .as_ref()
                .and_then(|previous| previous.get(&key))
                .filter(|cached| cached.size() == size)
                .map(|cached| cached.hash().to_string());

            let hash = match cached {
                Some(hash) => {
                    stats.hashes_reused += 1;
                    hash
                }
                None => match utils::hash_file_content(path) {
                    Ok(hash) => {
                        stats.files_hashed += 1;
                        trace!("Hashed {} ({} bytes)", key, size);
                        hash
                    }
                    Err(e) => {
                        error!("Error reading {:?} to hash it, skipping: {}", path, e);
                        stats.files_skipped += 1;
                        continue;
                    }
                },
            };

            entries.insert(key.clone(), FileFingerprint::new(key, size, mtime, hash));
        }

        info!(
            "Scanned {:?}: {} files, {} hashed, {} cached, {} skipped in {}",
            tree,
            stats.files_seen,
            stats.files_hashed,
            stats.hashes_reused,
            stats.files_skipped,
            utils::format_elapsed(start.elapsed())
        );
        *self.last_scan.lock() = stats;
        Ok((entries, stats))
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::copy(from, to)?)
}

impl ObjectStore for FsStore {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        match fs::remove_file(&full_path) {
            Ok(()) => {
                trace!("Deleted {:?}", full_path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn upload(&self, relative_path: &str, base_dir: &Path) -> Result<u64> {
        let key = utils::normalize_relative(relative_path)?;
        let bytes = copy_file(&base_dir.join(&key), &self.root.join(&key))?;
        trace!("Copied {} into {:?} ({} bytes)", key, self.root, bytes);
        Ok(bytes)
    }

    fn download(&self, relative_path: &str, dest_dir: &Path) -> Result<u64> {
        let key = utils::normalize_relative(relative_path)?;
        let source = self.root.join(&key);
        if !source.is_file() {
            return Err(VaultError::NotFound(key));
        }
        let bytes = copy_file(&source, &dest_dir.join(&key))?;
        trace!("Copied {} out of {:?} ({} bytes)", key, self.root, bytes);
        Ok(bytes)
    }

    fn collect_fingerprints(&self) -> Result<Entries> {
        self.scan().map(|(entries, _)| entries)
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let path = match dir {
            "" => self.root.clone(),
            dir => self.full_path(dir)?,
        };
        let dir = match fs::read_dir(&path) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<StoreFile<'_>> {
        let full_path = self.full_path(path)?;
        if mode.is_writable() {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = mode.open(&full_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => VaultError::NotFound(path.to_string()),
            _ => VaultError::Io(e),
        })?;
        Ok(StoreFile::direct(path, file))
    }
}
