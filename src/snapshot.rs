//! Snapshot metadata and retention
//!
//! A [`SnapshotMetadata`] is the complete fingerprint set of one store at one
//! point in time. Snapshots are compared with [`SnapshotMetadata::diff`] to
//! decide what to transfer, persisted beside the tree in `<prefix>.snapshots/`
//! as `YYYY_MM_DD_HHMM.snapshot` to mark a completed run, and combined by
//! [`RetentionPlan`] to decide what remote content may be deleted.
//!
//! ## Persisted format
//!
//! Snapshots are stored as JSON:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "captured_at": "2024-03-01T02:30:00Z",
//!   "entries": [
//!     {"path": "v_node0001/nightly/a.fdb", "size": 12, "mtime": "...", "hash": "..."}
//!   ]
//! }
//! ```
//!
//! Entries are written sorted by path so identical snapshots produce
//! identical files. Names encode the capture time in UTC with minute
//! resolution and are fixed width, so lexical order is chronological order.
//!
//! ## Diff semantics
//!
//! `a.diff(b)` is directional: `additions` are paths `b` lacks or holds with a
//! different fingerprint, `deletions` are paths only `b` has. Using the local
//! scan as `a` and the remote listing as `b` yields the upload set; using a
//! remote snapshot as `a` and the local scan as `b` yields the download and
//! local delete sets.

use crate::error::{Result, VaultError};
use crate::store::{ObjectStore, OpenMode, SNAPSHOT_EXTENSION};
use crate::types::{Entries, FileFingerprint, SnapshotDiff};
use crate::utils;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Format of the timestamp part of a snapshot name
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y_%m_%d_%H%M";

/// Current version of the persisted snapshot format
pub const FORMAT_VERSION: u32 = 1;

/// File name a snapshot captured at `captured_at` is persisted under
pub fn snapshot_file_name(captured_at: DateTime<Utc>) -> String {
    format!(
        "{}.{}",
        captured_at.format(SNAPSHOT_NAME_FORMAT),
        SNAPSHOT_EXTENSION
    )
}

/// Recover the capture time encoded in a snapshot file name
///
/// Accepts the name with or without its extension.
pub fn parse_snapshot_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name
        .strip_suffix(SNAPSHOT_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .unwrap_or(name);
    NaiveDateTime::parse_from_str(stem, SNAPSHOT_NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    format_version: u32,
    captured_at: DateTime<Utc>,
    entries: Vec<&'a FileFingerprint>,
}

#[derive(Deserialize)]
struct SnapshotFile {
    format_version: u32,
    captured_at: DateTime<Utc>,
    entries: Vec<FileFingerprint>,
}

/// Fingerprints of every file in a tree at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    captured_at: DateTime<Utc>,
    entries: Entries,
}

impl SnapshotMetadata {
    /// Create an empty snapshot
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            entries: Entries::new(),
        }
    }

    /// Create a snapshot from an existing mapping
    pub fn with_entries(captured_at: DateTime<Utc>, entries: Entries) -> Self {
        Self {
            captured_at,
            entries,
        }
    }

    /// Capture the current state of a store
    pub fn from_store(store: &dyn ObjectStore, captured_at: DateTime<Utc>) -> Result<Self> {
        let start = Instant::now();
        let entries = store.collect_fingerprints()?;
        info!(
            "Collected {} metadata for {} files in {}",
            store.kind(),
            entries.len(),
            utils::format_elapsed(start.elapsed())
        );
        Ok(Self::with_entries(captured_at, entries))
    }

    /// When this snapshot was captured
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// All fingerprints keyed by path
    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// Fingerprint of one path
    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.entries.get(path)
    }

    /// Check if a path is part of the snapshot
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the snapshot has no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all files in bytes
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(FileFingerprint::size).sum()
    }

    /// Add or replace one fingerprint
    pub fn insert(&mut self, fingerprint: FileFingerprint) {
        self.entries
            .insert(fingerprint.path().to_string(), fingerprint);
    }

    /// Name this snapshot is persisted under
    pub fn file_name(&self) -> String {
        snapshot_file_name(self.captured_at)
    }

    /// Directional diff against `other`
    ///
    /// Runs in a single pass over `self`, consuming a working copy of
    /// `other`'s key set. A path present in both with different fingerprints
    /// lands in `additions` and is logged: it usually means an earlier upload
    /// was interrupted.
    pub fn diff(&self, other: &SnapshotMetadata) -> SnapshotDiff {
        let mut additions = HashSet::new();
        let mut remaining: HashSet<&str> = other.entries.keys().map(String::as_str).collect();

        for (path, fingerprint) in &self.entries {
            if !remaining.remove(path.as_str()) {
                additions.insert(path.clone());
                continue;
            }
            if other.entries.get(path) != Some(fingerprint) {
                warn!("{} is in both snapshots but the files differ", path);
                additions.insert(path.clone());
            }
        }

        SnapshotDiff {
            additions,
            deletions: remaining.into_iter().map(str::to_string).collect(),
        }
    }

    /// Overlay `other`'s fingerprints onto this snapshot
    ///
    /// On a path collision the fingerprint from `other` wins.
    pub fn merge(&mut self, other: &SnapshotMetadata) {
        self.entries.extend(
            other
                .entries
                .iter()
                .map(|(path, fingerprint)| (path.clone(), fingerprint.clone())),
        );
    }

    /// Encode as the persisted JSON form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<&FileFingerprint> = self.entries.values().collect();
        entries.sort_unstable_by(|a, b| a.path().cmp(b.path()));
        let file = SnapshotFileRef {
            format_version: FORMAT_VERSION,
            captured_at: self.captured_at,
            entries,
        };
        Ok(serde_json::to_vec(&file)?)
    }

    /// Decode the persisted JSON form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let file: SnapshotFile = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::InvalidSnapshot(format!("undecodable snapshot: {}", e)))?;
        if file.format_version != FORMAT_VERSION {
            return Err(VaultError::InvalidSnapshot(format!(
                "unsupported format version {}",
                file.format_version
            )));
        }

        let mut entries = Entries::with_capacity(file.entries.len());
        for fingerprint in file.entries {
            let path = fingerprint.path().to_string();
            if entries.insert(path.clone(), fingerprint).is_some() {
                return Err(VaultError::InvalidSnapshot(format!(
                    "duplicate entry for {}",
                    path
                )));
            }
        }

        Ok(Self::with_entries(file.captured_at, entries))
    }

    /// Persist into the snapshot directory of `store`, returning the file name used
    ///
    /// The content is encoded before the store handle is opened so an
    /// encoding failure never leaves a truncated snapshot behind.
    pub fn save(&self, store: &dyn ObjectStore) -> Result<String> {
        let name = self.file_name();
        let bytes = self.to_bytes()?;

        let mut handle = store.open(&store.snapshot_path(&name), OpenMode::Write)?;
        handle.write_all(&bytes)?;
        handle.close()?;

        debug!("Saved snapshot {} ({} entries) to {} store", name, self.len(), store.kind());
        Ok(name)
    }

    /// Load a persisted snapshot by file name
    pub fn load(store: &dyn ObjectStore, name: &str) -> Result<Self> {
        let mut handle = store.open(&store.snapshot_path(name), OpenMode::Read)?;
        let mut bytes = Vec::new();
        handle.read_to_end(&mut bytes)?;
        handle.close()?;

        Self::from_bytes(&bytes).map_err(|e| match e {
            VaultError::InvalidSnapshot(msg) => VaultError::InvalidSnapshot(format!("{}: {}", name, msg)),
            other => other,
        })
    }

    /// Load the newest persisted snapshot, if any
    pub fn load_latest(store: &dyn ObjectStore) -> Result<Option<Self>> {
        match store.list_snapshot_files()?.first() {
            Some(name) => Self::load(store, name).map(Some),
            None => Ok(None),
        }
    }
}

/// What retention keeps and deletes in a remote store
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    /// Snapshot files whose contents are retained, newest first
    pub retained: Vec<String>,
    /// Paths referenced by a retained snapshot but missing from the store
    pub should_be_empty: Vec<String>,
    /// Paths in the store referenced by no retained snapshot
    pub to_delete: Vec<String>,
}

impl RetentionPlan {
    /// Plan retention for the `retain` newest snapshots persisted in `store`
    ///
    /// `full` is a listing of every object currently in the store's prefix.
    pub fn compute(store: &dyn ObjectStore, retain: usize, full: &SnapshotMetadata) -> Result<Self> {
        let names: Vec<String> = store
            .list_snapshot_files()?
            .into_iter()
            .take(retain)
            .collect();

        let mut snapshots = Vec::with_capacity(names.len());
        for name in &names {
            snapshots.push(SnapshotMetadata::load(store, name)?);
        }

        let mut plan = Self::from_snapshots(&snapshots, full);
        plan.retained = names;
        Ok(plan)
    }

    /// Plan retention from already loaded snapshots, newest first
    ///
    /// Snapshots are unioned in the order given; a path present in several
    /// of them keeps the fingerprint of the last (oldest) one.
    pub fn from_snapshots(snapshots: &[SnapshotMetadata], full: &SnapshotMetadata) -> Self {
        let mut combined = SnapshotMetadata::new(full.captured_at());
        for snapshot in snapshots {
            combined.merge(snapshot);
        }

        let diff = combined.diff(full);
        let plan = Self {
            retained: snapshots.iter().map(SnapshotMetadata::file_name).collect(),
            should_be_empty: diff.sorted_additions().into_iter().map(str::to_string).collect(),
            to_delete: diff.sorted_deletions().into_iter().map(str::to_string).collect(),
        };

        if !plan.should_be_empty.is_empty() {
            error!(
                "Found {} files in the {} combined retained snapshots that are not in the store: {:?}",
                plan.should_be_empty.len(),
                snapshots.len(),
                plan.should_be_empty
            );
        }
        plan
    }

    /// Whether any retained file is missing from the store
    pub fn has_integrity_errors(&self) -> bool {
        !self.should_be_empty.is_empty()
    }
}

/// Delete all but the `keep` newest persisted snapshots, returning how many went
pub fn prune_snapshots(store: &dyn ObjectStore, keep: usize) -> Result<usize> {
    let names = store.list_snapshot_files()?;
    let mut pruned = 0;
    for name in names.iter().skip(keep) {
        debug!("Pruning snapshot {} from {} store", name, store.kind());
        store.delete(&store.snapshot_path(name))?;
        pruned += 1;
    }
    if pruned > 0 {
        info!("Pruned {} old snapshots from {} store", pruned, store.kind());
    }
    Ok(pruned)
}
