//! Core data types used throughout the snapvault library
//!
//! This module contains fundamental data structures that are shared across
//! different components of the library.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File identity**: [`FileFingerprint`], [`Entries`] - one file and a whole tree
//! - **Comparison**: [`SnapshotDiff`] - result of a directional snapshot diff
//! - **Run results**: [`ScanStats`], [`BackupReport`], [`RestoreReport`], [`RunStatus`]
//!
//! ## Examples
//!
//! ```rust
//! use snapvault::types::FileFingerprint;
//! use chrono::Utc;
//!
//! let a = FileFingerprint::new("node/data.fdb", 1024, Utc::now(), "9e107d9d372bb6826bd81d3542a419d6");
//! let b = FileFingerprint::new("node/data.fdb", 1024, Utc::now(), "9e107d9d372bb6826bd81d3542a419d6");
//!
//! // Modification time is not part of a fingerprint's identity
//! assert_eq!(a, b);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Identity record of one file in a tree
///
/// Two fingerprints are equal when `path`, `size` and `hash` match. The
/// modification time is carried along for information only: it is specific
/// to the filesystem a file came from and is not portable to an object
/// store, so it never takes part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFingerprint {
    path: String,
    size: u64,
    mtime: DateTime<Utc>,
    hash: String,
}

impl FileFingerprint {
    /// Create a fingerprint
    pub fn new(
        path: impl Into<String>,
        size: u64,
        mtime: DateTime<Utc>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            hash: hash.into(),
        }
    }

    /// Path relative to the store root
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time as reported by the origin
    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    /// Hex digest of the content
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl PartialEq for FileFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.path == other.path && self.hash == other.hash
    }
}

impl Eq for FileFingerprint {}

/// Mapping of relative path to fingerprint for an entire tree
pub type Entries = HashMap<String, FileFingerprint>;

/// Directional difference between two snapshots
///
/// `additions` must exist in the target and are sourced from the left-hand
/// snapshot; `deletions` exist in the target but the left-hand snapshot says
/// they should not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Paths missing from, or different in, the target
    pub additions: HashSet<String>,
    /// Paths present only in the target
    pub deletions: HashSet<String>,
}

impl SnapshotDiff {
    /// Check if there is nothing to transfer or delete
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Additions in lexical order, for predictable transfer sequencing
    pub fn sorted_additions(&self) -> Vec<&str> {
        sorted(&self.additions)
    }

    /// Deletions in lexical order
    pub fn sorted_deletions(&self) -> Vec<&str> {
        sorted(&self.deletions)
    }
}

fn sorted(set: &HashSet<String>) -> Vec<&str> {
    let mut paths: Vec<&str> = set.iter().map(String::as_str).collect();
    paths.sort_unstable();
    paths
}

/// Statistics about a local tree scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Regular files visited
    pub files_seen: usize,
    /// Files whose content was read and hashed
    pub files_hashed: usize,
    /// Files whose hash was reused from the previous snapshot
    pub hashes_reused: usize,
    /// Files skipped because they could not be stat'ed or read
    pub files_skipped: usize,
}

/// Outcome of a completed backup run
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    /// Name of the snapshot persisted to both stores
    pub snapshot_name: String,
    /// Number of files uploaded
    pub files_uploaded: usize,
    /// Bytes uploaded
    pub bytes_uploaded: u64,
    /// Number of remote objects deleted by retention
    pub files_deleted: usize,
    /// Paths referenced by retained snapshots but missing from the remote
    pub integrity_errors: Vec<String>,
    /// Old persisted snapshots removed from either store
    pub snapshots_pruned: usize,
    /// Epoch files that could not be renamed aside
    pub epoch_files_missing: Vec<PathBuf>,
    /// Wall time of the run
    pub duration: Duration,
}

impl BackupReport {
    /// Whether the run found retained files missing from the remote
    pub fn has_integrity_errors(&self) -> bool {
        !self.integrity_errors.is_empty()
    }

    /// Whether any configured epoch file was absent when the run started
    pub fn has_missing_epoch_files(&self) -> bool {
        !self.epoch_files_missing.is_empty()
    }
}

/// Outcome of a completed restore-download run
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Name of the remote snapshot that was restored
    pub snapshot_name: String,
    /// Number of files downloaded
    pub files_downloaded: usize,
    /// Bytes downloaded
    pub bytes_downloaded: u64,
    /// Number of stale local files removed
    pub files_deleted: usize,
    /// Epoch files that could not be renamed back to their standard names
    pub epoch_files_missing: Vec<PathBuf>,
    /// Wall time of the run
    pub duration: Duration,
}

/// Completion status in a monitoring-system-compatible form
///
/// A backup failure is not considered critical, so only `0` (ok) and `1`
/// (warning or failure) are ever used as exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Completed within thresholds
    Ok,
    /// Completed but slower than the warning threshold
    Warning,
    /// Failed or completed with integrity errors; carries the internal status
    Failed(i32),
}

impl RunStatus {
    /// Process exit code for this status
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::Warning | RunStatus::Failed(_) => 1,
        }
    }

    /// Classify a finished run
    pub fn classify(failure: Option<i32>, elapsed: Duration, warn_after: Duration) -> Self {
        match failure {
            Some(status) => RunStatus::Failed(status),
            None if elapsed > warn_after => RunStatus::Warning,
            None => RunStatus::Ok,
        }
    }

    /// Human-readable status line
    pub fn status_line(&self, msg: &str) -> String {
        match self {
            RunStatus::Ok => format!("OK: {}", msg),
            RunStatus::Warning => format!("WARNING: {}", msg),
            RunStatus::Failed(status) => {
                format!("ERROR: Backup Failed! Exit status {}! {}", status, msg)
            }
        }
    }
}
