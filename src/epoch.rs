//! Epoch file relocation
//!
//! A handful of files in a database backup change on every snapshot (epoch
//! markers and the catalog). While a snapshot is being transferred they are
//! renamed aside to `<path>_<YYYY_MM_DD_HHMM>` so the transferred set is
//! internally consistent; a restore renames them back.
//!
//! File templates are relative to the synchronised tree. `{snapshot}` is
//! replaced by the configured snapshot name, and the directory part may be a
//! glob (`var/*/catalog/Snapshots/catalog.ctlg`) that is resolved against the
//! tree, first match in lexical order.

use crate::error::Result;
use crate::snapshot::SNAPSHOT_NAME_FORMAT;
use chrono::{DateTime, Utc};
use globset::GlobBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use walkdir::WalkDir;

/// Placeholder replaced by the snapshot name in file templates
pub const SNAPSHOT_PLACEHOLDER: &str = "{snapshot}";

/// Where a tree's epoch files live, independent of any snapshot time
#[derive(Debug, Clone)]
pub struct EpochLayout {
    tree_dir: PathBuf,
    snapshot_name: String,
    templates: Vec<String>,
}

impl EpochLayout {
    /// Describe the epoch files of the tree at `tree_dir`
    pub fn new(tree_dir: impl Into<PathBuf>, snapshot_name: impl Into<String>, templates: Vec<String>) -> Self {
        Self {
            tree_dir: tree_dir.into(),
            snapshot_name: snapshot_name.into(),
            templates,
        }
    }

    /// Resolve the epoch files for a snapshot captured at `captured_at`
    pub fn files_at(&self, captured_at: DateTime<Utc>) -> Result<EpochFiles> {
        EpochFiles::resolve(&self.tree_dir, &self.snapshot_name, &self.templates, captured_at)
    }
}

/// Outcome of relocating one epoch file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochMove {
    /// Source path
    pub from: PathBuf,
    /// Destination path
    pub to: PathBuf,
    /// Whether the rename happened; `false` when the source was missing
    pub moved: bool,
}

/// The set of epoch files of one tree for one snapshot time
#[derive(Debug, Clone)]
pub struct EpochFiles {
    files: Vec<PathBuf>,
    stamp: String,
}

impl EpochFiles {
    /// Resolve file templates against `tree_dir`
    ///
    /// A template whose directory glob matches nothing is logged and left out.
    pub fn resolve(
        tree_dir: &Path,
        snapshot_name: &str,
        templates: &[String],
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut files = Vec::with_capacity(templates.len());
        for template in templates {
            let relative = template.replace(SNAPSHOT_PLACEHOLDER, snapshot_name);
            match resolve_template(tree_dir, &relative)? {
                Some(path) => files.push(path),
                None => error!("No directory in {:?} matches epoch file {}", tree_dir, relative),
            }
        }

        Ok(Self::from_paths(files, captured_at))
    }

    /// Use explicit paths
    pub fn from_paths(files: Vec<PathBuf>, captured_at: DateTime<Utc>) -> Self {
        Self {
            files,
            stamp: captured_at.format(SNAPSHOT_NAME_FORMAT).to_string(),
        }
    }

    /// Resolved epoch file paths
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Timestamp suffix used for archived names
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Date-stamped name an epoch file is archived under
    pub fn archived_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push("_");
        name.push(&self.stamp);
        PathBuf::from(name)
    }

    /// Rename every epoch file to its date-stamped name
    pub fn archive(&self) -> Vec<EpochMove> {
        self.files
            .iter()
            .map(|path| move_file(path, &self.archived_path(path)))
            .collect()
    }

    /// Rename every date-stamped epoch file back to its standard name
    pub fn restore(&self) -> Vec<EpochMove> {
        self.files
            .iter()
            .map(|path| move_file(&self.archived_path(path), path))
            .collect()
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

/// Resolve one relative template, globbing its directory part if needed
fn resolve_template(tree_dir: &Path, relative: &str) -> Result<Option<PathBuf>> {
    let (dir_pattern, file_name) = match relative.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => return Ok(Some(tree_dir.join(relative))),
    };
    if !has_glob_meta(dir_pattern) {
        return Ok(Some(tree_dir.join(relative)));
    }

    let matcher = GlobBuilder::new(dir_pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();
    let depth = dir_pattern.split('/').count();

    let mut matches: Vec<PathBuf> = WalkDir::new(tree_dir)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(tree_dir).ok()?.to_path_buf();
            matcher.is_match(&relative).then(|| entry.into_path())
        })
        .collect();
    matches.sort();

    Ok(matches.into_iter().next().map(|dir| dir.join(file_name)))
}

fn move_file(from: &Path, to: &Path) -> EpochMove {
    let moved = if from.exists() {
        match fs::rename(from, to) {
            Ok(()) => {
                debug!("Moved {:?} to {:?}", from, to);
                true
            }
            Err(e) => {
                error!("Failed to move {:?} to {:?}: {}", from, to, e);
                false
            }
        }
    } else {
        error!("File {:?} not found when attempting to move to {:?}", from, to);
        false
    };

    EpochMove {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        moved,
    }
}
