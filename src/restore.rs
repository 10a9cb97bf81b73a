//! Restore-download flow
//!
//! [`RestoreDriver`] makes a local tree match one persisted remote snapshot:
//! the snapshot is diffed against a scan of the local tree, missing or
//! changed files are downloaded, files the snapshot does not list are
//! deleted, epoch files are renamed back to their standard names, and the
//! snapshot is persisted locally to mark the restore point.
//!
//! Which snapshot to restore is decided by a [`Selection`]: either the
//! newest snapshot of a given day or whatever a [`SnapshotSelector`] picks
//! from the available names (an interactive prompt in the CLI).

use crate::epoch::EpochLayout;
use crate::error::{Result, VaultError};
use crate::snapshot::{parse_snapshot_name, prune_snapshots, SnapshotMetadata};
use crate::store::{FsStore, ObjectStore};
use crate::types::RestoreReport;
use crate::utils;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Chooses one snapshot name from the available ones, newest first
pub trait SnapshotSelector {
    /// Pick a snapshot, or `None` to pick nothing
    fn select(&self, candidates: &[String]) -> Option<String>;
}

impl<F> SnapshotSelector for F
where
    F: Fn(&[String]) -> Option<String>,
{
    fn select(&self, candidates: &[String]) -> Option<String> {
        self(candidates)
    }
}

/// How the snapshot to restore is chosen
pub enum Selection<'s> {
    /// Newest snapshot whose name starts with this day (`YYYY_MM_DD`)
    Day(&'s str),
    /// Delegate to a selector
    Choose(&'s dyn SnapshotSelector),
}

impl std::fmt::Debug for Selection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Day(day) => f.debug_tuple("Day").field(day).finish(),
            Selection::Choose(_) => f.write_str("Choose"),
        }
    }
}

/// Pick a snapshot name from `names` (newest first)
pub fn select_snapshot(names: &[String], selection: &Selection<'_>) -> Result<String> {
    match selection {
        Selection::Day(day) => names
            .iter()
            .find(|name| name.starts_with(day))
            .cloned()
            .ok_or_else(|| VaultError::NoSnapshot(format!("day {}", day))),
        Selection::Choose(selector) => {
            if names.is_empty() {
                return Err(VaultError::NoSnapshot("the remote store".to_string()));
            }
            match selector.select(names) {
                Some(name) if names.contains(&name) => Ok(name),
                Some(name) => Err(VaultError::NoSnapshot(name)),
                None => Err(VaultError::NoSnapshot("the selection".to_string())),
            }
        }
    }
}

/// Drives one restore-download run from a remote store into a local tree
pub struct RestoreDriver<'a> {
    local: &'a dyn ObjectStore,
    remote: &'a dyn ObjectStore,
    base_dir: PathBuf,
    epoch: Option<EpochLayout>,
}

impl<'a> RestoreDriver<'a> {
    /// Restore from `remote` into `local`
    pub fn new(local: &'a FsStore, remote: &'a dyn ObjectStore) -> Self {
        Self {
            base_dir: local.root().to_path_buf(),
            local,
            remote,
            epoch: None,
        }
    }

    /// Epoch files to rename back once the download completes
    pub fn epoch(mut self, layout: EpochLayout) -> Self {
        self.epoch = Some(layout);
        self
    }

    /// Restore the snapshot chosen by `selection`
    #[instrument(skip(self))]
    pub fn run(&self, selection: Selection<'_>) -> Result<RestoreReport> {
        let start = Instant::now();
        let local = SnapshotMetadata::from_store(self.local, Utc::now())?;

        let names = self.remote.list_snapshot_files()?;
        let name = select_snapshot(&names, &selection)?;
        let snapshot = SnapshotMetadata::load(self.remote, &name)?;
        info!(
            "Restoring from snapshot {} ({} files, {})",
            name,
            snapshot.len(),
            utils::format_bytes(snapshot.total_size())
        );

        let diff = snapshot.diff(&local);
        debug!(
            "{} files to download, {} stale local files",
            diff.additions.len(),
            diff.deletions.len()
        );

        let mut report = RestoreReport {
            snapshot_name: name,
            ..RestoreReport::default()
        };

        let download_start = Instant::now();
        for path in diff.sorted_additions() {
            let bytes = self.remote.download(path, &self.base_dir)?;
            debug!("Downloaded {} ({})", path, utils::format_bytes(bytes));
            report.bytes_downloaded += bytes;
            report.files_downloaded += 1;
        }
        info!(
            "Downloaded {} in {} items in {}",
            utils::format_bytes(report.bytes_downloaded),
            report.files_downloaded,
            utils::format_elapsed(download_start.elapsed())
        );

        for path in diff.sorted_deletions() {
            self.local.delete(path)?;
            report.files_deleted += 1;
        }
        info!("Deleted {} items", report.files_deleted);

        if let Some(layout) = &self.epoch {
            // Epoch files were stamped with the minute the snapshot is named after
            let stamped_at = parse_snapshot_name(&report.snapshot_name)
                .unwrap_or_else(|| snapshot.captured_at());
            report.epoch_files_missing = layout
                .files_at(stamped_at)?
                .restore()
                .into_iter()
                .filter(|epoch_move| !epoch_move.moved)
                .map(|epoch_move| epoch_move.to)
                .collect();
            if !report.epoch_files_missing.is_empty() {
                warn!(
                    "{} epoch files could not be renamed back: {:?}",
                    report.epoch_files_missing.len(),
                    report.epoch_files_missing
                );
            }
        }

        snapshot.save(self.local)?;
        prune_snapshots(self.local, 1)?;

        report.duration = start.elapsed();
        info!(
            "Restore download of {} completed in {}",
            report.snapshot_name,
            utils::format_elapsed(report.duration)
        );
        Ok(report)
    }
}
