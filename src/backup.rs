//! Backup flow
//!
//! [`BackupDriver`] pushes a local tree into a remote store:
//!
//! 1. rename the epoch files aside
//! 2. scan the local tree and persist that snapshot locally
//! 3. list the remote tree
//! 4. upload every path the remote lacks or holds with different content
//! 5. delete remote content no retained snapshot references
//! 6. persist the local snapshot remotely
//! 7. prune old persisted snapshots on both sides
//!
//! Step 6 is the last write of a successful run: a remote snapshot newer than
//! the previous one always describes a complete upload. If any step fails the
//! epoch files are renamed back so a retried run starts from a clean tree.

use crate::epoch::{EpochFiles, EpochLayout};
use crate::error::Result;
use crate::snapshot::{prune_snapshots, RetentionPlan, SnapshotMetadata};
use crate::store::{FsStore, ObjectStore};
use crate::types::BackupReport;
use crate::utils;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Drives one backup run from a local tree to a remote store
pub struct BackupDriver<'a> {
    local: &'a dyn ObjectStore,
    remote: &'a dyn ObjectStore,
    base_dir: PathBuf,
    retain: usize,
    epoch: Option<EpochLayout>,
}

impl<'a> BackupDriver<'a> {
    /// Back up `local` into `remote`, retaining one remote snapshot
    pub fn new(local: &'a FsStore, remote: &'a dyn ObjectStore) -> Self {
        Self {
            base_dir: local.root().to_path_buf(),
            local,
            remote,
            retain: 1,
            epoch: None,
        }
    }

    /// Number of remote snapshots whose content survives retention
    pub fn retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Epoch files to rename aside during the run
    pub fn epoch(mut self, layout: EpochLayout) -> Self {
        self.epoch = Some(layout);
        self
    }

    /// Run a backup stamped with the current time
    pub fn run(&self) -> Result<BackupReport> {
        self.run_at(Utc::now())
    }

    /// Run a backup whose snapshot is stamped `captured_at`
    #[instrument(skip(self))]
    pub fn run_at(&self, captured_at: DateTime<Utc>) -> Result<BackupReport> {
        let start = Instant::now();
        let epoch = self
            .epoch
            .as_ref()
            .map(|layout| layout.files_at(captured_at))
            .transpose()?;
        let archived = epoch.as_ref().map(EpochFiles::archive).unwrap_or_default();

        match self.sync(captured_at, start) {
            Ok(mut report) => {
                report.epoch_files_missing = archived
                    .into_iter()
                    .filter(|epoch_move| !epoch_move.moved)
                    .map(|epoch_move| epoch_move.from)
                    .collect();
                if report.has_missing_epoch_files() {
                    warn!(
                        "{} epoch files were not found to archive: {:?}",
                        report.epoch_files_missing.len(),
                        report.epoch_files_missing
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!("Backup failed, moving epoch files back: {}", e);
                if let Some(epoch) = &epoch {
                    let restored = epoch.restore().iter().filter(|m| m.moved).count();
                    let expected = archived.iter().filter(|m| m.moved).count();
                    if restored < expected {
                        error!("Only {} of {} epoch files were moved back", restored, expected);
                    }
                }
                Err(e)
            }
        }
    }

    fn sync(&self, captured_at: DateTime<Utc>, start: Instant) -> Result<BackupReport> {
        let local = SnapshotMetadata::from_store(self.local, captured_at)?;
        local.save(self.local)?;
        let remote = SnapshotMetadata::from_store(self.remote, captured_at)?;

        let diff_start = Instant::now();
        let diff = local.diff(&remote);
        debug!(
            "Diff completed in {:?}: {} to upload, {} only remote",
            diff_start.elapsed(),
            diff.additions.len(),
            diff.deletions.len()
        );

        let mut report = BackupReport {
            snapshot_name: local.file_name(),
            ..BackupReport::default()
        };

        let upload_start = Instant::now();
        for path in diff.sorted_additions() {
            let bytes = self.remote.upload(path, &self.base_dir)?;
            debug!("Uploaded {} ({})", path, utils::format_bytes(bytes));
            report.bytes_uploaded += bytes;
            report.files_uploaded += 1;
        }
        info!(
            "Uploaded {} in {} items in {}",
            utils::format_bytes(report.bytes_uploaded),
            report.files_uploaded,
            utils::format_elapsed(upload_start.elapsed())
        );

        let plan = RetentionPlan::compute(self.remote, self.retain, &remote)?;
        report.integrity_errors = plan.should_be_empty.clone();

        let delete_start = Instant::now();
        let mut kept = 0usize;
        for path in &plan.to_delete {
            // The snapshot being written may reference content no retained one does
            if local.contains(path) {
                kept += 1;
                continue;
            }
            self.remote.delete(path)?;
            report.files_deleted += 1;
        }
        if kept > 0 {
            warn!(
                "Kept {} remote files outside the retained snapshots because the new snapshot uses them",
                kept
            );
        }
        info!(
            "Deleted {} items, retaining {} snapshots, in {}",
            report.files_deleted,
            plan.retained.len(),
            utils::format_elapsed(delete_start.elapsed())
        );

        local.save(self.remote)?;
        info!("Saved snapshot {} to {} store", report.snapshot_name, self.remote.kind());

        report.snapshots_pruned =
            prune_snapshots(self.local, 1)? + prune_snapshots(self.remote, self.retain)?;
        report.duration = start.elapsed();

        info!(
            "Backup {} completed in {} ({} uploaded, {} deleted, {} integrity errors)",
            report.snapshot_name,
            utils::format_elapsed(report.duration),
            report.files_uploaded,
            report.files_deleted,
            report.integrity_errors.len()
        );
        Ok(report)
    }
}
