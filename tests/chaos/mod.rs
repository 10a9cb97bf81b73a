//! Chaos tests for snapvault
//!
//! Injects backend failures into whole runs and checks that a failed run
//! never leaves a remote snapshot behind, that epoch files are moved back,
//! and that the next run converges.

use super::harness::*;
use ::snapvault::*;
use std::fs;
use tracing::warn;

fn epoch_layout(harness: &VaultHarness) -> EpochLayout {
    EpochLayout::new(
        harness.source.path().join(PREFIX),
        "nightly",
        vec!["{snapshot}.txt".to_string(), "{snapshot}.info".to_string()],
    )
}

fn seeded() -> VaultHarness {
    let harness = VaultHarness::new();
    for i in 0..10 {
        harness.write(&format!("data/seg_{:04}.fdb", i), format!("segment {}", i).as_bytes());
    }
    harness.write("nightly.txt", b"epoch 17");
    harness.write("nightly.info", b"info 17");
    harness
}

#[test]
fn test_single_transient_upload_failure_is_retried() {
    let harness = seeded();
    harness.remote.client().fail_puts(1);

    let report = harness.backup(1, 3).unwrap();
    assert_eq!(report.files_uploaded, 12);
    assert_eq!(*harness.remote.client().reconnects.lock(), 1);
}

#[test]
fn test_single_transient_listing_failure_is_retried() {
    let harness = seeded();
    harness.backup(1, 3).unwrap();
    harness.remote.client().fail_lists(1);

    let report = harness.backup(2, 3).unwrap();
    assert_eq!(report.files_uploaded, 0);
    assert_eq!(*harness.remote.client().reconnects.lock(), 1);
}

#[test]
fn test_repeated_transient_failure_aborts_without_snapshot() {
    let harness = seeded();
    harness.remote.client().fail_puts(2);

    let err = BackupDriver::new(&harness.local, &harness.remote)
        .epoch(epoch_layout(&harness))
        .run_at(at(1))
        .unwrap_err();
    assert!(err.is_transient());
    warn!("Backup failed as expected: {}", err);

    // No remote snapshot means the run never completed
    assert!(harness.remote.list_snapshot_files().unwrap().is_empty());
    // Epoch files are back under their standard names
    let tree = harness.source.path().join(PREFIX);
    assert_eq!(fs::read(tree.join("nightly.txt")).unwrap(), b"epoch 17");
    assert!(!tree.join("nightly.txt_2024_03_01_0130").exists());

    harness.remote.client().clear_faults();
    let report = harness.backup(2, 3).unwrap();
    assert_eq!(report.files_uploaded, 12);
    assert_eq!(harness.remote.list_snapshot_files().unwrap().len(), 1);
}

#[test]
fn test_interrupted_upload_resumes() {
    let harness = seeded();
    harness.remote.client().reject_puts_of("seg_0005");

    let err = harness.backup(1, 3).unwrap_err();
    assert!(matches!(err, VaultError::Store(_)));
    assert!(harness.remote.list_snapshot_files().unwrap().is_empty());
    // Sorted uploads stop at the rejected file
    let partial = harness
        .remote
        .client()
        .names()
        .iter()
        .filter(|name| name.contains("/data/"))
        .count();
    assert_eq!(partial, 5);

    harness.remote.client().clear_faults();
    let report = harness.backup(2, 3).unwrap();
    // The files that made it are not sent again
    assert_eq!(report.files_uploaded, 7);
    assert_eq!(report.files_deleted, 0);
}

#[test]
fn test_lost_snapshot_write_costs_no_transfer() {
    let harness = seeded();
    harness.remote.client().reject_puts_of(".snapshot");

    assert!(harness.backup(1, 3).is_err());
    assert!(harness.remote.list_snapshot_files().unwrap().is_empty());

    harness.remote.client().clear_faults();
    let report = harness.backup(2, 3).unwrap();
    assert_eq!(report.files_uploaded, 0);
    assert_eq!(
        harness.remote.list_snapshot_files().unwrap(),
        vec!["2024_03_02_0130.snapshot"]
    );
}

#[test]
fn test_failed_download_aborts_restore_and_rerun_completes() {
    let harness = seeded();
    harness.backup(1, 3).unwrap();
    harness.remote.client().fail_gets(1);

    // Reads are not retried
    let err = harness.restore_day("2024_03_01").unwrap_err();
    assert!(err.is_transient());
    assert!(harness.restore_target.list_snapshot_files().unwrap().is_empty());

    let report = harness.restore_day("2024_03_01").unwrap();
    assert_eq!(report.files_downloaded, 12);
    let (restored, _) = harness.restore_target.scan().unwrap();
    assert_eq!(restored.len(), 12);
}

#[test]
fn test_corrupt_remote_snapshot_fails_restore() {
    let harness = seeded();
    harness.backup(1, 3).unwrap();
    let corrupt = harness.remote.snapshot_path("2024_03_05_0130.snapshot");
    harness.remote.client().insert(&corrupt, b"{ not json");

    let err = harness.restore_day("2024_03_05").unwrap_err();
    assert!(matches!(err, VaultError::Json(_) | VaultError::InvalidSnapshot(_)));

    // Older snapshots stay usable
    assert!(harness.restore_day("2024_03_01").is_ok());
}
