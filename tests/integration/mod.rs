//! Integration tests for whole snapvault runs
//!
//! Backups and restores between a local tree and an in-memory remote
//! container, covering incremental transfer, retention over several days,
//! pagination and restore of older snapshots.

use super::harness::*;
use ::snapvault::*;
use std::fs;
use tracing::info;

#[test]
fn test_incremental_backup_uploads_only_changes() {
    let harness = VaultHarness::new();
    harness.write("data/seg_0001.fdb", &[1u8; 4096]);
    harness.write("data/seg_0002.fdb", &[2u8; 4096]);
    harness.write("catalog/catalog.ctlg", b"catalog v1");

    let first = harness.backup(1, 7).unwrap();
    assert_eq!(first.files_uploaded, 3);
    assert_eq!(first.bytes_uploaded, 4096 * 2 + 10);

    let second = harness.backup(2, 7).unwrap();
    assert_eq!(second.files_uploaded, 0);
    assert_eq!(second.files_deleted, 0);

    harness.write("data/seg_0003.fdb", &[3u8; 100]);
    let third = harness.backup(3, 7).unwrap();
    assert_eq!(third.files_uploaded, 1);
    assert_eq!(third.bytes_uploaded, 100);
    info!("Third backup uploaded {} files", third.files_uploaded);

    assert_eq!(
        harness.remote.list_snapshot_files().unwrap(),
        vec![
            "2024_03_03_0130.snapshot",
            "2024_03_02_0130.snapshot",
            "2024_03_01_0130.snapshot"
        ]
    );
    // Only the newest snapshot is kept locally
    assert_eq!(
        harness.local.list_snapshot_files().unwrap(),
        vec!["2024_03_03_0130.snapshot"]
    );
}

#[test]
fn test_retention_deletes_unreferenced_content() {
    let harness = VaultHarness::new();
    harness.write("keep.fdb", b"always here");
    harness.write("short_lived.fdb", b"gone after day 1");
    harness.backup(1, 2).unwrap();

    harness.remove("short_lived.fdb");
    harness.backup(2, 2).unwrap();
    harness.backup(3, 2).unwrap();
    // Day 1 still retained during day 3
    assert!(harness
        .remote
        .client()
        .contains(&VaultHarness::remote_name("short_lived.fdb")));

    let report = harness.backup(4, 2).unwrap();
    assert_eq!(report.files_deleted, 1);
    assert!(!report.has_integrity_errors());
    assert!(!harness
        .remote
        .client()
        .contains(&VaultHarness::remote_name("short_lived.fdb")));
    assert!(harness
        .remote
        .client()
        .contains(&VaultHarness::remote_name("keep.fdb")));
    assert_eq!(harness.remote.list_snapshot_files().unwrap().len(), 2);
}

#[test]
fn test_missing_retained_file_is_reported_not_fatal() {
    let harness = VaultHarness::new();
    harness.write("a.fdb", b"aaaa");
    harness.write("b.fdb", b"bbbb");
    harness.backup(1, 3).unwrap();

    // Someone removed an object the day 1 snapshot references
    harness
        .remote
        .client()
        .delete(&VaultHarness::remote_name("b.fdb"))
        .unwrap();

    let report = harness.backup(2, 3).unwrap();
    assert_eq!(report.integrity_errors, vec![VaultHarness::remote_name("b.fdb")]);
    // The run still completes and repairs the store
    assert_eq!(report.files_uploaded, 1);
    assert!(harness.remote.client().contains(&VaultHarness::remote_name("b.fdb")));
    assert_eq!(harness.remote.list_snapshot_files().unwrap()[0], "2024_03_02_0130.snapshot");
}

#[test]
fn test_pagination_over_large_listing() {
    let harness = VaultHarness::new();
    let client = harness.remote.client();
    for i in 0..store::remote::DEFAULT_PAGE_SIZE + 3 {
        client.insert(&VaultHarness::remote_name(&format!("bulk/obj{:06}", i)), b"x");
    }
    client.insert_marker(&VaultHarness::remote_name("bulk"));

    let listed = harness.remote.collect_fingerprints().unwrap();
    assert_eq!(listed.len(), 10_003);
    assert_eq!(*client.list_calls.lock(), 2);
}

#[test]
fn test_foreign_objects_are_cleaned_up() {
    let harness = VaultHarness::new();
    harness.write("a.fdb", b"aaaa");
    // Left behind by an earlier deployment, referenced by no snapshot
    harness
        .remote
        .client()
        .insert(&VaultHarness::remote_name("stray.tmp"), b"junk");

    let report = harness.backup(1, 3).unwrap();
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.files_deleted, 1);
    assert!(!harness
        .remote
        .client()
        .contains(&VaultHarness::remote_name("stray.tmp")));
}

#[test]
fn test_restore_into_empty_directory() {
    let harness = VaultHarness::new();
    for i in 0..20 {
        harness.write(
            &format!("v_db_node0001_data/{:02}/seg_{}.fdb", i % 4, i),
            format!("segment {}", i).as_bytes(),
        );
    }
    harness.backup(1, 3).unwrap();

    let report = harness.restore_day("2024_03_01").unwrap();
    assert_eq!(report.snapshot_name, "2024_03_01_0130.snapshot");
    assert_eq!(report.files_downloaded, 20);
    assert_eq!(report.files_deleted, 0);

    let (restored, _) = harness.restore_target.scan().unwrap();
    let (original, _) = harness.local.scan().unwrap();
    assert_eq!(restored, original);
    assert_eq!(
        harness.restore_target.list_snapshot_files().unwrap(),
        vec!["2024_03_01_0130.snapshot"]
    );
}

#[test]
fn test_restore_picks_requested_day() {
    let harness = VaultHarness::new();
    harness.write("a.fdb", b"aaaa");
    harness.backup(1, 5).unwrap();
    harness.write("b.fdb", b"bbbb");
    harness.backup(2, 5).unwrap();
    harness.write("c.fdb", b"cccc");
    harness.backup(3, 5).unwrap();

    let tree = harness.target.path().join(PREFIX);

    harness.restore_day("2024_03_03").unwrap();
    assert!(tree.join("c.fdb").exists());

    let report = harness.restore_day("2024_03_01").unwrap();
    assert_eq!(report.files_deleted, 2);
    assert!(!tree.join("b.fdb").exists());
    assert!(!tree.join("c.fdb").exists());
    assert_eq!(fs::read(tree.join("a.fdb")).unwrap(), b"aaaa");

    let err = harness.restore_day("2024_02_29").unwrap_err();
    assert!(matches!(err, VaultError::NoSnapshot(_)));
}

#[test]
fn test_restore_with_selector() {
    let harness = VaultHarness::new();
    harness.write("a.fdb", b"aaaa");
    harness.backup(1, 5).unwrap();
    harness.write("b.fdb", b"bbbb");
    harness.backup(2, 5).unwrap();

    let seen = parking_lot::Mutex::new(Vec::new());
    let oldest = |candidates: &[String]| {
        *seen.lock() = candidates.to_vec();
        candidates.last().cloned()
    };
    let report = RestoreDriver::new(&harness.restore_target, &harness.remote)
        .run(Selection::Choose(&oldest))
        .unwrap();

    assert_eq!(report.snapshot_name, "2024_03_01_0130.snapshot");
    assert_eq!(
        *seen.lock(),
        vec!["2024_03_02_0130.snapshot", "2024_03_01_0130.snapshot"]
    );
    assert_eq!(report.files_downloaded, 1);
}

#[test]
fn test_scoped_remote_handles() {
    use std::io::{Read, Write};

    let harness = VaultHarness::new();
    {
        let mut file = harness.remote.open("notes/run.log", OpenMode::Write).unwrap();
        file.write_all(b"first line\n").unwrap();
        file.close().unwrap();
    }
    {
        let mut file = harness.remote.open("notes/run.log", OpenMode::Append).unwrap();
        file.write_all(b"second line\n").unwrap();
        file.close().unwrap();
    }

    let mut content = String::new();
    harness
        .remote
        .open("notes/run.log", OpenMode::Read)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "first line\nsecond line\n");

    let missing = harness.remote.open("notes/none.log", OpenMode::Read);
    assert!(matches!(missing, Err(VaultError::NotFound(_))));
}

#[test]
fn test_nodes_sharing_a_container_keep_to_their_own_snapshots() {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    const OTHER: &str = "v_db_node0002/nightly";

    let client = SharedClient::default();
    let source1 = TempDir::new().unwrap();
    let source2 = TempDir::new().unwrap();
    let local1 = FsStore::new(source1.path(), PREFIX).unwrap();
    let local2 = FsStore::new(source2.path(), OTHER).unwrap();
    let remote1 = RemoteStore::new(client.clone(), PREFIX).unwrap();
    let remote2 = RemoteStore::new(client.clone(), OTHER).unwrap();

    write_tree_file(source1.path(), "data/seg.fdb", b"node one");
    let other_file = source2.path().join(OTHER).join("data/seg.fdb");
    fs::create_dir_all(other_file.parent().unwrap()).unwrap();
    fs::write(&other_file, b"node two").unwrap();

    // Both nodes back up in the same minute, then node 2 again later that day
    BackupDriver::new(&local1, &remote1).retain(1).run_at(at(1)).unwrap();
    BackupDriver::new(&local2, &remote2).retain(1).run_at(at(1)).unwrap();
    let evening = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
    let report = BackupDriver::new(&local2, &remote2).retain(1).run_at(evening).unwrap();
    assert_eq!(report.files_deleted, 0);

    assert!(client.0.contains(&format!("{}.snapshots/2024_03_01_0130.snapshot", PREFIX)));
    assert!(client.0.contains(&format!("{}.snapshots/2024_03_01_2300.snapshot", OTHER)));
    assert!(!client.0.contains(&format!("{}.snapshots/2024_03_01_0130.snapshot", OTHER)));
    assert!(client.0.contains(&VaultHarness::remote_name("data/seg.fdb")));
    assert_eq!(remote1.list_snapshot_files().unwrap(), vec!["2024_03_01_0130.snapshot"]);

    let target = TempDir::new().unwrap();
    let restore_target = FsStore::new(target.path(), PREFIX).unwrap();
    write_tree_file(target.path(), "stale.fdb", b"old");
    let report = RestoreDriver::new(&restore_target, &remote1)
        .run(Selection::Day("2024_03_01"))
        .unwrap();

    assert_eq!(report.snapshot_name, "2024_03_01_0130.snapshot");
    assert_eq!(report.files_downloaded, 1);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(
        fs::read(target.path().join(PREFIX).join("data/seg.fdb")).unwrap(),
        b"node one"
    );
    assert!(!target.path().join(OTHER).exists());
}
