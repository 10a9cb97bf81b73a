//! Property-based testing for snapvault
//!
//! Uses proptest to check the snapshot diff algebra and the retention
//! combination over randomly generated trees.

use ::snapvault::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// Generate relative paths inside a node tree
fn path_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z]{1,6}", 0..=3),
        "[a-z0-9_]{1,10}\\.(fdb|pidx|ctlg)",
    )
        .prop_map(|(dirs, file)| {
            let mut parts = dirs;
            parts.push(file);
            parts.join("/")
        })
}

/// Size, content hash and mtime offset of one file
fn fingerprint_strategy() -> impl Strategy<Value = (u64, String, i64)> {
    (0u64..1_000_000, "[0-9a-f]{32}", 0i64..100_000)
}

/// Generate a whole tree as path -> (size, hash, mtime offset)
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, (u64, String, i64)>> {
    prop::collection::btree_map(path_strategy(), fingerprint_strategy(), 0..40)
}

fn snapshot(tree: &BTreeMap<String, (u64, String, i64)>) -> SnapshotMetadata {
    let mut snapshot = SnapshotMetadata::new(base_time());
    for (path, (size, hash, offset)) in tree {
        snapshot.insert(FileFingerprint::new(
            path.clone(),
            *size,
            base_time() + Duration::seconds(*offset),
            hash.clone(),
        ));
    }
    snapshot
}

fn keys(snapshot: &SnapshotMetadata) -> BTreeSet<String> {
    snapshot.entries().keys().cloned().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_diff_with_itself_is_empty(tree in tree_strategy()) {
        let snapshot = snapshot(&tree);
        prop_assert!(snapshot.diff(&snapshot).is_empty());
    }

    #[test]
    fn prop_diff_against_empty_adds_everything(tree in tree_strategy()) {
        let snapshot = snapshot(&tree);
        let empty = SnapshotMetadata::new(base_time());

        let forward = snapshot.diff(&empty);
        prop_assert_eq!(forward.additions.len(), tree.len());
        prop_assert!(forward.deletions.is_empty());

        let backward = empty.diff(&snapshot);
        prop_assert!(backward.additions.is_empty());
        prop_assert_eq!(backward.deletions.len(), tree.len());
    }

    #[test]
    fn prop_diff_partitions_keys(left in tree_strategy(), right in tree_strategy()) {
        let left = snapshot(&left);
        let right = snapshot(&right);
        let diff = left.diff(&right);

        let left_keys = keys(&left);
        let right_keys = keys(&right);
        let deletions: BTreeSet<String> = diff.deletions.iter().cloned().collect();
        let expected_deletions: BTreeSet<String> =
            right_keys.difference(&left_keys).cloned().collect();
        prop_assert_eq!(deletions, expected_deletions);

        for path in &diff.additions {
            prop_assert!(left_keys.contains(path));
            if let Some(theirs) = right.get(path) {
                prop_assert_ne!(left.get(path).unwrap(), theirs);
            }
        }
        for path in left_keys.difference(&right_keys) {
            prop_assert!(diff.additions.contains(path));
        }
        prop_assert!(diff.additions.is_disjoint(&diff.deletions));
    }

    #[test]
    fn prop_mtime_never_causes_a_transfer(tree in tree_strategy(), shift in 1i64..1_000_000) {
        let original = snapshot(&tree);
        let touched: BTreeMap<_, _> = tree
            .into_iter()
            .map(|(path, (size, hash, offset))| (path, (size, hash, offset + shift)))
            .collect();
        prop_assert!(snapshot(&touched).diff(&original).is_empty());
    }

    #[test]
    fn prop_persisted_snapshot_reads_back(tree in tree_strategy()) {
        let original = snapshot(&tree);
        let decoded = SnapshotMetadata::from_bytes(&original.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(decoded.captured_at(), original.captured_at());
        prop_assert_eq!(decoded.entries(), original.entries());
    }

    #[test]
    fn prop_retention_of_nested_snapshots(
        older in tree_strategy(),
        newer_extra in tree_strategy(),
        foreign in tree_strategy(),
    ) {
        // S1 (newest) is a superset of S2, and the store holds both plus extras
        let s2 = snapshot(&older);
        let mut newer = newer_extra.clone();
        newer.extend(older.clone());
        let s1 = snapshot(&newer);
        let mut full_tree = foreign.clone();
        full_tree.extend(newer.clone());
        let full = snapshot(&full_tree);

        let plan = RetentionPlan::from_snapshots(&[s1.clone(), s2], &full);
        prop_assert!(plan.should_be_empty.is_empty());

        let expected: Vec<String> = keys(&full).difference(&keys(&s1)).cloned().collect();
        prop_assert_eq!(plan.to_delete, expected);
    }
}
