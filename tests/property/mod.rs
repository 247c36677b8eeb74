//! Property-based testing for backstep
//!
//! Uses proptest to check the invariants the engine leans on: reverse
//! deltas undo changes, metadata text reads back to the same records,
//! collation aligns sorted streams, and any history of sessions can be
//! restored point by point.

use crate::integration::BackstepTestHarness;
use ::backstep::collate::{collate2, IndexedStream};
use ::backstep::record::{Attributes, DeviceKind, HardlinkInfo};
use ::backstep::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;

/// One change to the source tree between sessions
#[derive(Debug, Clone)]
pub enum TreeOperation {
    Write { path: String, content: Vec<u8> },
    Append { path: String, content: Vec<u8> },
    Remove { path: String },
    Symlink { path: String, target: String },
}

/// Small namespace so operations collide and entries change kind
fn path_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a".to_string()),
        Just("b.txt".to_string()),
        Just("d".to_string()),
        Just("d/a".to_string()),
        Just("d/e/f".to_string()),
        Just("d/e/g.txt".to_string()),
        Just("z/only".to_string()),
    ]
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-z \n]{0,400}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 0..2000),
        (any::<u8>(), 1..3000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn operation_strategy() -> impl Strategy<Value = TreeOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy()).prop_map(|(path, content)| TreeOperation::Write { path, content }),
        2 => (path_strategy(), content_strategy()).prop_map(|(path, content)| TreeOperation::Append { path, content }),
        2 => path_strategy().prop_map(|path| TreeOperation::Remove { path }),
        1 => (path_strategy(), "[a-z]{1,6}").prop_map(|(path, target)| TreeOperation::Symlink { path, target }),
    ]
}

/// Clear whatever stands in the way of a file at `path`
fn make_room(harness: &mut BackstepTestHarness, path: &str) {
    let mut prefix = String::new();
    for component in path.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        let full = harness.source().join(&prefix);
        let Ok(meta) = fs::symlink_metadata(&full) else {
            return;
        };
        if prefix == path || !meta.is_dir() {
            harness.remove(&prefix);
            return;
        }
    }
}

fn apply_operation(harness: &mut BackstepTestHarness, op: &TreeOperation) {
    match op {
        TreeOperation::Write { path, content } => {
            make_room(harness, path);
            harness.write_file(path, content);
        }
        TreeOperation::Append { path, content } => {
            let full = harness.source().join(path);
            let mut existing = match fs::symlink_metadata(&full) {
                Ok(meta) if meta.is_file() => fs::read(&full).unwrap(),
                _ => Vec::new(),
            };
            existing.extend_from_slice(content);
            make_room(harness, path);
            harness.write_file(path, &existing);
        }
        TreeOperation::Remove { path } => {
            if fs::symlink_metadata(harness.source().join(path)).is_ok() {
                harness.remove(path);
            }
        }
        TreeOperation::Symlink { path, target } => {
            make_room(harness, path);
            let full = harness.source().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            std::os::unix::fs::symlink(target, &full).unwrap();
        }
    }
}

fn index_strategy() -> impl Strategy<Value = Index> {
    let component = prop::collection::vec(any::<u8>().prop_filter("separator", |b| *b != b'/' && *b != 0), 1..6)
        .prop_filter("relative component", |c| c.as_slice() != b"." && c.as_slice() != b"..");
    prop::collection::vec(component, 0..4).prop_map(Index::from_components)
}

fn record_strategy() -> impl Strategy<Value = Record> {
    let mtime = -10_000_000_000i64..10_000_000_000i64;
    let link = prop::option::of((1u64..1 << 40, 1u64..1 << 20, 1u64..64).prop_map(|(inode, device, nlink)| {
        HardlinkInfo { inode, device, nlink }
    }));
    let digest = prop::option::of(any::<[u8; 32]>().prop_map(hex::encode));
    let kind = prop_oneof![
        (0u64..1 << 40, mtime.clone(), digest, link)
            .prop_map(|(size, mtime, sha256, link)| RecordKind::Regular { size, mtime, sha256, link }),
        mtime.clone().prop_map(|mtime| RecordKind::Directory { mtime }),
        prop::collection::vec(any::<u8>().prop_filter("nul", |b| *b != 0), 1..40)
            .prop_map(|target| RecordKind::Symlink { target }),
        (any::<bool>(), 0u64..4096, 0u64..1 << 20).prop_map(|(block, major, minor)| RecordKind::Device {
            kind: if block { DeviceKind::Block } else { DeviceKind::Char },
            major,
            minor,
        }),
        mtime.clone().prop_map(|mtime| RecordKind::Fifo { mtime }),
        mtime.prop_map(|mtime| RecordKind::Socket { mtime }),
    ];
    let attrs = (any::<u32>(), any::<u32>(), 0u32..0o7777).prop_map(|(uid, gid, perms)| Attributes { uid, gid, perms });
    (index_strategy(), kind, attrs).prop_map(|(index, kind, attrs)| Record { index, kind, attrs })
}

fn stream(indexes: &BTreeSet<Index>) -> IndexedStream<'static, Index> {
    let items: Vec<Result<Index>> = indexes.iter().cloned().map(Ok).collect();
    Box::new(items.into_iter())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reverse_delta_restores_prior(
        prior in content_strategy(),
        current in content_strategy(),
    ) {
        let reverse = delta::reverse_delta(&current, &prior).unwrap();
        prop_assert_eq!(delta::patch(&current, &reverse).unwrap(), prior);
    }

    #[test]
    fn small_blocks_patch_the_same(
        basis in content_strategy(),
        target in content_strategy(),
        block in 16u32..256,
    ) {
        let signature = delta::signature_with_block_size(&basis, block);
        let forward = delta::delta(&signature, &target).unwrap();
        prop_assert_eq!(delta::patch(&basis, &forward).unwrap(), target);
    }

    #[test]
    fn record_text_reads_back(record in record_strategy()) {
        let text = metadata::record_to_text(&record);
        let parsed = metadata::text_to_record(&text).unwrap();
        prop_assert_eq!(parsed, record);
    }

    #[test]
    fn collation_aligns_sorted_streams(
        left in prop::collection::btree_set(index_strategy(), 0..20),
        right in prop::collection::btree_set(index_strategy(), 0..20),
    ) {
        let tuples: Vec<(Index, Option<Index>, Option<Index>)> =
            collate2(stream(&left), stream(&right)).collect::<Result<_>>().unwrap();

        let union: Vec<Index> = left.union(&right).cloned().collect();
        let seen: Vec<Index> = tuples.iter().map(|(index, _, _)| index.clone()).collect();
        prop_assert_eq!(seen, union);
        for (index, l, r) in &tuples {
            prop_assert_eq!(l.is_some(), left.contains(index));
            prop_assert_eq!(r.is_some(), right.contains(index));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn every_session_restores(
        sessions in prop::collection::vec(prop::collection::vec(operation_strategy(), 1..6), 1..5),
        interval in 1u32..4,
    ) {
        let mut harness = BackstepTestHarness::with_builder(BackstepBuilder::new().full_snapshot_interval(interval));
        harness.write_file("seed.txt", b"always here");
        harness.backup();
        for operations in &sessions {
            for op in operations {
                apply_operation(&mut harness, op);
            }
            harness.backup();
        }

        harness.assert_restores_history();
        let newest = harness.history.last().unwrap().0;
        let report = harness.backstep.verify(newest).unwrap();
        prop_assert!(report.is_valid(), "{}", report.summary());
        let oldest = harness.history[0].0;
        let report = harness.backstep.verify(oldest).unwrap();
        prop_assert!(report.is_valid(), "{}", report.summary());
    }

    #[test]
    fn interrupted_session_rolls_back(
        operations in prop::collection::vec(operation_strategy(), 1..8),
        crash_after in 1usize..12,
    ) {
        use crate::chaos::CrashAfter;

        let mut harness = BackstepTestHarness::new();
        harness.write_file("seed.txt", b"always here");
        harness.write_file("d/a", b"nested");
        harness.backup();
        let committed = harness.history[0].clone();
        for op in &operations {
            apply_operation(&mut harness, op);
        }

        let (hook, _) = CrashAfter::new(crash_after);
        harness.backstep.add_hook(Box::new(hook));
        if harness.backstep.backup(harness.source()).is_ok() {
            return Ok(());
        }

        let reopened = Backstep::open(harness.dest()).unwrap();
        reopened.regress().unwrap();
        prop_assert_eq!(crate::integration::capture_state(harness.dest()), committed.1);
        prop_assert_eq!(reopened.list_sessions().unwrap(), vec![committed.0]);
    }
}
