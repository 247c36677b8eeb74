//! Chaos tests for backstep
//!
//! Sessions are interrupted at every possible entry and the destination's
//! files are damaged by hand. Rollback must always come back to the last
//! committed state, and damage must surface as errors or failed
//! verification, never as silently wrong restores.

use crate::integration::{capture_state, BackstepTestHarness, TreeState};
use ::backstep::*;
use anyhow::Context;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Hook that fails after a fixed number of entries
pub struct CrashAfter {
    limit: usize,
    seen: Arc<AtomicUsize>,
}

impl CrashAfter {
    pub fn new(limit: usize) -> (Self, Arc<AtomicUsize>) {
        let seen = Arc::new(AtomicUsize::new(0));
        (Self { limit, seen: seen.clone() }, seen)
    }
}

impl SessionHook for CrashAfter {
    fn post_entry(&self, index: &Index, _action: EntryAction) -> Result<()> {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            return Err(BackstepError::Aborted(format!("simulated crash after {}", index)));
        }
        Ok(())
    }
}

/// First session's tree, then a second tree touching every kind of change
fn prepare(harness: &mut BackstepTestHarness) {
    harness.write_file("keep.txt", b"never changes");
    harness.write_file("edit.txt", &b"line of text\n".repeat(200));
    harness.write_file("gone.txt", b"deleted next time");
    harness.write_file("dir_to_file/a", b"a");
    harness.write_file("dir_to_file/sub/b", b"b");
    harness.write_file("file_to_dir", b"plain");
    std::os::unix::fs::symlink("keep.txt", harness.source().join("link")).unwrap();
    harness.backup();

    let mut edited = b"line of text\n".repeat(200);
    edited.extend_from_slice(b"one more line\n");
    harness.write_file("edit.txt", &edited);
    harness.remove("gone.txt");
    harness.remove("dir_to_file");
    harness.write_file("dir_to_file", b"now a file");
    harness.remove("file_to_dir");
    harness.write_file("file_to_dir/child", b"now a directory");
    harness.remove("link");
    std::os::unix::fs::symlink("edit.txt", harness.source().join("link")).unwrap();
    harness.write_file("new/nested/file", b"brand new");
}

/// Hook that refuses to commit once every entry is written
pub struct CrashBeforeCommit;

impl SessionHook for CrashBeforeCommit {
    fn post_session(&self, report: &SessionReport) -> Result<()> {
        Err(BackstepError::Aborted(format!("simulated crash before committing {}", report.time)))
    }
}

/// Overwrite the start of `path` with bytes that are neither gzip nor a delta
pub fn corrupt_file(path: &Path) -> anyhow::Result<()> {
    let mut data = fs::read(path).with_context(|| format!("reading {:?}", path))?;
    if data.is_empty() {
        anyhow::bail!("{:?} is empty", path);
    }
    let garbage = b"\xde\xad\xbe\xefnot what was written";
    let n = garbage.len().min(data.len());
    data[..n].copy_from_slice(&garbage[..n]);
    fs::write(path, &data).with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

fn mirror_state(dest: &Path) -> TreeState {
    capture_state(dest)
}

#[test]
fn test_crash_at_every_entry_rolls_back() {
    let mut crashes = 0;
    for limit in 1..100 {
        let mut harness = BackstepTestHarness::new();
        prepare(&mut harness);
        let committed = harness.history[0].clone();
        let target_state = capture_state(harness.source());

        let (hook, _) = CrashAfter::new(limit);
        harness.backstep.add_hook(Box::new(hook));
        match harness.backstep.backup(harness.source()) {
            Err(BackstepError::Aborted(_)) => crashes += 1,
            Ok(_) => break,
            Err(other) => panic!("unexpected error at limit {}: {}", limit, other),
        }

        let reopened = Backstep::open(harness.dest()).unwrap();
        assert!(reopened.regress_state().unwrap().needs_regress(), "limit {}", limit);
        let report = reopened.regress().unwrap();
        assert!(report.rolled_back());
        assert_eq!(report.regress_time, Some(committed.0));
        assert!(report.errors.is_empty(), "limit {}: {:?}", limit, report.errors);
        assert_eq!(mirror_state(harness.dest()), committed.1, "mirror after rollback at limit {}", limit);
        assert_eq!(reopened.list_sessions().unwrap(), vec![committed.0]);

        // A clean session afterwards lands on the new tree and keeps history intact
        let report = reopened.backup(harness.source()).unwrap();
        assert!(report.regress.map(|r| !r.rolled_back()).unwrap_or(true));
        assert_eq!(mirror_state(harness.dest()), target_state, "mirror after retry at limit {}", limit);
        let scratch = TempDir::new().unwrap();
        let old = scratch.path().join("old");
        reopened.restore(committed.0, &old).unwrap();
        assert_eq!(capture_state(&old), committed.1, "history after retry at limit {}", limit);
    }
    assert!(crashes >= 8, "only {} crash points exercised", crashes);
}

fn linked_pair(harness: &mut BackstepTestHarness) {
    harness.write_file("a", b"hello");
    fs::hard_link(harness.source().join("a"), harness.source().join("b")).unwrap();
    harness.write_file("c", b"unrelated");
    harness.backup();
    harness.write_file("a", b"goodbye");
    harness.write_file("c", b"also changed");
}

fn same_inode(dest: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let a = fs::metadata(dest.join("a")).unwrap();
    let b = fs::metadata(dest.join("b")).unwrap();
    a.ino() == b.ino() && a.nlink() == 2
}

fn assert_pair_restored(harness: &BackstepTestHarness, context: &str) {
    let reopened = Backstep::open(harness.dest()).unwrap();
    let report = reopened.regress().unwrap();
    assert!(report.rolled_back(), "{}", context);
    assert!(report.errors.is_empty(), "{}: {:?}", context, report.errors);

    let dest = harness.dest();
    assert_eq!(fs::read(dest.join("a")).unwrap(), b"hello", "{}", context);
    assert_eq!(fs::read(dest.join("b")).unwrap(), b"hello", "{}", context);
    assert_eq!(mirror_state(dest), harness.history[0].1, "{}", context);
    assert_eq!(reopened.list_sessions().unwrap(), vec![harness.history[0].0], "{}", context);
}

#[test]
fn test_hardlinked_pair_rolls_back_after_crash() {
    let mut harness = BackstepTestHarness::new();
    linked_pair(&mut harness);
    harness.backstep.add_hook(Box::new(CrashBeforeCommit));
    assert!(matches!(
        harness.backstep.backup(harness.source()),
        Err(BackstepError::Aborted(_))
    ));
    assert_pair_restored(&harness, "crash before commit");
    assert!(same_inode(harness.dest()), "pair no longer shares an inode");
}

#[test]
fn test_hardlinked_pair_crash_at_every_entry() {
    for limit in 1..10 {
        let mut harness = BackstepTestHarness::new();
        linked_pair(&mut harness);
        let (hook, _) = CrashAfter::new(limit);
        harness.backstep.add_hook(Box::new(hook));
        match harness.backstep.backup(harness.source()) {
            Err(BackstepError::Aborted(_)) => {}
            Ok(_) => break,
            Err(other) => panic!("unexpected error at limit {}: {}", limit, other),
        }
        let context = format!("crash at limit {}", limit);
        assert_pair_restored(&harness, &context);

        // Rollback ignores link structure, the next session brings it back
        let reopened = Backstep::open(harness.dest()).unwrap();
        reopened.backup(harness.source()).unwrap();
        assert_eq!(fs::read(harness.dest().join("b")).unwrap(), b"goodbye", "{}", context);
        assert!(same_inode(harness.dest()), "{}: pair not relinked", context);
    }
}

#[test]
fn test_backup_rolls_back_before_starting() {
    let mut harness = BackstepTestHarness::new();
    prepare(&mut harness);
    let committed = harness.history[0].clone();

    let (hook, _) = CrashAfter::new(5);
    let mut crashing = Backstep::open(harness.dest()).unwrap();
    crashing.add_hook(Box::new(hook));
    assert!(crashing.backup(harness.source()).is_err());

    let report = harness.backup();
    let regress = report.regress.expect("rollback report");
    assert!(regress.rolled_back());
    assert_eq!(regress.regress_time, Some(committed.0));
    assert_eq!(harness.backstep.list_sessions().unwrap().len(), 2);
    harness.assert_restores_history();
}

#[test]
fn test_deleted_increment_fails_verification() {
    let mut harness = BackstepTestHarness::new();
    prepare(&mut harness);
    harness.backup();
    let first = harness.history[0].0;

    let layout = harness.backstep.layout().clone();
    let increment = layout
        .increment_at(&Index::from_components(vec!["edit.txt"]), harness.history[1].0)
        .unwrap()
        .expect("diff increment");
    fs::remove_file(&increment.path).unwrap();

    let report = harness.backstep.verify(first).unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, "edit.txt");
    // The newest session does not depend on increments
    assert!(harness.backstep.verify(harness.history[1].0).unwrap().is_valid());
}

#[test]
fn test_corrupted_increment_is_an_error() {
    let mut harness = BackstepTestHarness::new();
    prepare(&mut harness);
    harness.backup();

    let layout = harness.backstep.layout().clone();
    let increment = layout
        .increment_at(&Index::from_components(vec!["gone.txt"]), harness.history[1].0)
        .unwrap()
        .expect("snapshot increment");
    assert!(increment.gzipped);
    corrupt_file(&increment.path).unwrap();

    let scratch = TempDir::new().unwrap();
    let result = harness.backstep.restore(harness.history[0].0, &scratch.path().join("out"));
    assert!(result.is_err());
    let report = harness.backstep.verify(harness.history[0].0).unwrap();
    assert!(report.failures.iter().any(|f| f.index == "gone.txt" && f.error.is_some()));
}

#[test]
fn test_corrupted_snapshot_is_fatal() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("file", b"content");
    let report = harness.backup();

    let snapshot = harness.backstep.layout().snapshots_at(report.time).unwrap().remove(0);
    fs::write(&snapshot.path, b"File nonsense\n  Type bogus\n").unwrap();

    let records: Result<Vec<Record>> = harness
        .backstep
        .read_tree_at(report.time)
        .and_then(|records| records.collect());
    let err = records.unwrap_err();
    assert!(err.is_fatal() || matches!(err, BackstepError::Compression(_)), "{:?}", err);
}

#[test]
fn test_missing_increment_blocks_rollback() {
    let mut harness = BackstepTestHarness::new();
    prepare(&mut harness);
    harness.backstep.add_hook(Box::new(CrashBeforeCommit));
    assert!(harness.backstep.backup(harness.source()).is_err());

    let layout = harness.backstep.layout().clone();
    for increment in layout.all_increments().unwrap() {
        fs::remove_file(&increment.path).unwrap();
    }
    let reopened = Backstep::open(harness.dest()).unwrap();
    let err = reopened.regress().unwrap_err();
    assert!(matches!(err, BackstepError::RegressInconsistency { .. }));
    assert!(err.is_fatal());
    assert!(reopened.regress_state().unwrap().needs_regress());
}

#[test]
fn test_leftover_temp_files_are_ignored() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("file", b"content");
    harness.backup();
    fs::write(harness.dest().join(".backstep-tmp-stray"), b"partial").unwrap();

    harness.write_file("file", b"content, changed");
    harness.backup();
    let scratch = TempDir::new().unwrap();
    let target = scratch.path().join("out");
    harness.backstep.restore(harness.history[1].0, &target).unwrap();
    assert!(!target.join(".backstep-tmp-stray").exists());
    let records: Vec<Record> = harness
        .backstep
        .read_tree_at(harness.history[1].0)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_sessions_in_the_same_second() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("file", b"v1");
    for n in 2..6 {
        harness.write_file("file", format!("v{}", n).as_bytes());
        harness.backup();
    }
    let times: Vec<i64> = harness.history.iter().map(|(t, _)| t.as_secs()).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]), "{:?}", times);
    harness.assert_restores_history();
}
