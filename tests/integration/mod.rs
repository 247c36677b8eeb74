//! Integration tests for backstep
//!
//! Multi-session scenarios driven through the public API: every session's
//! source state is recorded and later compared with what restore produces.

use ::backstep::*;
use ::backstep::layout::SnapshotForm;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// What one path holds, as far as these tests care
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    File(Vec<u8>),
    Dir,
    Symlink(PathBuf),
    Other,
}

/// Relative path to entry, for one tree
pub type TreeState = BTreeMap<String, EntryState>;

/// Capture a tree, leaving out a top-level `backstep-data`
pub fn capture_state(root: &Path) -> TreeState {
    let mut state = TreeState::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == "backstep-data"));
    for entry in walker {
        let entry = entry.unwrap();
        let relative = entry.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
        let file_type = entry.file_type();
        let value = if file_type.is_dir() {
            EntryState::Dir
        } else if file_type.is_symlink() {
            EntryState::Symlink(fs::read_link(entry.path()).unwrap())
        } else if file_type.is_file() {
            EntryState::File(fs::read(entry.path()).unwrap())
        } else {
            EntryState::Other
        };
        state.insert(relative, value);
    }
    state
}

/// Deterministic content generator
pub struct FileGenerator {
    pub rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Mostly text with some repetition, so diffs have something to find
    pub fn generate_file_content(&mut self, size_range: Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        let words = ["alpha ", "beta ", "gamma ", "delta\n", "epsilon ", "zeta "];
        let mut content = Vec::with_capacity(size);
        while content.len() < size {
            if self.rng.random_bool(0.05) {
                content.push(self.rng.random::<u8>());
            } else {
                content.extend_from_slice(words[self.rng.random_range(0..words.len())].as_bytes());
            }
        }
        content.truncate(size);
        content
    }
}

/// Shape of a generated source tree
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: Range<usize>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            dirs_per_level: 2,
            files_per_dir: 3,
            file_size_range: 0..4096,
        }
    }
}

/// Source, destination and the recorded history of both
pub struct BackstepTestHarness {
    pub source_dir: TempDir,
    pub dest_dir: TempDir,
    pub backstep: Backstep,
    pub file_generator: FileGenerator,
    pub history: Vec<(SessionTime, TreeState)>,
    clock: i64,
}

impl BackstepTestHarness {
    pub fn new() -> Self {
        Self::with_builder(BackstepBuilder::new())
    }

    pub fn with_builder(builder: BackstepBuilder) -> Self {
        let source_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let backstep = builder.build(dest_dir.path()).unwrap();
        Self {
            source_dir,
            dest_dir,
            backstep,
            file_generator: FileGenerator::new(42),
            history: Vec::new(),
            clock: 1_600_000_000,
        }
    }

    pub fn source(&self) -> &Path {
        self.source_dir.path()
    }

    pub fn dest(&self) -> &Path {
        self.dest_dir.path()
    }

    /// Write a file with a fresh mtime so the next session sees the change
    pub fn write_file(&mut self, relative: &str, content: &[u8]) {
        let path = self.source().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        self.clock += 1;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(self.clock, 0)).unwrap();
    }

    pub fn remove(&mut self, relative: &str) {
        let path = self.source().join(relative);
        if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path).unwrap();
        } else {
            fs::remove_file(&path).unwrap();
        }
    }

    /// Run a session and record the source state it captured
    pub fn backup(&mut self) -> SessionReport {
        let report = self.backstep.backup(self.source_dir.path()).unwrap();
        self.history.push((report.time, capture_state(self.source())));
        report
    }

    /// Create a nested tree and return its file paths
    pub fn generate_project(&mut self, config: &ProjectConfig) -> Vec<String> {
        let mut files = Vec::new();
        for depth in 1..=config.max_depth {
            for dir_idx in 0..config.dirs_per_level {
                let dir: Vec<String> = (0..depth).map(|level| format!("dir_{}_{}", level, dir_idx)).collect();
                let dir = dir.join("/");
                for file_idx in 0..config.files_per_dir {
                    let relative = format!("{}/file_{}.txt", dir, file_idx);
                    let content = self.file_generator.generate_file_content(config.file_size_range.clone());
                    self.write_file(&relative, &content);
                    files.push(relative);
                }
            }
        }
        files
    }

    /// Modify, delete and add files at random
    pub fn mutate(&mut self, files: &mut Vec<String>, count: usize, round: usize) {
        for idx in 0..count {
            match self.file_generator.rng.random_range(0..3) {
                0 if !files.is_empty() => {
                    let pick = self.file_generator.rng.random_range(0..files.len());
                    let relative = files[pick].clone();
                    let mut content = fs::read(self.source().join(&relative)).unwrap();
                    let extra = self.file_generator.generate_file_content(1..200);
                    let at = self.file_generator.rng.random_range(0..=content.len());
                    content.splice(at..at, extra);
                    self.write_file(&relative, &content);
                }
                1 if !files.is_empty() => {
                    let pick = self.file_generator.rng.random_range(0..files.len());
                    let relative = files.remove(pick);
                    self.remove(&relative);
                }
                _ => {
                    let relative = format!("added_{}/file_{}.txt", round % 3, idx);
                    if !files.contains(&relative) {
                        let content = self.file_generator.generate_file_content(0..2048);
                        self.write_file(&relative, &content);
                        files.push(relative);
                    }
                }
            }
        }
    }

    /// Restore every recorded session and compare it with what was backed up
    pub fn assert_restores_history(&self) {
        let scratch = TempDir::new().unwrap();
        for (n, (time, expected)) in self.history.iter().enumerate() {
            let target = scratch.path().join(format!("session_{}", n));
            self.backstep.restore(*time, &target).unwrap();
            let restored = capture_state(&target);
            assert_eq!(&restored, expected, "restore of session {} ({}) differs", n, time);
        }
    }
}

#[test]
fn test_many_sessions_restore_every_point() {
    let mut harness = BackstepTestHarness::new();
    let mut files = harness.generate_project(&ProjectConfig::default());
    let first = harness.backup();
    assert_eq!(first.stats.increment_files, 0);
    assert!(first.stats.new_entries > files.len());

    for round in 0..6 {
        harness.mutate(&mut files, 8, round);
        let report = harness.backup();
        assert!(report.previous.is_some());
        assert!(!report.is_degraded());
    }

    assert_eq!(harness.backstep.list_sessions().unwrap().len(), 7);
    assert_eq!(capture_state(harness.dest()), harness.history.last().unwrap().1);
    harness.assert_restores_history();

    for (time, _) in &harness.history {
        let report = harness.backstep.verify(*time).unwrap();
        assert!(report.is_valid(), "{}: {:?}", time, report.failures);
        assert_eq!(report.unverifiable, 0);
    }
}

/// Sizes of every completion marker in the destination
fn marker_sizes(dest: &Path) -> Vec<u64> {
    let mut sizes = Vec::new();
    for entry in fs::read_dir(dest.join("backstep-data")).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name().to_string_lossy().starts_with("current_mirror.") {
            sizes.push(entry.metadata().unwrap().len());
        }
    }
    sizes
}

#[test]
fn test_single_empty_completion_marker() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("a.txt", b"first");
    harness.backup();
    assert_eq!(marker_sizes(harness.dest()), vec![0]);

    harness.write_file("a.txt", b"second");
    harness.backup();
    assert_eq!(marker_sizes(harness.dest()), vec![0]);

    harness.write_file("a.txt", b"third");
    harness.backstep.add_hook(Box::new(crate::chaos::CrashBeforeCommit));
    assert!(harness.backstep.backup(harness.source()).is_err());
    assert_eq!(marker_sizes(harness.dest()), vec![0]);

    let reopened = Backstep::open(harness.dest()).unwrap();
    assert!(reopened.regress().unwrap().rolled_back());
    assert_eq!(marker_sizes(harness.dest()), vec![0]);
    let committed: Vec<SessionTime> = harness.history.iter().map(|(time, _)| *time).collect();
    assert_eq!(reopened.list_sessions().unwrap(), committed);
}

#[test]
fn test_forward_diff_snapshots() {
    let mut harness = BackstepTestHarness::with_builder(BackstepBuilder::new().full_snapshot_interval(3));
    let mut files = harness.generate_project(&ProjectConfig {
        max_depth: 2,
        ..Default::default()
    });
    harness.backup();
    for round in 0..6 {
        harness.mutate(&mut files, 4, round);
        harness.backup();
    }

    let forms: Vec<SnapshotForm> = harness
        .backstep
        .layout()
        .snapshots()
        .unwrap()
        .into_iter()
        .map(|s| s.form)
        .collect();
    assert_eq!(forms.len(), 7);
    assert_eq!(forms.iter().filter(|f| **f == SnapshotForm::Full).count(), 3);
    assert_eq!(forms[0], SnapshotForm::Full);
    assert_eq!(forms[1], SnapshotForm::Diff);

    for (time, expected) in &harness.history {
        let records: Vec<Record> = harness.backstep.read_tree_at(*time).unwrap().collect::<Result<_>>().unwrap();
        // The root is recorded, the captured state leaves it out
        assert_eq!(records.len(), expected.len() + 1);
    }
    harness.assert_restores_history();
}

#[test]
fn test_hardlinks_across_sessions() {
    use std::os::unix::fs::MetadataExt;

    let mut harness = BackstepTestHarness::new();
    harness.write_file("a", b"shared content");
    fs::hard_link(harness.source().join("a"), harness.source().join("b")).unwrap();
    harness.write_file("c", b"independent");
    let first = harness.backup();
    assert_eq!(first.stats.hardlinks_linked, 1);

    let ino = |root: &Path, name: &str| fs::metadata(root.join(name)).unwrap().ino();
    assert_eq!(ino(harness.dest(), "a"), ino(harness.dest(), "b"));

    // Writing through one name changes both
    harness.write_file("a", b"shared content, revised");
    harness.backup();
    assert_eq!(fs::read(harness.dest().join("b")).unwrap(), b"shared content, revised");

    let scratch = TempDir::new().unwrap();
    let old = scratch.path().join("old");
    let result = harness.backstep.restore(harness.history[0].0, &old).unwrap();
    assert_eq!(result.links_restored, 1);
    assert_eq!(fs::read(old.join("b")).unwrap(), b"shared content");
    assert_eq!(ino(&old, "a"), ino(&old, "b"));
    assert_ne!(ino(&old, "a"), ino(&old, "c"));
}

#[test]
fn test_special_files_round_trip() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("target.txt", b"pointed at");
    std::os::unix::fs::symlink("target.txt", harness.source().join("link")).unwrap();
    std::os::unix::fs::symlink("/nonexistent/elsewhere", harness.source().join("dangling")).unwrap();
    nix::unistd::mkfifo(harness.source().join("pipe").as_path(), nix::sys::stat::Mode::from_bits_truncate(0o640)).unwrap();
    harness.backup();

    let link_meta = fs::symlink_metadata(harness.dest().join("link")).unwrap();
    assert!(link_meta.file_type().is_symlink());

    // Turn the symlink into a regular file and back into history
    harness.remove("link");
    harness.write_file("link", b"now a file");
    harness.remove("pipe");
    harness.backup();

    let scratch = TempDir::new().unwrap();
    let old = scratch.path().join("old");
    let result = harness.backstep.restore(harness.history[0].0, &old).unwrap();
    assert_eq!(result.special_restored, 3);
    assert_eq!(fs::read_link(old.join("link")).unwrap(), PathBuf::from("target.txt"));
    assert_eq!(fs::read_link(old.join("dangling")).unwrap(), PathBuf::from("/nonexistent/elsewhere"));
    use std::os::unix::fs::FileTypeExt;
    assert!(fs::symlink_metadata(old.join("pipe")).unwrap().file_type().is_fifo());
    harness.assert_restores_history();
}

#[test]
fn test_directory_and_file_swaps() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("swap/inner/deep.txt", b"deep");
    harness.write_file("swap/top.txt", b"top");
    harness.write_file("plain", b"plain file");
    harness.backup();

    harness.remove("swap");
    harness.write_file("swap", b"was a directory");
    harness.remove("plain");
    harness.write_file("plain/child.txt", b"was a file");
    harness.backup();

    assert_eq!(capture_state(harness.dest()), harness.history[1].1);
    harness.assert_restores_history();
}

#[test]
fn test_subtree_restore() {
    let mut harness = BackstepTestHarness::new();
    harness.write_file("docs/guide/intro.md", b"# Intro");
    harness.write_file("docs/readme", b"read me");
    harness.write_file("src/main.rs", b"fn main() {}");
    harness.backup();
    harness.write_file("docs/readme", b"read me, edited");
    harness.backup();

    let scratch = TempDir::new().unwrap();
    let target = scratch.path().join("docs");
    harness
        .backstep
        .restore_path(harness.history[0].0, &Index::from_components(vec!["docs"]), &target)
        .unwrap();
    let restored = capture_state(&target);
    assert_eq!(restored.len(), 3);
    assert_eq!(restored["readme"], EntryState::File(b"read me".to_vec()));
    assert!(!target.join("main.rs").exists());
}

#[test]
fn test_unreadable_directory_degrades_session() {
    use std::os::unix::fs::PermissionsExt;
    if nix::unistd::geteuid().is_root() {
        // Permission bits do not stop root
        return;
    }

    let mut harness = BackstepTestHarness::new();
    harness.write_file("fine.txt", b"fine");
    harness.backup();

    harness.write_file("locked/secret.txt", b"hidden");
    let locked = harness.source().join("locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    let report = harness.backstep.backup(harness.source()).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(report.is_degraded());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].index, "locked");
    assert!(harness.backstep.layout().error_log_path(report.time).exists());
    // A degraded session is still committed
    assert_eq!(harness.backstep.list_sessions().unwrap().last(), Some(&report.time));
    let mirror_locked = harness.dest().join("locked");
    fs::set_permissions(&mirror_locked, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(!mirror_locked.join("secret.txt").exists());
}

#[test]
fn test_free_functions() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("file"), b"data").unwrap();

    let report = run_backup_session(source.path(), dest.path(), &BackstepConfig::default()).unwrap();
    assert_eq!(report.stats.new_entries, 2);
    assert_eq!(list_sessions(dest.path()).unwrap(), vec![report.time]);

    let regress = run_regress(dest.path()).unwrap();
    assert!(!regress.rolled_back());

    let records: Vec<Record> = read_tree_at(dest.path(), report.time).unwrap().collect::<Result<_>>().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[1].sha256().is_some());

    let scratch = TempDir::new().unwrap();
    let target = scratch.path().join("out");
    restore(dest.path(), report.time, &target).unwrap();
    assert_eq!(fs::read(target.join("file")).unwrap(), b"data");

    assert!(verify(dest.path(), report.time).unwrap().is_valid());
}
