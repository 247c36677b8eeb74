//! Reading and restoring past states
//!
//! The metadata snapshot of a session says what existed and with which
//! attributes. Content for a regular file starts from the mirror and walks
//! back through the file's increments, newest first, until the state at the
//! requested session is reached. A `snapshot`, `missing` or `dir` increment
//! does not depend on anything newer, so the chain starts at the oldest such
//! increment when there is one.

use crate::backstep;
use crate::compression;
use crate::delta;
use crate::error::{BackstepError, Result};
use crate::hardlink::{HardlinkTracker, TreeSide};
use crate::index::Index;
use crate::layout::{IncrementFile, IncrementLookup, Layout};
use crate::metadata::{MetadataStore, SnapshotRecords};
use crate::record::{Record, RecordKind};
use crate::regress;
use crate::timestamp::{IncrementKind, SessionTime};
use crate::types::{BackstepConfig, ProgressCallback, ProgressInfo, RestoreResult};
use crate::utils;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Records of the session at or before `time` in the destination at `dest`
pub fn read_tree_at(dest: &Path, time: SessionTime) -> Result<SnapshotRecords> {
    let restorer = Restorer::open(dest)?;
    let resolved = restorer.resolve_time(time)?;
    restorer.read_tree_at(resolved)
}

/// Committed session times of the destination at `dest`, oldest first
pub fn list_sessions(dest: &Path) -> Result<Vec<SessionTime>> {
    Restorer::open(dest)?.sessions()
}

/// Rebuild the tree as of `time` (or the newest session before it) into `target`
pub fn restore(dest: &Path, time: SessionTime, target: &Path) -> Result<RestoreResult> {
    let restorer = Restorer::open(dest)?;
    let resolved = restorer.resolve_time(time)?;
    restorer.restore(resolved, &Index::root(), target, None)
}

/// The session an increment belongs to: the newest session not after its
/// time, since collisions can push an increment past its session time
fn session_of(sessions: &[SessionTime], increment_time: SessionTime) -> Option<SessionTime> {
    sessions.iter().rev().find(|s| **s <= increment_time).copied()
}

/// Read access to the history of one destination
pub struct Restorer {
    layout: Layout,
    store: MetadataStore,
}

impl Restorer {
    /// Open the repository at `dest`
    pub fn open(dest: &Path) -> Result<Self> {
        let repository = backstep::load_repository(dest)?;
        Self::new(Layout::new(dest, repository.config.timestamp_separator), &repository.config)
    }

    /// Restorer over `layout`
    pub fn new(layout: Layout, config: &BackstepConfig) -> Result<Self> {
        let store = MetadataStore::new(layout.clone(), config.compress_metadata, config.full_snapshot_interval)?;
        Ok(Restorer { layout, store })
    }

    /// Layout of the destination
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Committed session times, oldest first
    ///
    /// A snapshot newer than the newest completion marker belongs to an
    /// interrupted session and is not listed.
    pub fn sessions(&self) -> Result<Vec<SessionTime>> {
        let Some(newest) = self.layout.markers()?.last().copied() else {
            return Ok(Vec::new());
        };
        Ok(self.store.times()?.into_iter().filter(|t| *t <= newest).collect())
    }

    /// Newest committed session at or before `requested`
    pub fn resolve_time(&self, requested: SessionTime) -> Result<SessionTime> {
        self.sessions()?
            .into_iter()
            .rev()
            .find(|t| *t <= requested)
            .ok_or_else(|| BackstepError::SessionNotFound(format!("no session at or before {}", requested)))
    }

    /// Records of the session at exactly `time`
    pub fn read_tree_at(&self, time: SessionTime) -> Result<SnapshotRecords> {
        self.store.iterate(time)
    }

    /// Records of the session at `time` at or below `prefix`
    pub fn read_subtree_at(
        &self,
        time: SessionTime,
        prefix: &Index,
    ) -> Result<impl Iterator<Item = Result<Record>>> {
        self.store.slice(time, prefix.clone())
    }

    /// Content of the regular file `index` as of session `time`
    pub fn content_at(
        &self,
        index: &Index,
        time: SessionTime,
        sessions: &[SessionTime],
        lookup: &mut IncrementLookup,
    ) -> Result<Vec<u8>> {
        let applicable: Vec<IncrementFile> = lookup
            .get(&self.layout, index)?
            .into_iter()
            .filter(|inc| session_of(sessions, inc.time).map_or(false, |s| s > time))
            .collect();

        let reset = applicable.iter().position(|inc| inc.kind != IncrementKind::Diff);
        let (mut state, diffs) = match reset {
            Some(pos) => {
                let inc = &applicable[pos];
                let base = match inc.kind {
                    IncrementKind::Snapshot => Some(read_increment(inc)?),
                    _ => None,
                };
                (base, &applicable[..pos])
            }
            None => (self.mirror_content(index)?, &applicable[..]),
        };

        for inc in diffs.iter().rev() {
            let current = state.ok_or_else(|| {
                BackstepError::corrupt(format!("diff increment {:?} has nothing to apply to", inc.path))
            })?;
            let reverse = read_increment(inc)?;
            state = Some(delta::patch(&current, &reverse)?);
        }
        trace!("Rebuilt {} at {} through {} increments", index, time, applicable.len());
        state.ok_or_else(|| BackstepError::corrupt(format!("no content for {} at {}", index, time)))
    }

    fn mirror_content(&self, index: &Index) -> Result<Option<Vec<u8>>> {
        let path = self.layout.mirror_path(index);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let data = utils::with_forced_access(&path, || {
                    fs::read(&path).map_err(|e| BackstepError::from_io(e, &path))
                })?;
                Ok(Some(data))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackstepError::from_io(err, path)),
        }
    }

    /// Rebuild the subtree at `prefix` as of session `time` into `target`
    ///
    /// `target` must not exist or be an empty directory.
    #[instrument(skip(self, progress), fields(dest = ?self.layout.mirror_root()))]
    pub fn restore(
        &self,
        time: SessionTime,
        prefix: &Index,
        target: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<RestoreResult> {
        let start = Instant::now();
        if regress::detect(&self.layout)?.needs_regress() {
            return Err(BackstepError::InvalidConfiguration(
                "destination holds an interrupted session; run regress first".to_string(),
            ));
        }
        ensure_empty_target(target)?;
        info!("Restoring {} as of {} into {:?}", prefix, time, target);

        let sessions = self.sessions()?;
        let mut run = RestoreRun {
            restorer: self,
            time,
            sessions,
            prefix_len: prefix.len(),
            target: target.to_path_buf(),
            lookup: IncrementLookup::new(),
            tracker: HardlinkTracker::new(),
            stack: Vec::new(),
            result: RestoreResult {
                time,
                files_restored: 0,
                directories_restored: 0,
                special_restored: 0,
                links_restored: 0,
                bytes_written: 0,
                duration_ms: 0,
                warnings: Vec::new(),
            },
            progress,
            processed: 0,
        };

        let mut found = false;
        for record in self.read_subtree_at(time, prefix)? {
            let record = record?;
            found = true;
            run.close_dirs_outside(&record.index);
            run.restore_entry(record)?;
        }
        if !found {
            return Err(BackstepError::SessionNotFound(format!("{} does not exist at {}", prefix, time)));
        }
        while let Some((path, record)) = run.stack.pop() {
            run.finish_dir(&path, &record);
        }

        let mut result = run.result;
        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored {} files, {} directories, {} special entries ({}) in {}ms",
            result.files_restored,
            result.directories_restored,
            result.special_restored,
            utils::format_bytes(result.bytes_written),
            result.duration_ms
        );
        Ok(result)
    }
}

fn ensure_empty_target(target: &Path) -> Result<()> {
    match fs::read_dir(target) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(BackstepError::InvalidConfiguration(format!(
                    "restore target {:?} is not empty",
                    target
                )));
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BackstepError::from_io(err, target)),
    }
}

fn read_increment(increment: &IncrementFile) -> Result<Vec<u8>> {
    let path = &increment.path;
    utils::with_forced_access(path, || {
        fs::metadata(path).map_err(|e| BackstepError::from_io(e, path))?;
        compression::read_all(path, increment.gzipped)
    })
}

struct RestoreRun<'a> {
    restorer: &'a Restorer,
    time: SessionTime,
    sessions: Vec<SessionTime>,
    prefix_len: usize,
    target: PathBuf,
    lookup: IncrementLookup,
    tracker: HardlinkTracker,
    stack: Vec<(PathBuf, Record)>,
    result: RestoreResult,
    progress: Option<ProgressCallback>,
    processed: usize,
}

impl<'a> RestoreRun<'a> {
    fn target_path(&self, index: &Index) -> PathBuf {
        let mut path = self.target.clone();
        for component in &index.components()[self.prefix_len.min(index.len())..] {
            path.push(OsStr::from_bytes(component));
        }
        path
    }

    fn close_dirs_outside(&mut self, index: &Index) {
        let path = self.target_path(index);
        while let Some((dir, _)) = self.stack.last() {
            if path.starts_with(dir) && &path != dir {
                break;
            }
            if let Some((dir, record)) = self.stack.pop() {
                self.finish_dir(&dir, &record);
            }
        }
    }

    fn finish_dir(&mut self, path: &Path, record: &Record) {
        if let Err(err) = utils::apply_attributes(path, record) {
            self.warn(format!("Could not set attributes of {:?}: {}", path, err));
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.result.warnings.push(message);
    }

    fn restore_entry(&mut self, record: Record) -> Result<()> {
        let path = self.target_path(&record.index);
        let outcome = match &record.kind {
            RecordKind::Absent => Ok(()),
            RecordKind::Directory { .. } => self.restore_dir(&path, &record),
            RecordKind::Regular { .. } => self.restore_file(&path, &record),
            _ => utils::create_special(&path, &record)
                .and_then(|_| utils::apply_attributes(&path, &record))
                .map(|_| self.result.special_restored += 1),
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_file_level() => {
                self.warn(format!("Could not restore {}: {}", record.index, err));
            }
            Err(err) => return Err(err),
        }

        self.processed += 1;
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: "Restoring".to_string(),
                current_item: Some(record.index.to_string()),
                processed: self.processed,
                bytes_processed: self.result.bytes_written,
            });
        }
        Ok(())
    }

    fn restore_dir(&mut self, path: &Path, record: &Record) -> Result<()> {
        let made = if path == self.target.as_path() {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };
        match made {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(err) => return Err(BackstepError::from_io(err, path)),
        }
        self.result.directories_restored += 1;
        self.stack.push((path.to_path_buf(), record.clone()));
        Ok(())
    }

    fn restore_file(&mut self, path: &Path, record: &Record) -> Result<()> {
        if path == self.target.as_path() && path.is_dir() {
            // A single file restored in place of the empty target directory
            fs::remove_dir(path).map_err(|e| BackstepError::from_io(e, path))?;
        }
        let first = self.tracker.resolve_link_target(TreeSide::Source, record);
        self.tracker.add_record(TreeSide::Source, record, None);
        if let Some(first) = first {
            let first_path = self.target_path(&first);
            if first_path.exists() {
                fs::hard_link(&first_path, path).map_err(|e| BackstepError::from_io(e, path))?;
                self.result.links_restored += 1;
                debug!("Linked {:?} to {:?}", path, first_path);
                return Ok(());
            }
        }

        let content =
            self.restorer
                .content_at(&record.index, self.time, &self.sessions, &mut self.lookup)?;
        if let Some(expected) = record.size() {
            if expected != content.len() as u64 {
                self.warn(format!(
                    "{} rebuilt with {} bytes, snapshot says {}",
                    record.index,
                    content.len(),
                    expected
                ));
            }
        }
        let mut file = File::create(path).map_err(|e| BackstepError::from_io(e, path))?;
        file.write_all(&content)?;
        file.sync_all()?;
        drop(file);
        utils::apply_attributes(path, record)?;
        self.result.files_restored += 1;
        self.result.bytes_written += content.len() as u64;
        Ok(())
    }
}
