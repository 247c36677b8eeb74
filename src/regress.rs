//! Rolling back interrupted sessions
//!
//! A session is committed once its completion marker exists. A metadata
//! snapshot newer than the newest marker therefore belongs to a session that
//! never finished, and the mirror may hold a mix of old and new entries.
//!
//! Rollback collates the live mirror with the snapshot of the last committed
//! session. Entries that already match are left alone; the others are put
//! back using the increment the interrupted session wrote for them. Only
//! then are that session's increments, side files and snapshot removed, the
//! snapshot last, so an interrupted rollback is detected again and simply
//! repeated.

use crate::backstep;
use crate::collate::{collate2, IndexedStream};
use crate::compression;
use crate::delta;
use crate::error::{BackstepError, Result};
use crate::hardlink::{HardlinkTracker, TreeSide};
use crate::index::Index;
use crate::layout::{IncrementFile, IncrementLookup, Layout, DATA_DIR};
use crate::metadata::MetadataStore;
use crate::record::{CompareMode, Record};
use crate::timestamp::{IncrementKind, SessionTime};
use crate::types::{BackstepConfig, FileError, RegressReport, RegressState};
use crate::utils;
use crate::walk::{self, ErrorSink, TreeWalker, WalkMode};
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Work out whether the destination needs a rollback
///
/// Read only. Extra completion markers left by a crash during commit are
/// not an inconsistency; the newest one wins.
pub fn detect(layout: &Layout) -> Result<RegressState> {
    let current = layout.markers()?.last().copied();
    let newest_snapshot = layout.snapshots()?.last().map(|s| s.time);
    Ok(match newest_snapshot {
        Some(aborted) if current.map_or(true, |c| aborted > c) => RegressState::Required {
            regress_time: current,
            aborted_time: aborted,
        },
        _ => RegressState::Clean { current },
    })
}

/// Roll back the destination at `dest` if an interrupted session is found
///
/// Running it on a clean destination changes nothing.
pub fn run_regress(dest: &Path) -> Result<RegressReport> {
    let repository = backstep::load_repository(dest)?;
    let layout = Layout::new(dest, repository.config.timestamp_separator);
    regress_destination(&layout, &repository.config)
}

/// Roll back every interrupted session found in `layout`
#[instrument(skip(layout, config), fields(dest = ?layout.mirror_root()))]
pub fn regress_destination(layout: &Layout, config: &BackstepConfig) -> Result<RegressReport> {
    let start = Instant::now();
    let mut combined: Option<RegressReport> = None;

    loop {
        let (regress_time, aborted_time) = match detect(layout)? {
            RegressState::Clean { current } => {
                remove_stale_markers(layout)?;
                let mut report = combined.unwrap_or_else(|| RegressReport {
                    regress_time: current,
                    ..Default::default()
                });
                report.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(report);
            }
            RegressState::Required {
                regress_time,
                aborted_time,
            } => (regress_time, aborted_time),
        };

        info!(
            "Rolling back session {} to {}",
            aborted_time,
            regress_time.map(|t| t.to_string()).unwrap_or_else(|| "an empty destination".to_string())
        );
        let report = roll_back(layout, config, regress_time, aborted_time)?;
        combined = Some(match combined {
            None => report,
            Some(mut acc) => {
                acc.regress_time = report.regress_time;
                acc.entries_deleted += report.entries_deleted;
                acc.entries_patched += report.entries_patched;
                acc.entries_replaced += report.entries_replaced;
                acc.directories_created += report.directories_created;
                acc.attributes_reset += report.attributes_reset;
                acc.increments_removed += report.increments_removed;
                acc.errors.extend(report.errors);
                acc
            }
        });
    }
}

fn roll_back(
    layout: &Layout,
    config: &BackstepConfig,
    regress_time: Option<SessionTime>,
    aborted_time: SessionTime,
) -> Result<RegressReport> {
    let mut report = RegressReport {
        regress_time,
        aborted_time: Some(aborted_time),
        ..Default::default()
    };
    let store = MetadataStore::new(layout.clone(), config.compress_metadata, config.full_snapshot_interval)?;

    match regress_time {
        Some(target_time) => {
            let target: IndexedStream<'static, Record> = Box::new(store.iterate(target_time).map_err(|err| {
                match err {
                    BackstepError::SessionNotFound(msg) => BackstepError::corrupt(msg),
                    other => other,
                }
            })?);
            reconcile_tree(layout, aborted_time, target, &mut report)?;
        }
        None => clear_mirror(layout, &mut report)?,
    }

    sweep_temp_files(layout);
    for increment in layout.all_increments()? {
        if increment.time >= aborted_time {
            match fs::remove_file(&increment.path) {
                Ok(()) => report.increments_removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(BackstepError::from_io(err, &increment.path)),
            }
        }
    }
    for side_file in layout.session_side_files(aborted_time) {
        utils::remove_entry(&side_file)?;
    }
    if let Some(target_time) = regress_time {
        let marker = layout.marker_path(target_time);
        if !marker.exists() {
            utils::atomic_write(&marker, b"")?;
        }
    }
    let removed = store.delete(aborted_time)?;
    debug!("Removed {} snapshot files of {}", removed, aborted_time);

    info!(
        "Rolled back {}: {} deleted, {} patched, {} replaced, {} directories created, {} increments removed",
        aborted_time,
        report.entries_deleted,
        report.entries_patched,
        report.entries_replaced,
        report.directories_created,
        report.increments_removed
    );
    Ok(report)
}

/// Delete completion markers older than the newest one
fn remove_stale_markers(layout: &Layout) -> Result<()> {
    let markers = layout.markers()?;
    if let Some((_, older)) = markers.split_last() {
        for time in older {
            info!("Removing stale completion marker {}", time);
            utils::remove_entry(&layout.marker_path(*time))?;
        }
    }
    Ok(())
}

/// No session ever committed: the target is an empty mirror
fn clear_mirror(layout: &Layout, report: &mut RegressReport) -> Result<()> {
    for entry in fs::read_dir(layout.mirror_root())? {
        let entry = entry?;
        if entry.file_name() == DATA_DIR {
            continue;
        }
        utils::remove_entry(&entry.path())?;
        report.entries_deleted += 1;
    }
    Ok(())
}

/// Remove temporary files a crash left in the mirror or the data directory
fn sweep_temp_files(layout: &Layout) {
    let walker = WalkDir::new(layout.mirror_root()).into_iter().filter_map(|entry| entry.ok());
    for entry in walker {
        if entry.depth() > 0 && entry.file_name().as_bytes().starts_with(utils::TEMP_PREFIX.as_bytes()) {
            match utils::remove_entry(entry.path()) {
                Ok(()) => debug!("Removed leftover temporary file {:?}", entry.path()),
                Err(err) => warn!("Could not remove leftover {:?}: {}", entry.path(), err),
            }
        }
    }
}

fn reconcile_tree(
    layout: &Layout,
    aborted_time: SessionTime,
    target: IndexedStream<'static, Record>,
    report: &mut RegressReport,
) -> Result<()> {
    let mut mode = CompareMode::FULL.without_hardlinks().without_hashes();
    if !utils::is_privileged() {
        mode = mode.without_ownership();
    }
    let errors = ErrorSink::default();
    let walker = TreeWalker::new(layout.mirror_root(), WalkMode::Mirror, errors.clone());
    let unreadable = walker.unreadable_dirs();
    let mut rollback = Rollback {
        layout,
        aborted_time,
        mode,
        lookup: IncrementLookup::new(),
        tracker: HardlinkTracker::new(),
        stack: Vec::new(),
        report,
    };

    for tuple in collate2(Box::new(walker), target) {
        let (index, mirror, target) = tuple?;
        rollback.close_dirs_outside(&index);
        if mirror.is_none() && walk::is_under_any(&index, &unreadable.borrow()) {
            continue;
        }
        let path = layout.mirror_path(&index);
        if let Err(err) = rollback.reconcile(&index, mirror, target) {
            if !err.is_file_level() {
                return Err(err);
            }
            warn!("Could not roll back {}: {}", index, err);
            rollback.report.errors.push(FileError::new(&index, &path, &err));
        }
    }
    while let Some((index, record, reset)) = rollback.stack.pop() {
        rollback.finish_dir(&index, &record, reset);
    }
    rollback.report.errors.extend(errors.borrow().iter().cloned());
    Ok(())
}

struct Rollback<'a> {
    layout: &'a Layout,
    aborted_time: SessionTime,
    mode: CompareMode,
    lookup: IncrementLookup,
    tracker: HardlinkTracker,
    stack: Vec<(Index, Record, bool)>,
    report: &'a mut RegressReport,
}

impl<'a> Rollback<'a> {
    fn close_dirs_outside(&mut self, index: &Index) {
        while let Some((top, _, _)) = self.stack.last() {
            if top.is_ancestor_of(index) {
                break;
            }
            if let Some((dir, record, reset)) = self.stack.pop() {
                self.finish_dir(&dir, &record, reset);
            }
        }
    }

    fn finish_dir(&mut self, index: &Index, record: &Record, reset: bool) {
        if !reset {
            return;
        }
        let path = self.layout.mirror_path(index);
        match utils::apply_attributes(&path, record) {
            Ok(()) => self.report.attributes_reset += 1,
            Err(err) => {
                warn!("Could not reset attributes of {:?}: {}", path, err);
                self.report.errors.push(FileError::new(index, &path, &err));
            }
        }
    }

    fn inconsistent(index: &Index, message: impl Into<String>) -> BackstepError {
        BackstepError::RegressInconsistency {
            index: index.to_string(),
            message: message.into(),
        }
    }

    /// Increment written by the aborted session, which may carry a bumped time
    fn aborted_increment(&mut self, index: &Index) -> Result<Option<IncrementFile>> {
        Ok(self
            .lookup
            .get(self.layout, index)?
            .into_iter()
            .rev()
            .find(|inc| inc.time >= self.aborted_time))
    }

    /// Open a mirror directory so its children can be rewritten
    fn open_dir(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        let mode = meta.permissions().mode() & 0o7777;
        if !meta.is_dir() || mode & 0o700 == 0o700 {
            return false;
        }
        utils::set_permissions(path, mode | 0o700).is_ok()
    }

    fn reconcile(&mut self, index: &Index, mirror: Option<Record>, target: Option<Record>) -> Result<()> {
        let mirror = mirror.filter(|m| !m.is_absent());
        let target = target.filter(|t| !t.is_absent());
        let path = self.layout.mirror_path(index);
        let opened = self.open_dir(&path);

        let link_first = target
            .as_ref()
            .and_then(|t| self.tracker.resolve_link_target(TreeSide::Mirror, t));
        if let Some(t) = &target {
            self.tracker.add_record(TreeSide::Mirror, t, None);
        }

        match (&mirror, &target) {
            (None, None) => return Ok(()),
            (Some(m), Some(t)) if m.is_dir() && t.is_dir() => {
                let reset = opened || !m.equals(t, self.mode);
                self.stack.push((index.clone(), t.clone(), reset));
                return Ok(());
            }
            (Some(m), Some(t)) if m.equals(t, self.mode) => return Ok(()),
            _ => {}
        }

        let increment = self.aborted_increment(index)?.ok_or_else(|| {
            Self::inconsistent(index, "mirror differs from the last committed snapshot and no increment exists")
        })?;
        trace!("Applying {} increment to {}", increment.kind.suffix(), index);

        match increment.kind {
            IncrementKind::Missing => {
                if target.is_some() {
                    return Err(Self::inconsistent(index, "missing increment for an entry that existed"));
                }
                utils::remove_entry(&path)?;
                self.report.entries_deleted += 1;
            }
            IncrementKind::Dir => {
                let Some(t) = target.filter(Record::is_dir) else {
                    return Err(Self::inconsistent(index, "dir increment but the snapshot has no directory"));
                };
                if !mirror.as_ref().map(Record::is_dir).unwrap_or(false) {
                    utils::remove_entry(&path)?;
                    fs::create_dir(&path).map_err(|e| BackstepError::from_io(e, &path))?;
                    self.report.directories_created += 1;
                }
                self.stack.push((index.clone(), t, true));
            }
            IncrementKind::Diff => {
                let (Some(t), Some(m)) = (target.as_ref(), mirror.as_ref()) else {
                    return Err(Self::inconsistent(index, "diff increment without both entries"));
                };
                if !t.is_regular() || !m.is_regular() {
                    return Err(Self::inconsistent(index, "diff increment for a non-regular entry"));
                }
                let reverse = read_increment(&increment)?;
                let current = utils::with_forced_access(&path, || {
                    fs::read(&path).map_err(|e| BackstepError::from_io(e, &path))
                })?;
                let prior = delta::patch(&current, &reverse)?;
                self.write_regular(&path, &prior, t, link_first)?;
                self.report.entries_patched += 1;
            }
            IncrementKind::Snapshot => {
                let Some(t) = target.as_ref() else {
                    return Err(Self::inconsistent(index, "snapshot increment for an entry that did not exist"));
                };
                if t.is_dir() {
                    return Err(Self::inconsistent(index, "snapshot increment for a directory"));
                }
                if t.is_regular() {
                    let content = read_increment(&increment)?;
                    self.write_regular(&path, &content, t, link_first)?;
                } else {
                    utils::place_special(&path, t)?;
                }
                self.report.entries_replaced += 1;
            }
        }
        Ok(())
    }

    fn write_regular(&self, path: &Path, content: &[u8], record: &Record, link_first: Option<Index>) -> Result<()> {
        if fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(path).map_err(|e| BackstepError::from_io(e, path))?;
        }
        if let Some(first) = link_first {
            let first_path = self.layout.mirror_path(&first);
            let staging = utils::temp_file_beside(path)?.into_temp_path();
            let staging_path = staging.to_path_buf();
            staging.close()?;
            fs::hard_link(&first_path, &staging_path).map_err(|e| BackstepError::from_io(e, &first_path))?;
            let result = utils::replace_with(&staging_path, path);
            utils::remove_leftover(&staging_path);
            return result;
        }
        let mut temp = utils::temp_file_beside(path)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        utils::apply_attributes(temp.path(), record)?;
        temp.persist(path).map_err(|e| BackstepError::from_io(e.error, path))?;
        Ok(())
    }
}

fn read_increment(increment: &IncrementFile) -> Result<Vec<u8>> {
    let path = &increment.path;
    utils::with_forced_access(path, || {
        fs::metadata(path).map_err(|e| BackstepError::from_io(e, path))?;
        compression::read_all(path, increment.gzipped)
    })
    .map_err(|err| match err {
        BackstepError::Compression(msg) => BackstepError::RegressInconsistency {
            index: increment.index.to_string(),
            message: format!("unreadable increment {:?}: {}", path, msg),
        },
        other => other,
    })
}
