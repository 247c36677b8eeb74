//! Backup sessions
//!
//! A session walks the live source and the previous metadata snapshot side
//! by side. Entries that differ get a reverse increment first and are then
//! updated in the mirror. Every source record goes into the new snapshot,
//! and the session commits by writing its completion marker and removing the
//! previous one.
//!
//! Until the marker exists the destination reads as an interrupted session,
//! so any failure (or a hook refusing to continue) leaves something the
//! regress engine knows how to roll back.

use crate::backstep;
use crate::collate::{collate2, IndexedStream};
use crate::compression::CompressionEngine;
use crate::error::{BackstepError, Result};
use crate::hardlink::{HardlinkTracker, TreeSide};
use crate::increment::{Increment, IncrementEngine};
use crate::index::Index;
use crate::layout::{Layout, DATA_DIR};
use crate::metadata::{MetadataStore, SnapshotWriter};
use crate::record::{CompareMode, Record, RecordKind};
use crate::regress;
use crate::timestamp::SessionTime;
use crate::types::{
    BackstepConfig, EntryAction, FileError, HostInfo, ProgressCallback, ProgressInfo, SessionHook, SessionReport,
    SessionStats,
};
use crate::utils;
use crate::walk::{self, ErrorSink, TreeWalker, WalkMode};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Back up `source` into the destination at `dest`
///
/// Creates the repository with `config` when `dest` has none; an existing
/// repository keeps its own configuration.
pub fn run_backup_session(source: &Path, dest: &Path, config: &BackstepConfig) -> Result<SessionReport> {
    let repository = backstep::load_or_init(dest, config)?;
    let layout = Layout::new(dest, repository.config.timestamp_separator);
    BackupSession::new(source, layout, repository.config).run()
}

/// One backup session, configured before it runs
pub struct BackupSession<'a> {
    source: PathBuf,
    layout: Layout,
    config: BackstepConfig,
    hooks: &'a [Box<dyn SessionHook>],
    progress: Option<ProgressCallback>,
    time: Option<SessionTime>,
}

impl<'a> BackupSession<'a> {
    /// Session copying `source` into the destination described by `layout`
    pub fn new(source: impl Into<PathBuf>, layout: Layout, config: BackstepConfig) -> Self {
        BackupSession {
            source: source.into(),
            layout,
            config,
            hooks: &[],
            progress: None,
            time: None,
        }
    }

    /// Hooks called around the session
    pub fn with_hooks(mut self, hooks: &'a [Box<dyn SessionHook>]) -> Self {
        self.hooks = hooks;
        self
    }

    /// Progress reporting after each entry
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Use `time` instead of the current clock
    ///
    /// It is still moved past the newest existing session if needed.
    pub fn at(mut self, time: SessionTime) -> Self {
        self.time = Some(time);
        self
    }

    /// Run the session to its commit
    #[instrument(skip(self), fields(source = ?self.source, dest = ?self.layout.mirror_root()))]
    pub fn run(self) -> Result<SessionReport> {
        let start = Instant::now();
        self.config.validate()?;
        let source_meta = fs::metadata(&self.source).map_err(|e| BackstepError::from_io(e, &self.source))?;
        if !source_meta.is_dir() {
            return Err(BackstepError::InvalidConfiguration(format!(
                "source {:?} is not a directory",
                self.source
            )));
        }
        fs::create_dir_all(self.layout.data_dir())?;
        let exclude = nested_destination(&self.source, self.layout.mirror_root())?;

        let regress_report = if regress::detect(&self.layout)?.needs_regress() {
            info!("Destination holds an interrupted session, rolling it back first");
            Some(regress::regress_destination(&self.layout, &self.config)?)
        } else {
            None
        };

        let previous = self.layout.markers()?.last().copied();
        if previous.is_none() {
            ensure_empty_mirror(&self.layout)?;
        }
        let mut time = self.time.unwrap_or_else(SessionTime::now);
        if let Some(prev) = previous {
            if time <= prev {
                warn!("Session time {} is not after previous session {}, using {}", time, prev, prev.next());
                time = prev.next();
            }
        }
        info!("Starting backup session {} (previous: {:?})", time, previous.map(|t| t.to_string()));
        for hook in self.hooks {
            hook.pre_session(time)?;
        }

        let store = MetadataStore::new(
            self.layout.clone(),
            self.config.compress_metadata,
            self.config.full_snapshot_interval,
        )?;
        let prior_stream: IndexedStream<'static, Record> = match previous {
            Some(prev) => Box::new(store.iterate(prev)?),
            None => Box::new(std::iter::empty()),
        };

        let errors = ErrorSink::default();
        let walker = TreeWalker::with_exclude(&self.source, WalkMode::Source, exclude, errors.clone());
        let unreadable = walker.unreadable_dirs();
        let writer = store.open_snapshot(time)?;
        let increments = match previous {
            Some(_) => Some(IncrementEngine::new(
                &self.layout,
                CompressionEngine::new(self.config.compression_strategy())?,
                self.config.max_collision_retries,
            )),
            None => None,
        };

        let mut run = SessionRun {
            source: &self.source,
            layout: &self.layout,
            config: &self.config,
            hooks: self.hooks,
            progress: self.progress.clone(),
            time,
            increments,
            tracker: HardlinkTracker::new(),
            writer,
            stack: Vec::new(),
            stats: SessionStats::default(),
            errors: Vec::new(),
            failed: HashSet::new(),
            unreadable,
            processed: 0,
        };

        for tuple in collate2(Box::new(walker), prior_stream) {
            let (index, current, prior) = tuple?;
            run.close_dirs_outside(&index)?;
            run.process(index, current, prior)?;
        }
        while let Some(dir) = run.stack.pop() {
            run.finish_dir(dir)?;
        }

        let SessionRun {
            writer,
            stats,
            errors: mut entry_errors,
            ..
        } = run;
        writer.close()?;

        let mut all_errors = errors.borrow().clone();
        all_errors.append(&mut entry_errors);
        let report = SessionReport {
            time,
            previous,
            stats,
            errors: all_errors,
            regress: regress_report,
            host: HostInfo::default(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        for hook in self.hooks {
            hook.post_session(&report)?;
        }

        self.commit(&store, &report)?;
        info!(
            "Session {} committed: {} new, {} changed, {} deleted, {} errors in {}ms",
            time,
            report.stats.new_entries,
            report.stats.changed_entries,
            report.stats.deleted_entries,
            report.errors.len(),
            report.duration_ms
        );
        Ok(report)
    }

    fn commit(&self, store: &MetadataStore, report: &SessionReport) -> Result<()> {
        let time = report.time;
        if !report.errors.is_empty() {
            let mut log = String::new();
            for err in &report.errors {
                log.push_str(&err.to_string());
                log.push('\n');
            }
            utils::atomic_write(&self.layout.error_log_path(time), log.as_bytes())?;
        }
        utils::atomic_write(&self.layout.stats_path(time), &serde_json::to_vec_pretty(report)?)?;
        store.finalize(time)?;

        utils::atomic_write(&self.layout.marker_path(time), b"")?;
        debug!("Wrote completion marker for {}", time);
        if let Some(previous) = report.previous {
            let old = self.layout.marker_path(previous);
            match fs::remove_file(&old) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(BackstepError::from_io(err, old)),
            }
        }
        Ok(())
    }
}

/// The destination's path inside the source, which the walk must skip
fn nested_destination(source: &Path, dest: &Path) -> Result<Option<PathBuf>> {
    let source_c = fs::canonicalize(source).map_err(|e| BackstepError::from_io(e, source))?;
    let dest_c = fs::canonicalize(dest).map_err(|e| BackstepError::from_io(e, dest))?;
    if source_c.starts_with(&dest_c) {
        return Err(BackstepError::InvalidConfiguration(format!(
            "source {:?} lies inside destination {:?}",
            source, dest
        )));
    }
    Ok(dest_c.strip_prefix(&source_c).ok().map(|rel| source.join(rel)))
}

/// Refuse to adopt a destination holding files but no history
fn ensure_empty_mirror(layout: &Layout) -> Result<()> {
    for entry in fs::read_dir(layout.mirror_root())? {
        let entry = entry?;
        if entry.file_name() != DATA_DIR {
            return Err(BackstepError::InvalidConfiguration(format!(
                "destination {:?} is not empty and has no backup history",
                layout.mirror_root()
            )));
        }
    }
    Ok(())
}

/// What happens to a mirror directory once its children are done
enum DirFate {
    /// Still a directory with these attributes
    Keep(Record),
    /// No longer in the source
    Remove,
    /// Turned into a non-directory in the source
    Replace(Record, Option<Vec<u8>>),
}

struct PendingDir {
    index: Index,
    fate: DirFate,
    dirty: bool,
}

struct SessionRun<'s> {
    source: &'s Path,
    layout: &'s Layout,
    config: &'s BackstepConfig,
    hooks: &'s [Box<dyn SessionHook>],
    progress: Option<ProgressCallback>,
    time: SessionTime,
    increments: Option<IncrementEngine<'s>>,
    tracker: HardlinkTracker,
    writer: SnapshotWriter,
    stack: Vec<PendingDir>,
    stats: SessionStats,
    errors: Vec<FileError>,
    failed: HashSet<Index>,
    unreadable: Rc<RefCell<Vec<Index>>>,
    processed: usize,
}

impl<'s> SessionRun<'s> {
    /// Finish every open directory that does not contain `index`
    fn close_dirs_outside(&mut self, index: &Index) -> Result<()> {
        while let Some(top) = self.stack.last() {
            if top.index.is_ancestor_of(index) {
                break;
            }
            if let Some(dir) = self.stack.pop() {
                self.finish_dir(dir)?;
            }
        }
        Ok(())
    }

    fn mark_dirty(&mut self) {
        for dir in &mut self.stack {
            dir.dirty = true;
        }
    }

    fn finish_dir(&mut self, dir: PendingDir) -> Result<()> {
        let path = self.layout.mirror_path(&dir.index);
        let outcome = match dir.fate {
            DirFate::Keep(record) => {
                if dir.dirty {
                    trace!("Applying directory attributes to {}", dir.index);
                    utils::apply_attributes(&path, &record)
                } else {
                    Ok(())
                }
            }
            DirFate::Remove => utils::remove_entry(&path),
            DirFate::Replace(record, data) => {
                utils::remove_entry(&path).and_then(|_| self.write_mirror(&record, data.as_deref(), None).map(|_| ()))
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_file_level() => {
                warn!("Could not finish directory {}: {}", dir.index, err);
                self.errors.push(FileError::new(&dir.index, &path, &err));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn notify(&mut self, index: &Index, action: EntryAction, bytes: u64) -> Result<()> {
        for hook in self.hooks {
            hook.post_entry(index, action)?;
        }
        self.processed += 1;
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: "Backing up".to_string(),
                current_item: Some(index.to_string()),
                processed: self.processed,
                bytes_processed: bytes,
            });
        }
        Ok(())
    }

    /// Handle one aligned pair of source and previous-snapshot records
    fn process(&mut self, index: Index, current: Option<Record>, prior: Option<Record>) -> Result<()> {
        let prior = prior.filter(|p| !p.is_absent());
        if let Some(current) = &current {
            self.stats.source_entries += 1;
            self.stats.source_bytes += current.size().unwrap_or(0);
        }

        let Some(mut current) = current else {
            let Some(prior) = prior else {
                return Ok(());
            };
            if walk::is_under_any(&index, &self.unreadable.borrow()) {
                trace!("Keeping {} below an unreadable directory", index);
                self.writer.write_record(&prior)?;
                return Ok(());
            }
            return self.delete(prior);
        };

        let opened = current.is_dir() && self.make_dir_writable(&index);

        if let Some(prior) = &prior {
            if self.unchanged(&current, prior)? {
                current.set_sha256(prior.sha256().map(String::from));
                self.tracker.add_record(TreeSide::Source, &current, Some(prior));
                self.tracker.add_record(TreeSide::Mirror, prior, Some(&current));
                if current.is_dir() {
                    self.stack.push(PendingDir {
                        index: index.clone(),
                        fate: DirFate::Keep(current.clone()),
                        dirty: opened,
                    });
                }
                self.writer.write_record(&current)?;
                self.stats.unchanged_entries += 1;
                return self.notify(&index, EntryAction::Unchanged, 0);
            }
        }

        self.update(current, prior)
    }

    fn unchanged(&self, current: &Record, prior: &Record) -> Result<bool> {
        if !current.equals(prior, CompareMode::SESSION) || !self.tracker.rorp_eq_hardlink_view(current, prior) {
            return Ok(false);
        }
        if !self.config.compare_hashes || !current.is_regular() {
            return Ok(true);
        }
        let Some(recorded) = prior.sha256() else {
            return Ok(true);
        };
        let path = current.index.under(self.source);
        match utils::with_forced_access(&path, || utils::hash_file_content(&path)) {
            Ok(digest) => Ok(digest == recorded),
            Err(err) if err.is_file_level() => {
                debug!("Could not hash {:?}, treating as changed: {}", path, err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Keep a mirror directory writable for the session; its real mode is
    /// applied when the directory is finished
    fn make_dir_writable(&self, index: &Index) -> bool {
        let path = self.layout.mirror_path(index);
        let Ok(meta) = fs::symlink_metadata(&path) else {
            return false;
        };
        let mode = meta.permissions().mode() & 0o7777;
        if !meta.is_dir() || mode & 0o700 == 0o700 {
            return false;
        }
        trace!("Opening up mirror directory {:?} ({:o})", path, mode);
        match utils::set_permissions(&path, mode | 0o700) {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not make {:?} writable: {}", path, err);
                false
            }
        }
    }

    /// Record a file-level failure; the entry keeps its previous state
    fn skip(&mut self, index: &Index, path: &Path, err: BackstepError, prior: Option<&Record>) -> Result<()> {
        if !err.is_file_level() {
            return Err(err);
        }
        warn!("Skipping {}: {}", index, err);
        self.errors.push(FileError::new(index, path, &err));
        self.failed.insert(index.clone());
        if let Some(prior) = prior {
            self.writer.write_record(prior)?;
            if prior.is_dir() {
                self.stack.push(PendingDir {
                    index: index.clone(),
                    fate: DirFate::Keep(prior.clone()),
                    dirty: true,
                });
            }
        }
        self.notify(index, EntryAction::Failed, 0)
    }

    fn record_increment(&mut self, increment: &Increment) {
        self.stats.increment_files += 1;
        self.stats.increment_bytes += increment.size;
        if increment.gzipped {
            self.stats.compressed_increments += 1;
        }
    }

    fn delete(&mut self, prior: Record) -> Result<()> {
        let index = prior.index.clone();
        let path = self.layout.mirror_path(&index);
        let absent = Record::absent(index.clone());
        if let Some(engine) = self.increments.as_mut() {
            match engine.make_increment(&absent, None, &prior, self.time, &mut self.tracker) {
                Ok(increment) => self.record_increment(&increment),
                Err(err) => return self.skip(&index, &path, err, Some(&prior)),
            }
        }
        self.mark_dirty();
        if prior.is_dir() {
            self.make_dir_writable(&index);
            self.stack.push(PendingDir {
                index: index.clone(),
                fate: DirFate::Remove,
                dirty: false,
            });
        } else if let Err(err) = utils::remove_entry(&path) {
            return self.skip(&index, &path, err, Some(&prior));
        }
        self.stats.deleted_entries += 1;
        debug!("Deleted {}", index);
        self.notify(&index, EntryAction::Deleted, 0)
    }

    fn update(&mut self, mut current: Record, prior: Option<Record>) -> Result<()> {
        let index = current.index.clone();
        let source_path = index.under(self.source);
        let mirror_path = self.layout.mirror_path(&index);

        let data = if current.is_regular() {
            match utils::with_forced_access(&source_path, || {
                fs::read(&source_path).map_err(|e| BackstepError::from_io(e, &source_path))
            }) {
                Ok(data) => {
                    if let RecordKind::Regular { size, .. } = &mut current.kind {
                        *size = data.len() as u64;
                    }
                    current.set_sha256(Some(utils::hash_data(&data)));
                    Some(data)
                }
                Err(err) => return self.skip(&index, &source_path, err, prior.as_ref()),
            }
        } else {
            None
        };

        let link_target = self
            .tracker
            .resolve_link_target(TreeSide::Source, &current)
            .filter(|first| !self.failed.contains(first));

        let absent = Record::absent(index.clone());
        let prior_record = prior.as_ref().unwrap_or(&absent);
        let increment = match self.increments.as_mut() {
            Some(engine) => {
                match engine.make_increment(&current, data.as_deref(), prior_record, self.time, &mut self.tracker) {
                    Ok(increment) => Some(increment),
                    Err(err) => return self.skip(&index, &mirror_path, err, prior.as_ref()),
                }
            }
            None => {
                self.tracker.add_record(TreeSide::Source, &current, None);
                None
            }
        };

        self.mark_dirty();
        let replaces_dir = prior.as_ref().map(Record::is_dir).unwrap_or(false) && !current.is_dir();
        let written = if replaces_dir {
            // Old children still need their increments, so the swap waits
            self.stack.push(PendingDir {
                index: index.clone(),
                fate: DirFate::Replace(current.clone(), data.clone()),
                dirty: true,
            });
            Ok(data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
        } else {
            self.write_mirror(&current, data.as_deref(), link_target)
        };

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(increment) = &increment {
                    // The mirror still holds the prior state, which the increment must not be applied to
                    discard_increment(&index, &increment.path)?;
                }
                return self.skip(&index, &mirror_path, err, prior.as_ref());
            }
        };
        if let Some(increment) = &increment {
            self.record_increment(increment);
        }

        if current.is_dir() {
            self.stack.push(PendingDir {
                index: index.clone(),
                fate: DirFate::Keep(current.clone()),
                dirty: true,
            });
        }
        self.writer.write_record(&current)?;
        self.stats.mirror_bytes_written += bytes;
        let action = if prior.is_some() {
            self.stats.changed_entries += 1;
            EntryAction::Updated
        } else {
            self.stats.new_entries += 1;
            EntryAction::Created
        };
        trace!("{:?} {}", action, index);
        self.notify(&index, action, bytes)
    }

    /// Make the mirror entry at `record.index` match `record`
    ///
    /// Returns the number of content bytes written.
    fn write_mirror(&mut self, record: &Record, data: Option<&[u8]>, link_target: Option<Index>) -> Result<u64> {
        let path = self.layout.mirror_path(&record.index);
        match &record.kind {
            RecordKind::Directory { .. } => {
                match fs::symlink_metadata(&path) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        utils::remove_entry(&path)?;
                        fs::create_dir(&path).map_err(|e| BackstepError::from_io(e, &path))?;
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        fs::create_dir(&path).map_err(|e| BackstepError::from_io(e, &path))?;
                    }
                    Err(err) => return Err(BackstepError::from_io(err, &path)),
                }
                Ok(0)
            }
            RecordKind::Regular { .. } => {
                if let Some(first) = link_target {
                    self.link_mirror(&first, &path)?;
                    self.stats.hardlinks_linked += 1;
                    return Ok(0);
                }
                let data = data.ok_or_else(|| BackstepError::internal(format!("no content for {}", record.index)))?;
                let mut temp = utils::temp_file_beside(&path)?;
                temp.write_all(data)?;
                temp.as_file().sync_all()?;
                utils::apply_attributes(temp.path(), record)?;
                if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                    fs::remove_dir_all(&path).map_err(|e| BackstepError::from_io(e, &path))?;
                }
                temp.persist(&path).map_err(|e| BackstepError::from_io(e.error, &path))?;
                Ok(data.len() as u64)
            }
            RecordKind::Absent => Err(BackstepError::internal(format!(
                "cannot write absent entry {}",
                record.index
            ))),
            _ => {
                utils::place_special(&path, record)?;
                Ok(0)
            }
        }
    }

    fn link_mirror(&self, first: &Index, path: &Path) -> Result<()> {
        let first_path = self.layout.mirror_path(first);
        let staging = utils::temp_file_beside(path)?.into_temp_path();
        let staging_path = staging.to_path_buf();
        staging.close()?;
        fs::hard_link(&first_path, &staging_path).map_err(|e| BackstepError::from_io(e, &first_path))?;
        let result = utils::replace_with(&staging_path, path);
        // A rename onto another link of the same inode leaves the source name behind
        utils::remove_leftover(&staging_path);
        trace!("Linked {:?} to {:?}", path, first_path);
        result
    }
}

/// Remove an increment whose mirror update failed
///
/// The mirror still holds the state the increment was built from, so leaving
/// the increment in place would let a later restore apply it to the wrong
/// base. Failing to remove it stops the session.
fn discard_increment(index: &Index, path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Discarded increment {:?} for {}", path, index);
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BackstepError::RegressInconsistency {
            index: index.to_string(),
            message: format!("could not remove increment {:?} after failed mirror write: {}", path, err),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SnapshotForm;
    use crate::restore;
    use crate::timestamp::IncrementKind;
    use filetime::FileTime;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        dest: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        fs::create_dir_all(&source).unwrap();
        Fixture {
            _temp: temp,
            source,
            dest,
        }
    }

    fn session(fx: &Fixture, secs: i64) -> SessionReport {
        let config = BackstepConfig::default();
        let repository = backstep::load_or_init(&fx.dest, &config).unwrap();
        let layout = Layout::new(&fx.dest, repository.config.timestamp_separator);
        BackupSession::new(&fx.source, layout, repository.config)
            .at(SessionTime::from_secs(secs))
            .run()
            .unwrap()
    }

    fn write_with_mtime(path: &Path, content: &[u8], mtime: i64) {
        fs::write(path, content).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[test]
    fn test_first_session_mirrors_tree() {
        let fx = fixture();
        fs::create_dir(fx.source.join("dir")).unwrap();
        write_with_mtime(&fx.source.join("dir/file.txt"), b"hello", 1_000);
        std::os::unix::fs::symlink("dir/file.txt", fx.source.join("link")).unwrap();

        let report = session(&fx, 10_000);
        assert_eq!(report.previous, None);
        assert_eq!(report.stats.new_entries, 4);
        assert_eq!(report.stats.increment_files, 0);
        assert!(!report.is_degraded());
        assert_eq!(fs::read(fx.dest.join("dir/file.txt")).unwrap(), b"hello");
        assert_eq!(fs::read_link(fx.dest.join("link")).unwrap(), Path::new("dir/file.txt"));

        let layout = Layout::new(&fx.dest, ':');
        assert_eq!(layout.markers().unwrap(), vec![SessionTime::from_secs(10_000)]);
        assert!(layout.stats_path(SessionTime::from_secs(10_000)).exists());

        let meta = fs::metadata(fx.dest.join("dir/file.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_000);
    }

    #[test]
    fn test_second_session_writes_increments() {
        let fx = fixture();
        write_with_mtime(&fx.source.join("a"), b"hello", 1_000);
        write_with_mtime(&fx.source.join("gone"), b"bye", 1_000);
        filetime::set_file_mtime(&fx.source, FileTime::from_unix_time(1_000, 0)).unwrap();
        session(&fx, 10_000);

        write_with_mtime(&fx.source.join("a"), b"goodbye", 2_000);
        fs::remove_file(fx.source.join("gone")).unwrap();
        write_with_mtime(&fx.source.join("new"), b"fresh", 2_000);
        filetime::set_file_mtime(&fx.source, FileTime::from_unix_time(2_000, 0)).unwrap();
        let report = session(&fx, 20_000);

        assert_eq!(report.previous, Some(SessionTime::from_secs(10_000)));
        assert_eq!(report.stats.changed_entries, 2); // root and a
        assert_eq!(report.stats.new_entries, 1);
        assert_eq!(report.stats.deleted_entries, 1);
        assert!(!fx.dest.join("gone").exists());

        let layout = Layout::new(&fx.dest, ':');
        let t2 = SessionTime::from_secs(20_000);
        let kinds = |name: &str| {
            layout
                .increments_for(&Index::root().join(name))
                .unwrap()
                .into_iter()
                .map(|inc| (inc.time, inc.kind))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds("a"), vec![(t2, IncrementKind::Diff)]);
        assert_eq!(kinds("gone"), vec![(t2, IncrementKind::Snapshot)]);
        assert_eq!(kinds("new"), vec![(t2, IncrementKind::Missing)]);
        assert_eq!(layout.markers().unwrap(), vec![t2]);
        assert_eq!(fs::metadata(layout.marker_path(t2)).unwrap().len(), 0);

        let old: Vec<Record> = restore::read_tree_at(&fx.dest, SessionTime::from_secs(10_000))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(old.iter().any(|r| r.index == Index::root().join("gone")));
    }

    #[test]
    fn test_discard_increment_after_failed_write() {
        let fx = fixture();
        let index = Index::root().join("a");
        let increment = fx.dest.join("a.2024-01-01T00:00:00Z.diff");
        fs::create_dir_all(&fx.dest).unwrap();
        fs::write(&increment, b"delta").unwrap();

        discard_increment(&index, &increment).unwrap();
        assert!(!increment.exists());
        // Already gone
        discard_increment(&index, &increment).unwrap();

        // A name that cannot be unlinked must stop the session
        fs::create_dir_all(increment.join("child")).unwrap();
        let err = discard_increment(&index, &increment).unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_file_level());
        assert!(err.to_string().contains("after failed mirror write"));
    }

    #[test]
    fn test_unchanged_session_carries_digests() {
        let fx = fixture();
        write_with_mtime(&fx.source.join("a"), b"same", 1_000);
        session(&fx, 10_000);
        let report = session(&fx, 20_000);
        assert!(!report.stats.has_changes());
        assert_eq!(report.stats.increment_files, 0);

        let store = MetadataStore::new(Layout::new(&fx.dest, ':'), true, 10).unwrap();
        let records: Vec<Record> = store
            .iterate(SessionTime::from_secs(20_000))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let a = records.iter().find(|r| r.index == Index::root().join("a")).unwrap();
        assert_eq!(a.sha256(), Some(utils::hash_data(b"same").as_str()));
    }

    #[test]
    fn test_session_time_moves_past_previous() {
        let fx = fixture();
        session(&fx, 10_000);
        let report = session(&fx, 5_000);
        assert_eq!(report.time, SessionTime::from_secs(10_001));
    }

    #[test]
    fn test_snapshots_become_diffs() {
        let fx = fixture();
        write_with_mtime(&fx.source.join("a"), b"x", 1_000);
        session(&fx, 10_000);
        write_with_mtime(&fx.source.join("a"), b"y", 2_000);
        session(&fx, 20_000);

        let layout = Layout::new(&fx.dest, ':');
        let forms: Vec<SnapshotForm> = layout.snapshots().unwrap().into_iter().map(|s| s.form).collect();
        assert_eq!(forms, vec![SnapshotForm::Full, SnapshotForm::Diff]);
    }

    #[test]
    fn test_hardlinks_stay_linked_in_mirror() {
        let fx = fixture();
        fs::write(fx.source.join("a"), b"shared").unwrap();
        fs::hard_link(fx.source.join("a"), fx.source.join("b")).unwrap();
        let report = session(&fx, 10_000);
        assert_eq!(report.stats.hardlinks_linked, 1);
        let a = fs::metadata(fx.dest.join("a")).unwrap();
        let b = fs::metadata(fx.dest.join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_directory_replaced_by_file() {
        let fx = fixture();
        fs::create_dir(fx.source.join("x")).unwrap();
        fs::write(fx.source.join("x/inner"), b"inside").unwrap();
        session(&fx, 10_000);

        fs::remove_dir_all(fx.source.join("x")).unwrap();
        fs::write(fx.source.join("x"), b"now a file").unwrap();
        let report = session(&fx, 20_000);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(fs::read(fx.dest.join("x")).unwrap(), b"now a file");

        let layout = Layout::new(&fx.dest, ':');
        let inner = layout.increments_for(&Index::from_components(vec!["x", "inner"])).unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(fs::read(&inner[0].path).map(|b| b.is_empty()).ok(), Some(false));
    }

    #[test]
    fn test_nested_destination_is_skipped() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().to_path_buf();
        fs::write(source.join("file"), b"data").unwrap();
        let dest = source.join("backup");
        let report = run_backup_session(&source, &dest, &BackstepConfig::default()).unwrap();
        assert_eq!(report.stats.source_entries, 2);
        assert!(dest.join("file").exists());
        assert!(!dest.join("backup").exists());
    }

    #[test]
    fn test_non_empty_destination_rejected() {
        let fx = fixture();
        fs::create_dir_all(&fx.dest).unwrap();
        fs::write(fx.dest.join("stray"), b"").unwrap();
        let result = run_backup_session(&fx.source, &fx.dest, &BackstepConfig::default());
        assert!(matches!(result, Err(BackstepError::InvalidConfiguration(_))));
    }

    struct AbortAfter(usize, std::sync::atomic::AtomicUsize);

    impl SessionHook for AbortAfter {
        fn post_entry(&self, _index: &Index, _action: EntryAction) -> Result<()> {
            let seen = self.1.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if seen >= self.0 {
                return Err(BackstepError::Aborted("test".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_aborted_session_is_rolled_back_by_next() {
        let fx = fixture();
        write_with_mtime(&fx.source.join("a"), b"one", 1_000);
        write_with_mtime(&fx.source.join("b"), b"two", 1_000);
        session(&fx, 10_000);

        write_with_mtime(&fx.source.join("a"), b"three", 2_000);
        write_with_mtime(&fx.source.join("b"), b"four", 2_000);
        let hooks: Vec<Box<dyn SessionHook>> = vec![Box::new(AbortAfter(2, Default::default()))];
        let layout = Layout::new(&fx.dest, ':');
        let result = BackupSession::new(&fx.source, layout.clone(), BackstepConfig::default())
            .with_hooks(&hooks)
            .at(SessionTime::from_secs(20_000))
            .run();
        assert!(matches!(result, Err(BackstepError::Aborted(_))));
        assert_eq!(fs::read(fx.dest.join("a")).unwrap(), b"three");
        assert_eq!(layout.markers().unwrap(), vec![SessionTime::from_secs(10_000)]);

        let report = session(&fx, 30_000);
        let regress = report.regress.expect("rolled back first");
        assert_eq!(regress.aborted_time, Some(SessionTime::from_secs(20_000)));
        assert_eq!(report.previous, Some(SessionTime::from_secs(10_000)));
        assert_eq!(fs::read(fx.dest.join("b")).unwrap(), b"four");
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_clock_running_backwards_bumps_session_time() {
        let fx = fixture();
        write_with_mtime(&fx.source.join("a"), b"one", 1_000);
        session(&fx, 20_000);
        write_with_mtime(&fx.source.join("a"), b"two", 2_000);

        let report = session(&fx, 10_000);
        assert_eq!(report.time, SessionTime::from_secs(20_001));
        assert_eq!(report.previous, Some(SessionTime::from_secs(20_000)));
        assert!(logs_contain("is not after previous session"));
        let layout = Layout::new(&fx.dest, ':');
        assert_eq!(layout.markers().unwrap(), vec![SessionTime::from_secs(20_001)]);
    }
}
