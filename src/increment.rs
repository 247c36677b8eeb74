//! Increment engine
//!
//! For an entry about to change in the mirror, writes the reverse increment
//! that recovers its prior state:
//!
//! | prior mirror entry        | increment            |
//! |---------------------------|----------------------|
//! | absent                    | `missing`, empty     |
//! | directory                 | `dir`, empty         |
//! | regular, current regular  | `diff`, reverse delta|
//! | anything else             | `snapshot`, a copy   |
//!
//! Increments are built under a temporary name, given the prior entry's
//! attributes, and then moved to their final name without ever replacing an
//! existing file. If the name is taken the timestamp is bumped by one second.

use crate::compression::CompressionEngine;
use crate::delta;
use crate::error::{BackstepError, Result};
use crate::hardlink::{HardlinkTracker, TreeSide};
use crate::index::Index;
use crate::layout::Layout;
use crate::record::{Record, RecordKind};
use crate::timestamp::{IncrementKind, SessionTime};
use crate::utils;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// An increment that was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    /// Mirror index it belongs to
    pub index: Index,
    /// Time embedded in its name, later than the session time after a collision
    pub time: SessionTime,
    /// Encoding
    pub kind: IncrementKind,
    /// Stored gzip compressed
    pub gzipped: bool,
    /// Final location
    pub path: PathBuf,
    /// Bytes on disk
    pub size: u64,
}

/// Writes increments for one session
pub struct IncrementEngine<'a> {
    layout: &'a Layout,
    compression: CompressionEngine,
    max_retries: u32,
}

/// Decide the increment kind for a changing entry
pub fn choose_kind(current: &Record, prior: &Record) -> Result<IncrementKind> {
    if current.is_absent() && prior.is_absent() {
        return Err(BackstepError::internal(format!(
            "no increment possible for {}: absent on both sides",
            current.index
        )));
    }
    Ok(if prior.is_absent() {
        IncrementKind::Missing
    } else if prior.is_dir() {
        IncrementKind::Dir
    } else if prior.is_regular() && current.is_regular() {
        IncrementKind::Diff
    } else {
        IncrementKind::Snapshot
    })
}

impl<'a> IncrementEngine<'a> {
    /// Engine writing below `layout`'s increments tree
    pub fn new(layout: &'a Layout, compression: CompressionEngine, max_retries: u32) -> Self {
        IncrementEngine {
            layout,
            compression,
            max_retries: max_retries.max(1),
        }
    }

    /// Compression counters for the session so far
    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    /// Write the increment that turns `current` back into `prior`
    ///
    /// `prior` describes the mirror entry as it is now, before the mirror is
    /// updated; its content is read from the mirror. `current_data` is the
    /// new content when `current` is a regular file. Both records are
    /// accounted in `tracker` afterwards.
    pub fn make_increment(
        &mut self,
        current: &Record,
        current_data: Option<&[u8]>,
        prior: &Record,
        session_time: SessionTime,
        tracker: &mut HardlinkTracker,
    ) -> Result<Increment> {
        let kind = choose_kind(current, prior)?;
        let index = if prior.is_absent() { &current.index } else { &prior.index };
        let mirror_path = self.layout.mirror_path(index);

        let increment = match kind {
            IncrementKind::Missing | IncrementKind::Dir => {
                let temp = self.staging_file(index)?;
                self.commit_file(index, temp, kind, false, prior, session_time)?
            }
            IncrementKind::Diff => {
                let new_bytes = current_data.ok_or_else(|| {
                    BackstepError::internal(format!("diff increment for {} without current content", index))
                })?;
                let old_bytes = utils::with_forced_access(&mirror_path, || {
                    fs::read(&mirror_path).map_err(|e| BackstepError::from_io(e, &mirror_path))
                })?;
                let reverse = delta::reverse_delta(new_bytes, &old_bytes)?;
                trace!(
                    "Reverse delta for {}: {} bytes ({} -> {})",
                    index,
                    reverse.len(),
                    new_bytes.len(),
                    old_bytes.len()
                );
                let gzipped = self.should_compress(index);
                let mut temp = self.staging_file(index)?;
                self.write_payload(&mut temp, &reverse, gzipped)?;
                self.commit_file(index, temp, kind, gzipped, prior, session_time)?
            }
            IncrementKind::Snapshot if prior.is_regular() => {
                let old_bytes = utils::with_forced_access(&mirror_path, || {
                    fs::read(&mirror_path).map_err(|e| BackstepError::from_io(e, &mirror_path))
                })?;
                let gzipped = self.should_compress(index);
                let mut temp = self.staging_file(index)?;
                self.write_payload(&mut temp, &old_bytes, gzipped)?;
                self.commit_file(index, temp, kind, gzipped, prior, session_time)?
            }
            IncrementKind::Snapshot => self.commit_special(index, prior, session_time)?,
        };

        tracker.add_record(TreeSide::Source, current, Some(prior));
        tracker.add_record(TreeSide::Mirror, prior, Some(current));
        debug!("Wrote {} increment for {} at {}", increment.kind.suffix(), index, increment.time);
        Ok(increment)
    }

    fn should_compress(&mut self, index: &Index) -> bool {
        let name = index.name().unwrap_or_default();
        let compress = self.compression.should_compress(Path::new(OsStr::from_bytes(name)));
        self.compression.note(compress);
        compress
    }

    fn increment_dir(&self, index: &Index) -> Result<PathBuf> {
        let (dir, _) = self.layout.increment_base(index);
        fs::create_dir_all(&dir).map_err(|e| BackstepError::from_io(e, &dir))?;
        Ok(dir)
    }

    fn staging_file(&self, index: &Index) -> Result<NamedTempFile> {
        let dir = self.increment_dir(index)?;
        tempfile::Builder::new()
            .prefix(utils::TEMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| BackstepError::from_io(e, &dir))
    }

    fn write_payload(&self, temp: &mut NamedTempFile, data: &[u8], gzipped: bool) -> Result<()> {
        if gzipped {
            let mut encoder = self.compression.encoder(temp.as_file_mut());
            encoder.write_all(data)?;
            encoder.finish()?;
        } else {
            temp.as_file_mut().write_all(data)?;
        }
        temp.as_file().sync_all()?;
        Ok(())
    }

    /// Whether any increment of `index` already uses `time`
    fn occupied(&self, index: &Index, time: SessionTime) -> bool {
        [
            IncrementKind::Missing,
            IncrementKind::Dir,
            IncrementKind::Diff,
            IncrementKind::Snapshot,
        ]
        .iter()
        .flat_map(|kind| [false, true].map(|gz| self.layout.increment_path(index, time, *kind, gz)))
        .any(|path| fs::symlink_metadata(path).is_ok())
    }

    fn collision_error(&self, index: &Index, time: SessionTime, kind: IncrementKind) -> BackstepError {
        BackstepError::IncrementCollision {
            path: self.layout.increment_path(index, time, kind, false),
            attempts: self.max_retries,
        }
    }

    fn commit_file(
        &self,
        index: &Index,
        mut temp: NamedTempFile,
        kind: IncrementKind,
        gzipped: bool,
        prior: &Record,
        session_time: SessionTime,
    ) -> Result<Increment> {
        utils::apply_attributes(temp.path(), prior)?;
        let size = temp.as_file().metadata()?.len();
        let mut time = session_time;
        for _ in 0..self.max_retries {
            if self.occupied(index, time) {
                warn!("Increment name for {} at {} is taken, trying {}", index, time, time.next());
                time = time.next();
                continue;
            }
            let path = self.layout.increment_path(index, time, kind, gzipped);
            match temp.persist_noclobber(&path) {
                Ok(_) => {
                    return Ok(Increment {
                        index: index.clone(),
                        time,
                        kind,
                        gzipped,
                        path,
                        size,
                    })
                }
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("Increment {:?} appeared concurrently, trying {}", path, time.next());
                    temp = err.file;
                    time = time.next();
                }
                Err(err) => return Err(BackstepError::from_io(err.error, path)),
            }
        }
        Err(self.collision_error(index, session_time, kind))
    }

    /// Snapshot increment of a symlink, fifo, socket, or device node
    ///
    /// A device node that cannot be created without privilege is stored as
    /// an empty placeholder; its numbers live in the metadata snapshot.
    fn commit_special(&self, index: &Index, prior: &Record, session_time: SessionTime) -> Result<Increment> {
        let dir = self.increment_dir(index)?;
        let staging = self.staging_file(index)?.into_temp_path();
        let staging_path = staging.to_path_buf();
        staging.close()?;

        match utils::create_special(&staging_path, prior) {
            Ok(()) => {}
            Err(BackstepError::PermissionDenied { .. }) if matches!(prior.kind, RecordKind::Device { .. }) => {
                debug!("Storing placeholder for device {} without privilege", index);
                File::create(&staging_path).map_err(|e| BackstepError::from_io(e, &dir))?;
            }
            Err(err) => return Err(err),
        }
        let cleanup = |err: BackstepError| {
            utils::remove_leftover(&staging_path);
            err
        };
        utils::apply_attributes(&staging_path, prior).map_err(cleanup)?;

        let mut time = session_time;
        for _ in 0..self.max_retries {
            if !self.occupied(index, time) {
                let path = self.layout.increment_path(index, time, IncrementKind::Snapshot, false);
                fs::rename(&staging_path, &path).map_err(|e| cleanup(BackstepError::from_io(e, &path)))?;
                return Ok(Increment {
                    index: index.clone(),
                    time,
                    kind: IncrementKind::Snapshot,
                    gzipped: false,
                    path,
                    size: 0,
                });
            }
            warn!("Increment name for {} at {} is taken, trying {}", index, time, time.next());
            time = time.next();
        }
        Err(cleanup(self.collision_error(index, session_time, IncrementKind::Snapshot)))
    }
}
