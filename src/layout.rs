//! On-disk layout of a destination
//!
//! ```text
//! <dest>/                                  mirror
//! <dest>/backstep-data/backstep.json       repository metadata
//! <dest>/backstep-data/current_mirror.<ts>.data
//! <dest>/backstep-data/mirror_metadata.<ts>.(snapshot|diff)[.gz]
//! <dest>/backstep-data/session_statistics.<ts>.data
//! <dest>/backstep-data/error_log.<ts>.data
//! <dest>/backstep-data/increments.<ts>.dir  increment of the root
//! <dest>/backstep-data/increments/<index>.<ts>.<kind>[.gz]
//! ```

use crate::error::Result;
use crate::index::Index;
use crate::timestamp::{IncrementKind, SessionTime, TimedName};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Name of the private data directory inside the destination
pub const DATA_DIR: &str = "backstep-data";
/// Name of the increments tree inside the data directory
pub const INCREMENTS_DIR: &str = "increments";
/// Repository metadata file inside the data directory
pub const REPOSITORY_FILE: &str = "backstep.json";

const MARKER_PREFIX: &str = "current_mirror";
const METADATA_PREFIX: &str = "mirror_metadata";
const STATS_PREFIX: &str = "session_statistics";
const ERROR_LOG_PREFIX: &str = "error_log";
const DATA_SUFFIX: &str = "data";

/// Whether a metadata snapshot holds every record or a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotForm {
    /// Complete serialized listing
    Full,
    /// Forward delta against the previous snapshot's bytes
    Diff,
}

impl SnapshotForm {
    fn suffix(&self) -> &'static str {
        match self {
            SnapshotForm::Full => "snapshot",
            SnapshotForm::Diff => "diff",
        }
    }
}

/// A metadata snapshot file found in the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// Session time
    pub time: SessionTime,
    /// Full or diff
    pub form: SnapshotForm,
    /// Gzip compressed
    pub gzipped: bool,
    /// Location
    pub path: PathBuf,
}

/// An increment file found in the increments tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementFile {
    /// Mirror index the increment belongs to
    pub index: Index,
    /// Session that wrote it
    pub time: SessionTime,
    /// Encoding
    pub kind: IncrementKind,
    /// Gzip compressed
    pub gzipped: bool,
    /// Location
    pub path: PathBuf,
}

/// Paths of one destination
#[derive(Debug, Clone)]
pub struct Layout {
    mirror_root: PathBuf,
    data_dir: PathBuf,
    separator: char,
}

impl Layout {
    /// Layout of the destination at `dest`
    pub fn new(dest: impl Into<PathBuf>, separator: char) -> Self {
        let mirror_root = dest.into();
        let data_dir = mirror_root.join(DATA_DIR);
        Layout {
            mirror_root,
            data_dir,
            separator,
        }
    }

    /// Root of the mirror
    pub fn mirror_root(&self) -> &Path {
        &self.mirror_root
    }

    /// Private data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Root of the increments tree
    pub fn increments_root(&self) -> PathBuf {
        self.data_dir.join(INCREMENTS_DIR)
    }

    /// Timestamp separator in use
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Repository metadata file
    pub fn repository_file(&self) -> PathBuf {
        self.data_dir.join(REPOSITORY_FILE)
    }

    /// Mirror location of `index`
    pub fn mirror_path(&self, index: &Index) -> PathBuf {
        index.under(&self.mirror_root)
    }

    fn data_file(&self, prefix: &str, time: SessionTime, suffix: &str, gzipped: bool) -> PathBuf {
        let name = TimedName::new(prefix.as_bytes().to_vec(), time, suffix, gzipped).render(self.separator);
        self.data_dir.join(OsStr::from_bytes(&name))
    }

    /// Completion marker of `time`
    pub fn marker_path(&self, time: SessionTime) -> PathBuf {
        self.data_file(MARKER_PREFIX, time, DATA_SUFFIX, false)
    }

    /// Metadata snapshot of `time`
    pub fn snapshot_path(&self, time: SessionTime, form: SnapshotForm, gzipped: bool) -> PathBuf {
        self.data_file(METADATA_PREFIX, time, form.suffix(), gzipped)
    }

    /// Session statistics of `time`
    pub fn stats_path(&self, time: SessionTime) -> PathBuf {
        self.data_file(STATS_PREFIX, time, DATA_SUFFIX, false)
    }

    /// Error log of `time`
    pub fn error_log_path(&self, time: SessionTime) -> PathBuf {
        self.data_file(ERROR_LOG_PREFIX, time, DATA_SUFFIX, false)
    }

    /// Directory holding the increments of `index` and their base name
    ///
    /// The root index uses the increments tree path itself as its base.
    pub fn increment_base(&self, index: &Index) -> (PathBuf, Vec<u8>) {
        match (index.parent(), index.name()) {
            (Some(parent), Some(name)) => (parent.under(&self.increments_root()), name.to_vec()),
            _ => (self.data_dir.clone(), INCREMENTS_DIR.as_bytes().to_vec()),
        }
    }

    /// Increment path of `index` at `time`
    pub fn increment_path(&self, index: &Index, time: SessionTime, kind: IncrementKind, gzipped: bool) -> PathBuf {
        let (dir, base) = self.increment_base(index);
        let name = TimedName::new(base, time, kind.suffix(), gzipped).render(self.separator);
        dir.join(OsStr::from_bytes(&name))
    }

    /// Parsed names of the files directly inside the data directory
    fn data_entries(&self) -> Result<Vec<(TimedName, PathBuf)>> {
        let mut entries = Vec::new();
        let read_dir = match fs::read_dir(&self.data_dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(parsed) = TimedName::parse(name.as_bytes(), self.separator) {
                entries.push((parsed, entry.path()));
            }
        }
        Ok(entries)
    }

    /// Times of all completion markers, oldest first
    pub fn markers(&self) -> Result<Vec<SessionTime>> {
        let mut times: Vec<SessionTime> = self
            .data_entries()?
            .into_iter()
            .filter(|(name, _)| name.base == MARKER_PREFIX.as_bytes() && name.suffix == DATA_SUFFIX)
            .map(|(name, _)| name.time)
            .collect();
        times.sort();
        Ok(times)
    }

    /// All metadata snapshot files, oldest first
    ///
    /// When a session left both a full and a diff file for the same time,
    /// the full one sorts first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotFile>> {
        let mut files: Vec<SnapshotFile> = self
            .data_entries()?
            .into_iter()
            .filter(|(name, _)| name.base == METADATA_PREFIX.as_bytes())
            .filter_map(|(name, path)| {
                let form = match name.suffix.as_str() {
                    "snapshot" => SnapshotForm::Full,
                    "diff" => SnapshotForm::Diff,
                    _ => return None,
                };
                Some(SnapshotFile {
                    time: name.time,
                    form,
                    gzipped: name.gzipped,
                    path,
                })
            })
            .collect();
        files.sort_by_key(|f| (f.time, f.form == SnapshotForm::Diff));
        Ok(files)
    }

    /// Snapshot files of one session time
    pub fn snapshots_at(&self, time: SessionTime) -> Result<Vec<SnapshotFile>> {
        Ok(self.snapshots()?.into_iter().filter(|f| f.time == time).collect())
    }

    /// Statistics and error log files of `time`, if present
    pub fn session_side_files(&self, time: SessionTime) -> Vec<PathBuf> {
        [self.stats_path(time), self.error_log_path(time)]
            .into_iter()
            .filter(|p| p.exists())
            .collect()
    }

    /// Increments stored for `index`, oldest first
    pub fn increments_for(&self, index: &Index) -> Result<Vec<IncrementFile>> {
        let (dir, base) = self.increment_base(index);
        let mut found = Vec::new();
        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            if let Some(inc) = self.parse_increment(&entry.path(), index.parent().as_ref(), &base) {
                found.push(inc);
            }
        }
        found.sort_by_key(|inc| inc.time);
        Ok(found)
    }

    /// Increment of `index` written at exactly `time`
    pub fn increment_at(&self, index: &Index, time: SessionTime) -> Result<Option<IncrementFile>> {
        Ok(self.increments_for(index)?.into_iter().find(|inc| inc.time == time))
    }

    fn parse_increment(&self, path: &Path, parent: Option<&Index>, want_base: &[u8]) -> Option<IncrementFile> {
        let metadata = fs::symlink_metadata(path).ok()?;
        if metadata.is_dir() {
            return None;
        }
        let name = TimedName::parse(path.file_name()?.as_bytes(), self.separator)?;
        if name.base != want_base {
            return None;
        }
        let kind = name.increment_kind()?;
        let index = match parent {
            Some(parent) => parent.join(name.base.clone()),
            None => Index::root(),
        };
        Some(IncrementFile {
            index,
            time: name.time,
            kind,
            gzipped: name.gzipped,
            path: path.to_path_buf(),
        })
    }

    /// Every increment in the destination, in no particular order
    pub fn all_increments(&self) -> Result<Vec<IncrementFile>> {
        let mut found = Vec::new();
        for (name, path) in self.data_entries()? {
            if name.base == INCREMENTS_DIR.as_bytes() {
                if let Some(kind) = name.increment_kind() {
                    found.push(IncrementFile {
                        index: Index::root(),
                        time: name.time,
                        kind,
                        gzipped: name.gzipped,
                        path,
                    });
                }
            }
        }

        let root = self.increments_root();
        if !root.exists() {
            return Ok(found);
        }
        for entry in WalkDir::new(&root).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = TimedName::parse(entry.file_name().as_bytes(), self.separator) else {
                trace!("Ignoring stray file in increments: {:?}", entry.path());
                continue;
            };
            let Some(kind) = name.increment_kind() else {
                continue;
            };
            let parent_rel = entry
                .path()
                .parent()
                .and_then(|p| p.strip_prefix(&root).ok())
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let parent = Index::from_relative_path(&parent_rel)?;
            found.push(IncrementFile {
                index: parent.join(name.base),
                time: name.time,
                kind,
                gzipped: name.gzipped,
                path: entry.path().to_path_buf(),
            });
        }
        Ok(found)
    }
}

/// Caches one directory listing of the increments tree at a time
///
/// Tree walks visit siblings consecutively, so holding the most recent
/// directory is enough to avoid listing it once per entry.
#[derive(Debug, Default)]
pub struct IncrementLookup {
    cached_parent: Option<Index>,
    cached: Vec<IncrementFile>,
}

impl IncrementLookup {
    /// Create an empty lookup
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments for `index`, oldest first
    pub fn get(&mut self, layout: &Layout, index: &Index) -> Result<Vec<IncrementFile>> {
        let Some(parent) = index.parent() else {
            return layout.increments_for(index);
        };
        if self.cached_parent.as_ref() != Some(&parent) {
            self.cached = self.list_parent(layout, &parent)?;
            self.cached_parent = Some(parent);
        }
        Ok(self.cached.iter().filter(|inc| &inc.index == index).cloned().collect())
    }

    fn list_parent(&self, layout: &Layout, parent: &Index) -> Result<Vec<IncrementFile>> {
        let dir = parent.under(&layout.increments_root());
        let mut found = Vec::new();
        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = TimedName::parse(entry.file_name().as_bytes(), layout.separator) else {
                continue;
            };
            if let Some(inc) = layout.parse_increment(&path, Some(parent), &name.base) {
                found.push(inc);
            }
        }
        found.sort_by_key(|inc| inc.time);
        Ok(found)
    }
}
