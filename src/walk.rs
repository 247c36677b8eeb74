//! Index-ordered walks of live trees
//!
//! Directory entries are visited depth first with siblings sorted by their
//! raw name bytes, which is exactly ascending [`Index`] order. Records are
//! produced lazily, one directory listing at a time.

use crate::error::{BackstepError, Result};
use crate::index::Index;
use crate::layout::DATA_DIR;
use crate::record::Record;
use crate::types::FileError;
use crate::utils::TEMP_PREFIX;
use std::cell::RefCell;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{trace, warn};
use walkdir::{DirEntry, WalkDir};

/// File-level errors collected while a walk is consumed elsewhere
pub type ErrorSink = Rc<RefCell<Vec<FileError>>>;

/// Which kind of tree is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// The live source; everything is reported
    Source,
    /// The mirror; the data directory and temporary files are skipped
    Mirror,
}

/// Lazy walker producing one [`Record`] per entry
///
/// Entries that disappear during the walk are skipped. Unreadable
/// directories are reported to the error sink along with their index, and
/// the walk continues after their subtree.
pub struct TreeWalker {
    root: PathBuf,
    inner: Box<dyn Iterator<Item = walkdir::Result<DirEntry>>>,
    errors: ErrorSink,
    unreadable: Rc<RefCell<Vec<Index>>>,
}

impl TreeWalker {
    /// Walk `root` in the given mode
    pub fn new(root: &Path, mode: WalkMode, errors: ErrorSink) -> Self {
        Self::with_exclude(root, mode, None, errors)
    }

    /// Walk `root`, additionally skipping the subtree at `exclude`
    pub fn with_exclude(root: &Path, mode: WalkMode, exclude: Option<PathBuf>, errors: ErrorSink) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if exclude.as_deref() == Some(entry.path()) {
                    return false;
                }
                match mode {
                    WalkMode::Source => true,
                    WalkMode::Mirror => !is_private(entry),
                }
            });
        TreeWalker {
            root: root.to_path_buf(),
            inner: Box::new(inner),
            errors,
            unreadable: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Indexes of directories whose contents could not be listed
    ///
    /// The handle stays valid while the walker itself is consumed by a
    /// collator.
    pub fn unreadable_dirs(&self) -> Rc<RefCell<Vec<Index>>> {
        self.unreadable.clone()
    }

    fn index_of(&self, path: &Path) -> Result<Index> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| BackstepError::internal(format!("{:?} is outside {:?}", path, self.root)))?;
        Index::from_relative_path(relative)
    }

    fn record_walk_error(&self, err: walkdir::Error) -> Result<()> {
        if err
            .io_error()
            .map(|io| io.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
        {
            trace!("Entry vanished during walk: {:?}", err.path());
            return Ok(());
        }
        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        if err.depth() == 0 {
            return Err(err.into());
        }
        let index = self.index_of(&path)?;
        warn!("Cannot read {:?}: {}", path, err);
        let as_backstep = match err.into_io_error() {
            Some(io) => BackstepError::from_io(io, &path),
            None => BackstepError::internal("walk error without an I/O cause"),
        };
        self.errors.borrow_mut().push(FileError::new(&index, &path, &as_backstep));
        self.unreadable.borrow_mut().push(index);
        Ok(())
    }
}

fn is_private(entry: &DirEntry) -> bool {
    let name = entry.file_name().as_bytes();
    (entry.depth() == 1 && name == DATA_DIR.as_bytes()) || (entry.depth() > 0 && name.starts_with(TEMP_PREFIX.as_bytes()))
}

impl Iterator for TreeWalker {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => match self.record_walk_error(err) {
                    Ok(()) => continue,
                    Err(fatal) => return Some(Err(fatal)),
                },
            };
            let index = match self.index_of(entry.path()) {
                Ok(index) => index,
                Err(err) => return Some(Err(err)),
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    if let Err(fatal) = self.record_walk_error(err) {
                        return Some(Err(fatal));
                    }
                    continue;
                }
            };
            return Some(Record::from_metadata(index, entry.path(), &metadata));
        }
    }
}

/// Whether `index` lies inside one of `dirs`
pub fn is_under_any(index: &Index, dirs: &[Index]) -> bool {
    dirs.iter().any(|dir| dir.is_ancestor_of(index))
}

/// Collect a whole tree; for tests and small trees
pub fn read_tree(root: &Path, mode: WalkMode) -> Result<Vec<Record>> {
    let errors = ErrorSink::default();
    let records = TreeWalker::new(root, mode, errors.clone()).collect::<Result<Vec<_>>>()?;
    if let Some(first) = errors.borrow().first() {
        return Err(BackstepError::PermissionDenied { path: first.path.clone() });
    }
    Ok(records)
}
