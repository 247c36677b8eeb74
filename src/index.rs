//! Tree positions
//!
//! An [`Index`] is the ordered tuple of path components naming an entry
//! relative to a tree root. The root itself is the empty tuple. Indexes order
//! lexicographically over their components, compared bytewise, which is the
//! same order a depth-first walk with name-sorted children produces.

use crate::error::{BackstepError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Ordered tuple of path components
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index(Vec<Vec<u8>>);

impl Index {
    /// The empty index naming the tree root
    pub fn root() -> Self {
        Index(Vec::new())
    }

    /// Build an index from raw components
    pub fn from_components<I, C>(components: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Index(components.into_iter().map(Into::into).collect())
    }

    /// Build an index from a path relative to a tree root
    ///
    /// `.` components are dropped. Absolute paths and `..` are rejected.
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => components.push(name.as_bytes().to_vec()),
                Component::CurDir => {}
                _ => {
                    return Err(BackstepError::internal(format!(
                        "path {:?} is not relative to a tree root",
                        path
                    )))
                }
            }
        }
        Ok(Index(components))
    }

    /// Components of this index
    pub fn components(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root index
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last component, `None` for the root
    pub fn name(&self) -> Option<&[u8]> {
        self.0.last().map(Vec::as_slice)
    }

    /// Index of the containing directory, `None` for the root
    pub fn parent(&self) -> Option<Index> {
        if self.0.is_empty() {
            None
        } else {
            Some(Index(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Child index with one more component
    pub fn join(&self, name: impl Into<Vec<u8>>) -> Index {
        let mut components = self.0.clone();
        components.push(name.into());
        Index(components)
    }

    /// Whether `prefix` is this index or one of its ancestors
    pub fn starts_with(&self, prefix: &Index) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Whether this index is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &Index) -> bool {
        other.0.len() > self.0.len() && other.starts_with(self)
    }

    /// Relative path for this index (empty for the root)
    pub fn to_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for component in &self.0 {
            path.push(OsStr::from_bytes(component));
        }
        path
    }

    /// Absolute location of this index below `root`
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(self.to_path())
    }

    /// Escaped single-line form used by the metadata store
    ///
    /// Components are joined with `/`; backslash and newline are escaped.
    /// The root is written as `.`.
    pub fn to_quoted(&self) -> Vec<u8> {
        if self.0.is_empty() {
            return b".".to_vec();
        }
        let joined = self.0.join(&b'/');
        escape_bytes(&joined)
    }

    /// Parse the form produced by [`Index::to_quoted`]
    pub fn from_quoted(quoted: &[u8]) -> Result<Self> {
        if quoted == b"." {
            return Ok(Index::root());
        }
        let raw = unescape_bytes(quoted).map_err(|msg| BackstepError::parse("index", 0, msg))?;
        let mut components = Vec::new();
        for component in raw.split(|&b| b == b'/') {
            if component.is_empty() || component == b"." || component == b".." {
                return Err(BackstepError::parse(
                    "index",
                    0,
                    format!("invalid component in {:?}", String::from_utf8_lossy(quoted)),
                ));
            }
            components.push(component.to_vec());
        }
        Ok(Index(components))
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", String::from_utf8_lossy(component))?;
        }
        Ok(())
    }
}

/// Anything positioned in a tree
pub trait Indexed {
    /// Position of this item
    fn index(&self) -> &Index;
}

impl Indexed for Index {
    fn index(&self) -> &Index {
        self
    }
}

/// Escape backslash and newline so the bytes fit on one line
pub(crate) fn escape_bytes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Reverse [`escape_bytes`]
pub(crate) fn unescape_bytes(escaped: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut iter = escaped.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(other) => return Err(format!("unknown escape \\{}", *other as char)),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}
