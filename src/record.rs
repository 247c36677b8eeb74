//! Metadata records
//!
//! A [`Record`] is the attribute-only description of one filesystem entry at
//! one [`Index`]. Kind-specific fields live in [`RecordKind`] so a record can
//! never carry, say, a size for a symlink. An entry missing from a tree is a
//! record of kind [`RecordKind::Absent`], which keeps comparisons total over
//! the index space.

use crate::error::{BackstepError, Result};
use crate::index::{Index, Indexed};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// Character or block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Character device
    Char,
    /// Block device
    Block,
}

/// Hardlink correlation of a regular file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardlinkInfo {
    /// Inode number on the side the record was taken from
    pub inode: u64,
    /// Device id holding the inode
    pub device: u64,
    /// Number of links to the inode
    pub nlink: u64,
}

impl HardlinkInfo {
    /// Key identifying the inode
    pub fn key(&self) -> (u64, u64) {
        (self.inode, self.device)
    }
}

/// Kind of entry plus the fields only that kind carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// No entry at this index
    Absent,
    /// Regular file
    Regular {
        /// Size in bytes
        size: u64,
        /// Modification time, seconds since the epoch
        mtime: i64,
        /// Optional SHA-256 of the content, hex encoded
        sha256: Option<String>,
        /// Hardlink correlation, present for every regular file read from disk
        link: Option<HardlinkInfo>,
    },
    /// Directory
    Directory {
        /// Modification time, seconds since the epoch
        mtime: i64,
    },
    /// Symbolic link
    Symlink {
        /// Raw link target
        target: Vec<u8>,
    },
    /// Device node
    Device {
        /// Character or block
        kind: DeviceKind,
        /// Major number
        major: u64,
        /// Minor number
        minor: u64,
    },
    /// Unix domain socket
    Socket {
        /// Modification time, seconds since the epoch
        mtime: i64,
    },
    /// Named pipe
    Fifo {
        /// Modification time, seconds since the epoch
        mtime: i64,
    },
}

impl RecordKind {
    /// Name used in the metadata text format
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordKind::Absent => "None",
            RecordKind::Regular { .. } => "reg",
            RecordKind::Directory { .. } => "dir",
            RecordKind::Symlink { .. } => "sym",
            RecordKind::Device { .. } => "dev",
            RecordKind::Socket { .. } => "sock",
            RecordKind::Fifo { .. } => "fifo",
        }
    }

    fn same_kind(&self, other: &RecordKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Ownership and permission bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Permission bits including setuid/setgid/sticky (no file type bits)
    pub perms: u32,
}

/// Which fields [`Record::equals`] looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareMode {
    /// Compare hardlink correlation fields
    pub hardlinks: bool,
    /// Compare content digests when both sides have one
    pub hashes: bool,
    /// Compare uid/gid
    pub ownership: bool,
}

impl CompareMode {
    /// Every kind-relevant field
    pub const FULL: CompareMode = CompareMode {
        hardlinks: true,
        hashes: true,
        ownership: true,
    };

    /// Used when matching a live source against the previous snapshot.
    /// Hardlinks are judged by the tracker instead.
    pub const SESSION: CompareMode = CompareMode {
        hardlinks: false,
        hashes: false,
        ownership: true,
    };

    /// Same as `self` but without hardlink fields
    pub fn without_hardlinks(mut self) -> Self {
        self.hardlinks = false;
        self
    }

    /// Same as `self` but without content digests
    pub fn without_hashes(mut self) -> Self {
        self.hashes = false;
        self
    }

    /// Same as `self` but without ownership
    pub fn without_ownership(mut self) -> Self {
        self.ownership = false;
        self
    }
}

impl Default for CompareMode {
    fn default() -> Self {
        CompareMode::FULL
    }
}

/// Attributes of one entry at one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position in the tree
    pub index: Index,
    /// Kind and kind-specific fields
    pub kind: RecordKind,
    /// Ownership and permissions (zeroed for absent records)
    pub attrs: Attributes,
}

impl Indexed for Record {
    fn index(&self) -> &Index {
        &self.index
    }
}

impl Record {
    /// Absent record at `index`
    pub fn absent(index: Index) -> Self {
        Record {
            index,
            kind: RecordKind::Absent,
            attrs: Attributes::default(),
        }
    }

    /// Stat `index` below `root` without following symlinks
    ///
    /// A missing entry yields an absent record rather than an error.
    pub fn from_live_entry(root: &Path, index: &Index) -> Result<Self> {
        let path = index.under(root);
        match fs::symlink_metadata(&path) {
            Ok(metadata) => Self::from_metadata(index.clone(), &path, &metadata),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Record::absent(index.clone())),
            Err(err) => Err(BackstepError::from_io(err, path)),
        }
    }

    /// Build a record from metadata already obtained for `path`
    pub fn from_metadata(index: Index, path: &Path, metadata: &fs::Metadata) -> Result<Self> {
        let file_type = metadata.file_type();
        let mtime = metadata.mtime();
        let kind = if file_type.is_file() {
            let size = metadata.size();
            if size > i64::MAX as u64 {
                return Err(BackstepError::Overflow {
                    field: "Size",
                    path: path.to_path_buf(),
                });
            }
            RecordKind::Regular {
                size,
                mtime,
                sha256: None,
                link: Some(HardlinkInfo {
                    inode: metadata.ino(),
                    device: metadata.dev(),
                    nlink: metadata.nlink(),
                }),
            }
        } else if file_type.is_dir() {
            RecordKind::Directory { mtime }
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| BackstepError::from_io(e, path))?;
            RecordKind::Symlink {
                target: target.as_os_str().as_bytes().to_vec(),
            }
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let rdev = metadata.rdev();
            RecordKind::Device {
                kind: if file_type.is_char_device() {
                    DeviceKind::Char
                } else {
                    DeviceKind::Block
                },
                major: nix::sys::stat::major(rdev) as u64,
                minor: nix::sys::stat::minor(rdev) as u64,
            }
        } else if file_type.is_socket() {
            RecordKind::Socket { mtime }
        } else if file_type.is_fifo() {
            RecordKind::Fifo { mtime }
        } else {
            return Err(BackstepError::internal(format!("unknown file type at {:?}", path)));
        };

        Ok(Record {
            index,
            kind,
            attrs: Attributes {
                uid: metadata.uid(),
                gid: metadata.gid(),
                perms: metadata.mode() & 0o7777,
            },
        })
    }

    /// Whether the entry does not exist
    pub fn is_absent(&self) -> bool {
        matches!(self.kind, RecordKind::Absent)
    }

    /// Whether the entry is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, RecordKind::Directory { .. })
    }

    /// Whether the entry is a regular file
    pub fn is_regular(&self) -> bool {
        matches!(self.kind, RecordKind::Regular { .. })
    }

    /// Whether the entry is a symbolic link
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, RecordKind::Symlink { .. })
    }

    /// Modification time, if the kind carries one
    pub fn mtime(&self) -> Option<i64> {
        match self.kind {
            RecordKind::Regular { mtime, .. }
            | RecordKind::Directory { mtime }
            | RecordKind::Socket { mtime }
            | RecordKind::Fifo { mtime } => Some(mtime),
            _ => None,
        }
    }

    /// Size of a regular file
    pub fn size(&self) -> Option<u64> {
        match self.kind {
            RecordKind::Regular { size, .. } => Some(size),
            _ => None,
        }
    }

    /// Recorded content digest
    pub fn sha256(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Regular { sha256, .. } => sha256.as_deref(),
            _ => None,
        }
    }

    /// Set the content digest of a regular file (no-op for other kinds)
    pub fn set_sha256(&mut self, digest: Option<String>) {
        if let RecordKind::Regular { sha256, .. } = &mut self.kind {
            *sha256 = digest;
        }
    }

    /// Hardlink fields of a regular file
    pub fn hardlink(&self) -> Option<&HardlinkInfo> {
        match &self.kind {
            RecordKind::Regular { link, .. } => link.as_ref(),
            _ => None,
        }
    }

    /// Whether this is a regular file with more than one link
    pub fn is_hardlinked(&self) -> bool {
        self.hardlink().map(|l| l.nlink > 1).unwrap_or(false)
    }

    /// Compare two records under `mode`
    ///
    /// Kinds must match; then every field relevant to that kind is compared.
    /// Symlink permission bits are not meaningful and are ignored.
    pub fn equals(&self, other: &Record, mode: CompareMode) -> bool {
        if !self.kind.same_kind(&other.kind) {
            return false;
        }
        if self.is_absent() {
            return true;
        }
        if mode.ownership && (self.attrs.uid != other.attrs.uid || self.attrs.gid != other.attrs.gid) {
            return false;
        }
        if !self.is_symlink() && self.attrs.perms != other.attrs.perms {
            return false;
        }

        match (&self.kind, &other.kind) {
            (
                RecordKind::Regular { size, mtime, sha256, link },
                RecordKind::Regular {
                    size: o_size,
                    mtime: o_mtime,
                    sha256: o_sha256,
                    link: o_link,
                },
            ) => {
                if size != o_size || mtime != o_mtime {
                    return false;
                }
                if mode.hashes {
                    if let (Some(a), Some(b)) = (sha256, o_sha256) {
                        if a != b {
                            return false;
                        }
                    }
                }
                if mode.hardlinks && link != o_link {
                    return false;
                }
                true
            }
            (RecordKind::Directory { mtime }, RecordKind::Directory { mtime: o_mtime })
            | (RecordKind::Socket { mtime }, RecordKind::Socket { mtime: o_mtime })
            | (RecordKind::Fifo { mtime }, RecordKind::Fifo { mtime: o_mtime }) => mtime == o_mtime,
            (RecordKind::Symlink { target }, RecordKind::Symlink { target: o_target }) => target == o_target,
            (
                RecordKind::Device { kind, major, minor },
                RecordKind::Device {
                    kind: o_kind,
                    major: o_major,
                    minor: o_minor,
                },
            ) => kind == o_kind && major == o_major && minor == o_minor,
            _ => false,
        }
    }
}

/// Free-function form of [`Record::is_absent`] for `Option<Record>` slots
pub fn is_absent(record: Option<&Record>) -> bool {
    record.map(Record::is_absent).unwrap_or(true)
}
