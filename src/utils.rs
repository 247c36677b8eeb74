//! Utility functions for backstep
//!
//! File operations shared by the session, regress, and restore drivers:
//!
//! - SHA-256 content hashing
//! - Atomic writes (temporary file in the target directory, then rename)
//! - Applying recorded attributes (ownership, permissions, mtime)
//! - Forced-access retry for permission errors
//! - Creating special files (symlinks, fifos, sockets, device nodes)

use crate::error::{BackstepError, Result};
use crate::record::{DeviceKind, Record, RecordKind};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{trace, warn};

/// Prefix of temporary files created next to their final location
///
/// Walkers of the mirror skip entries with this prefix, so a temporary file
/// left by a crash is never mistaken for mirror content.
pub const TEMP_PREFIX: &str = ".backstep-tmp";

/// Hash a file's content using SHA-256
pub fn hash_file_content(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| BackstepError::from_io(e, path))?;
    hash_reader(file)
}

/// Hash everything `reader` yields
pub fn hash_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Create a temporary file in the directory that will hold `path`
pub fn temp_file_beside(path: &Path) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| BackstepError::internal(format!("{:?} has no parent directory", path)))?;
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| BackstepError::from_io(e, dir))
}

/// Atomic file write (write to temp file then rename)
///
/// The target is either absent, its previous version, or the complete new
/// content. Never a partial file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let mut temp = temp_file_beside(path)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| BackstepError::from_io(e.error, path))?;
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Whether the process may change file ownership
pub fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Set Unix permissions
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| BackstepError::from_io(e, path))
}

/// Set the modification time of `path`, not following symlinks
pub fn set_mtime(path: &Path, mtime: i64) -> Result<()> {
    let ft = FileTime::from_unix_time(mtime, 0);
    filetime::set_symlink_file_times(path, ft, ft).map_err(|e| BackstepError::from_io(e, path))
}

/// Apply ownership, permissions, and mtime recorded in `record` onto `path`
///
/// Ownership is best effort: without privilege a failed chown is ignored.
/// Symlink permission bits are not applied.
pub fn apply_attributes(path: &Path, record: &Record) -> Result<()> {
    if record.is_absent() {
        return Ok(());
    }
    if let Err(err) = std::os::unix::fs::lchown(path, Some(record.attrs.uid), Some(record.attrs.gid)) {
        if is_privileged() {
            return Err(BackstepError::from_io(err, path));
        }
        trace!("Could not chown {:?}: {}", path, err);
    }
    if !record.is_symlink() {
        set_permissions(path, record.attrs.perms)?;
    }
    if let Some(mtime) = record.mtime() {
        set_mtime(path, mtime)?;
    }
    Ok(())
}

/// Run `op`, and if it fails with a permission error, retry once after
/// granting the owner access to `path`
///
/// The previous permission bits are put back after the retry.
pub fn with_forced_access<T>(path: &Path, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(BackstepError::PermissionDenied { .. }) => {}
        other => return other,
    }
    let metadata = fs::symlink_metadata(path).map_err(|e| BackstepError::from_io(e, path))?;
    if metadata.file_type().is_symlink() {
        return Err(BackstepError::PermissionDenied { path: path.to_path_buf() });
    }
    let original = metadata.permissions().mode() & 0o7777;
    let grant = if metadata.is_dir() { 0o700 } else { 0o600 };
    warn!("Permission denied on {:?}, retrying with mode {:o}", path, original | grant);
    set_permissions(path, original | grant)?;
    let result = op();
    if let Err(err) = set_permissions(path, original) {
        warn!("Could not restore permissions on {:?}: {}", path, err);
    }
    result
}

/// Remove whatever is at `path`; a missing entry is not an error
pub fn remove_entry(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(BackstepError::from_io(err, path)),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BackstepError::from_io(err, path)),
    }
}

/// Remove `path` if it is an empty directory
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Create a symlink, fifo, socket, or device node at `path` as described by `record`
///
/// Fails with `PermissionDenied` when a device node cannot be created
/// without privilege. Attributes are not applied.
pub fn create_special(path: &Path, record: &Record) -> Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let to_err = |errno: nix::errno::Errno| BackstepError::from_io(io::Error::from(errno), path);
    match &record.kind {
        RecordKind::Symlink { target } => {
            std::os::unix::fs::symlink(OsStr::from_bytes(target), path).map_err(|e| BackstepError::from_io(e, path))
        }
        RecordKind::Fifo { .. } => nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(to_err),
        RecordKind::Socket { .. } => {
            let listener =
                std::os::unix::net::UnixListener::bind(path).map_err(|e| BackstepError::from_io(e, path))?;
            drop(listener);
            Ok(())
        }
        RecordKind::Device { kind, major, minor } => {
            let flag = match kind {
                DeviceKind::Char => SFlag::S_IFCHR,
                DeviceKind::Block => SFlag::S_IFBLK,
            };
            mknod(path, flag, Mode::from_bits_truncate(0o600), makedev(*major, *minor)).map_err(|errno| {
                if errno == nix::errno::Errno::EPERM {
                    BackstepError::PermissionDenied { path: path.to_path_buf() }
                } else {
                    to_err(errno)
                }
            })
        }
        other => Err(BackstepError::internal(format!(
            "{} is not a special file kind",
            other.type_name()
        ))),
    }
}

/// Build `record` at `path` through a temporary name and rename it into place
///
/// Used for special files and symlinks so the final name only ever appears
/// complete with its attributes.
pub fn place_special(path: &Path, record: &Record) -> Result<()> {
    let temp = temp_file_beside(path)?;
    let temp_path = temp.into_temp_path();
    let staging = temp_path.to_path_buf();
    // Free the name for the special file
    temp_path.close()?;
    let built = create_special(&staging, record).and_then(|_| apply_attributes(&staging, record));
    if let Err(err) = built {
        remove_leftover(&staging);
        return Err(err);
    }
    replace_with(&staging, path)
}

/// Remove a staging name that should no longer exist
///
/// A missing file is the normal case. Any other failure leaves a temporary
/// name behind, which walkers skip, so it is logged rather than returned.
pub fn remove_leftover(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => trace!("Removed leftover {:?}", path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Could not remove leftover {:?}: {}", path, err),
    }
}

/// Rename `staging` over `path`, clearing a directory in the way first
pub fn replace_with(staging: &Path, path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.is_dir() {
            fs::remove_dir_all(path).map_err(|e| BackstepError::from_io(e, path))?;
        }
    }
    fs::rename(staging, path).map_err(|e| BackstepError::from_io(e, path))
}
