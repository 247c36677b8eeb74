//! Core data types shared across the backstep library
//!
//! ## Overview
//!
//! - **Reports**: `SessionReport`, `RegressReport`, `RestoreResult`, `FileError`
//! - **Configuration**: `BackstepConfig`, persisted in `RepositoryMetadata`
//! - **Progress**: `ProgressInfo` and `ProgressCallback`
//! - **Hooks**: `SessionHook`, extensibility points around a backup session
//!
//! ## Examples
//!
//! ```rust
//! use backstep::types::BackstepConfig;
//!
//! let config = BackstepConfig {
//!     timestamp_separator: '_',
//!     full_snapshot_interval: 5,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::compression::{CompressionStrategy, DEFAULT_LEVEL, DEFAULT_NO_COMPRESSION_PATTERNS};
use crate::error::{BackstepError, Result};
use crate::index::Index;
use crate::timestamp::{validate_separator, SessionTime, DEFAULT_SEPARATOR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Version of the on-disk repository format
pub const FORMAT_VERSION: u32 = 1;

/// A problem confined to one entry
///
/// Sessions and regress collect these instead of stopping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Index of the entry, `.` for the root
    pub index: String,
    /// Filesystem path the operation touched
    pub path: PathBuf,
    /// What went wrong
    pub message: String,
}

impl FileError {
    /// Describe `err` for the entry at `index`
    pub fn new(index: &Index, path: impl Into<PathBuf>, err: &BackstepError) -> Self {
        FileError {
            index: index.to_string(),
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.message)
    }
}

/// Counters for one backup session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Entries found in the source
    pub source_entries: usize,
    /// Bytes of regular files in the source
    pub source_bytes: u64,
    /// Entries that did not exist in the mirror before
    pub new_entries: usize,
    /// Entries whose attributes or content changed
    pub changed_entries: usize,
    /// Entries removed from the mirror
    pub deleted_entries: usize,
    /// Entries left untouched
    pub unchanged_entries: usize,
    /// Increment files written
    pub increment_files: usize,
    /// Bytes of increment files written
    pub increment_bytes: u64,
    /// Increments stored gzip compressed
    pub compressed_increments: usize,
    /// Bytes copied into the mirror
    pub mirror_bytes_written: u64,
    /// Later hardlinks created as links instead of copies
    pub hardlinks_linked: usize,
}

impl SessionStats {
    /// Whether the session changed the mirror at all
    pub fn has_changes(&self) -> bool {
        self.new_entries > 0 || self.changed_entries > 0 || self.deleted_entries > 0
    }

    /// Entries that needed an increment
    pub fn total_changes(&self) -> usize {
        self.new_entries + self.changed_entries + self.deleted_entries
    }
}

/// Information about the host a session ran on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Username (if available)
    pub username: Option<String>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            username: std::env::var("USER").ok(),
        }
    }
}

/// Result of one backup session
///
/// Written as JSON to `session_statistics.<time>.data` before the session's
/// completion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session time
    pub time: SessionTime,
    /// Session this one builds on, if any
    pub previous: Option<SessionTime>,
    /// Counters
    pub stats: SessionStats,
    /// Entries skipped because of file-level errors
    pub errors: Vec<FileError>,
    /// Rollback performed before the session started
    pub regress: Option<RegressReport>,
    /// Host the session ran on
    pub host: HostInfo,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl SessionReport {
    /// A session that committed but skipped some entries
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Consistency state of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegressState {
    /// Every snapshot has a completion marker
    Clean {
        /// Newest committed session, `None` for an empty destination
        current: Option<SessionTime>,
    },
    /// A session started and never committed
    Required {
        /// Last committed session, `None` when there is no prior history
        regress_time: Option<SessionTime>,
        /// Session to roll back
        aborted_time: SessionTime,
    },
}

impl RegressState {
    /// Whether a rollback is needed
    pub fn needs_regress(&self) -> bool {
        matches!(self, RegressState::Required { .. })
    }
}

/// Result of a regress run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegressReport {
    /// Session the destination was rolled back to
    pub regress_time: Option<SessionTime>,
    /// Session that was rolled back, `None` when the destination was already clean
    pub aborted_time: Option<SessionTime>,
    /// Mirror entries deleted
    pub entries_deleted: usize,
    /// Files patched back with a reverse delta
    pub entries_patched: usize,
    /// Entries replaced wholesale from a snapshot increment
    pub entries_replaced: usize,
    /// Directories recreated
    pub directories_created: usize,
    /// Entries whose attributes were reset
    pub attributes_reset: usize,
    /// Increment files removed
    pub increments_removed: usize,
    /// Entries that could not be reconciled
    pub errors: Vec<FileError>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl RegressReport {
    /// Whether anything was rolled back
    pub fn rolled_back(&self) -> bool {
        self.aborted_time.is_some()
    }
}

/// Result of a restore operation
///
/// Contains statistics and information about a completed restore operation,
/// including any warnings that occurred during the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Session time that was restored
    pub time: SessionTime,
    /// Regular files written
    pub files_restored: usize,
    /// Directories created
    pub directories_restored: usize,
    /// Symlinks, fifos, sockets, and device nodes created
    pub special_restored: usize,
    /// Files created as hardlinks of an earlier restored file
    pub links_restored: usize,
    /// Total bytes written
    pub bytes_written: u64,
    /// Time taken for restoration in milliseconds
    pub duration_ms: u64,
    /// Any warnings during restoration
    pub warnings: Vec<String>,
}

/// Configuration of a repository
///
/// Persisted in `backstep.json`; the timestamp separator shapes every file
/// name in the repository and cannot change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackstepConfig {
    /// Separator inside rendered timestamps
    pub timestamp_separator: char,
    /// Gzip diff and snapshot increments
    pub compress_increments: bool,
    /// File name globs that are never compressed
    pub no_compression_patterns: Vec<String>,
    /// Gzip metadata snapshots
    pub compress_metadata: bool,
    /// Every Nth metadata snapshot is stored in full
    pub full_snapshot_interval: u32,
    /// Timestamps tried before giving up on an increment name
    pub max_collision_retries: u32,
    /// Compare regular files by SHA-256 in addition to size and mtime
    pub compare_hashes: bool,
}

impl Default for BackstepConfig {
    fn default() -> Self {
        BackstepConfig {
            timestamp_separator: DEFAULT_SEPARATOR,
            compress_increments: true,
            no_compression_patterns: DEFAULT_NO_COMPRESSION_PATTERNS.iter().map(|s| s.to_string()).collect(),
            compress_metadata: true,
            full_snapshot_interval: 10,
            max_collision_retries: 1000,
            compare_hashes: false,
        }
    }
}

impl BackstepConfig {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        validate_separator(self.timestamp_separator)?;
        if self.max_collision_retries == 0 {
            return Err(BackstepError::InvalidConfiguration(
                "max_collision_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Compression strategy for increments
    pub fn compression_strategy(&self) -> CompressionStrategy {
        if self.compress_increments {
            CompressionStrategy::Adaptive {
                level: DEFAULT_LEVEL,
                skip_patterns: self.no_compression_patterns.clone(),
            }
        } else {
            CompressionStrategy::None
        }
    }
}

/// Contents of `backstep.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    /// Version of the repository format
    pub format_version: u32,
    /// backstep version that created the repository
    pub backstep_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Configuration
    pub config: BackstepConfig,
}

impl RepositoryMetadata {
    /// Metadata for a new repository
    pub fn new(config: BackstepConfig) -> Self {
        RepositoryMetadata {
            format_version: FORMAT_VERSION,
            backstep_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            config,
        }
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Bytes processed so far
    pub bytes_processed: u64,
}

/// What a session did with one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// Mirror already matched the source
    Unchanged,
    /// Entry is new in the mirror
    Created,
    /// Entry was rewritten
    Updated,
    /// Entry was removed from the mirror
    Deleted,
    /// A file-level error kept the previous state
    Failed,
}

/// Hook trait for backup sessions
///
/// Returning an error from any method aborts the session without writing a
/// completion marker. The destination is then left exactly as an
/// interrupted session would leave it, and the next session or an explicit
/// regress rolls it back.
///
/// # Examples
///
/// ```rust
/// use backstep::types::{EntryAction, SessionHook};
/// use backstep::{Index, Result};
///
/// struct AuditHook;
///
/// impl SessionHook for AuditHook {
///     fn post_entry(&self, index: &Index, action: EntryAction) -> Result<()> {
///         if action != EntryAction::Unchanged {
///             println!("{:?} {}", action, index);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait SessionHook: Send + Sync {
    /// Called once the session time is fixed, before anything is written
    fn pre_session(&self, _time: SessionTime) -> Result<()> {
        Ok(())
    }

    /// Called after each entry has been processed
    fn post_entry(&self, _index: &Index, _action: EntryAction) -> Result<()> {
        Ok(())
    }

    /// Called after the snapshot is closed and before the completion marker
    fn post_session(&self, _report: &SessionReport) -> Result<()> {
        Ok(())
    }
}

/// Default implementation of SessionHook that does nothing
#[derive(Debug)]
pub struct NoOpHook;

impl SessionHook for NoOpHook {}
