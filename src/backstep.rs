//! Repository handle
//!
//! [`Backstep`] ties one destination to its persisted configuration and
//! offers every operation on it: backup sessions, regress, listing, reading
//! and restoring past states, and verification.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use backstep::BackstepBuilder;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backstep = BackstepBuilder::new()
//!     .full_snapshot_interval(5)
//!     .compare_hashes(true)
//!     .build("/backups/home")?;
//!
//! let report = backstep.backup(Path::new("/home/me"))?;
//! println!("{} changes", report.stats.total_changes());
//!
//! for time in backstep.list_sessions()? {
//!     println!("{}", time);
//! }
//! # Ok(())
//! # }
//! ```

use crate::backup::BackupSession;
use crate::error::{BackstepError, Result};
use crate::index::Index;
use crate::layout::Layout;
use crate::metadata::SnapshotRecords;
use crate::regress;
use crate::restore::Restorer;
use crate::timestamp::SessionTime;
use crate::types::{
    BackstepConfig, ProgressCallback, RegressReport, RegressState, RepositoryMetadata, RestoreResult, SessionHook,
    SessionReport, FORMAT_VERSION,
};
use crate::utils;
use crate::verification::{VerificationReport, Verifier};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Open the repository at `dest`, creating it with `config` if it does not exist yet
///
/// An existing repository keeps its persisted configuration; `config` is
/// only used for new ones.
#[instrument(skip(config))]
pub fn load_or_init(dest: &Path, config: &BackstepConfig) -> Result<RepositoryMetadata> {
    let layout = Layout::new(dest, config.timestamp_separator);
    if layout.repository_file().exists() {
        let repository = load_repository(dest)?;
        if &repository.config != config {
            debug!("Using the configuration persisted in {:?}", layout.repository_file());
        }
        return Ok(repository);
    }

    config.validate()?;
    fs::create_dir_all(layout.increments_root()).map_err(|e| BackstepError::from_io(e, layout.data_dir()))?;
    let repository = RepositoryMetadata::new(config.clone());
    utils::atomic_write(&layout.repository_file(), &serde_json::to_vec_pretty(&repository)?)?;
    info!("Initialized repository at {:?}", dest);
    Ok(repository)
}

/// Read the repository metadata of `dest`
pub fn load_repository(dest: &Path) -> Result<RepositoryMetadata> {
    // The separator does not affect where the metadata file lives
    let path = Layout::new(dest, crate::timestamp::DEFAULT_SEPARATOR).repository_file();
    let text = match fs::read(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackstepError::NotInitialized(dest.to_path_buf()));
        }
        Err(err) => return Err(BackstepError::from_io(err, &path)),
    };
    let repository: RepositoryMetadata = serde_json::from_slice(&text)?;
    if repository.format_version > FORMAT_VERSION {
        return Err(BackstepError::InvalidConfiguration(format!(
            "repository format {} is newer than supported format {}",
            repository.format_version, FORMAT_VERSION
        )));
    }
    repository.config.validate()?;
    Ok(repository)
}

/// Handle on one destination
pub struct Backstep {
    layout: Layout,
    repository: RepositoryMetadata,
    hooks: Vec<Box<dyn SessionHook>>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Backstep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backstep")
            .field("layout", &self.layout)
            .field("repository", &self.repository)
            .field("hooks", &format!("<{} hooks>", self.hooks.len()))
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Backstep {
    /// Open the repository at `dest`, creating it with default settings if needed
    pub fn init(dest: impl Into<PathBuf>) -> Result<Self> {
        BackstepBuilder::new().build(dest)
    }

    /// Open an existing repository
    ///
    /// Fails with [`BackstepError::NotInitialized`] when `dest` holds none.
    pub fn open(dest: impl Into<PathBuf>) -> Result<Self> {
        let dest = dest.into();
        let repository = load_repository(&dest)?;
        Ok(Self::from_repository(dest, repository))
    }

    fn from_repository(dest: PathBuf, repository: RepositoryMetadata) -> Self {
        Backstep {
            layout: Layout::new(dest, repository.config.timestamp_separator),
            repository,
            hooks: Vec::new(),
            progress: None,
        }
    }

    /// Destination root
    pub fn dest(&self) -> &Path {
        self.layout.mirror_root()
    }

    /// Repository layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Persisted configuration
    pub fn config(&self) -> &BackstepConfig {
        &self.repository.config
    }

    /// Persisted repository metadata
    pub fn repository(&self) -> &RepositoryMetadata {
        &self.repository
    }

    /// Add a hook called by every later backup session
    pub fn add_hook(&mut self, hook: Box<dyn SessionHook>) {
        self.hooks.push(hook);
    }

    /// Set the progress callback for backups and restores
    pub fn set_progress(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    /// Mirror `source` into the destination as a new session
    ///
    /// An interrupted earlier session is rolled back first.
    pub fn backup(&self, source: &Path) -> Result<SessionReport> {
        let mut session = BackupSession::new(source, self.layout.clone(), self.repository.config.clone())
            .with_hooks(&self.hooks);
        if let Some(callback) = &self.progress {
            session = session.with_progress(callback.clone());
        }
        session.run()
    }

    /// Whether the destination holds an interrupted session
    pub fn regress_state(&self) -> Result<RegressState> {
        regress::detect(&self.layout)
    }

    /// Roll back an interrupted session, if any
    pub fn regress(&self) -> Result<RegressReport> {
        regress::regress_destination(&self.layout, &self.repository.config)
    }

    fn restorer(&self) -> Result<Restorer> {
        Restorer::new(self.layout.clone(), &self.repository.config)
    }

    /// Committed session times, oldest first
    pub fn list_sessions(&self) -> Result<Vec<SessionTime>> {
        self.restorer()?.sessions()
    }

    /// Statistics written by the session at `time`
    pub fn session_report(&self, time: SessionTime) -> Result<SessionReport> {
        let path = self.layout.stats_path(time);
        let text = fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => BackstepError::SessionNotFound(format!("no statistics for {}", time)),
            _ => BackstepError::from_io(err, &path),
        })?;
        Ok(serde_json::from_slice(&text)?)
    }

    /// Newest committed session at or before `requested`
    pub fn resolve_time(&self, requested: SessionTime) -> Result<SessionTime> {
        self.restorer()?.resolve_time(requested)
    }

    /// Records of the newest session at or before `time`
    pub fn read_tree_at(&self, time: SessionTime) -> Result<SnapshotRecords> {
        let restorer = self.restorer()?;
        let resolved = restorer.resolve_time(time)?;
        restorer.read_tree_at(resolved)
    }

    /// Rebuild the whole tree as of `time` into `target`
    pub fn restore(&self, time: SessionTime, target: &Path) -> Result<RestoreResult> {
        self.restore_path(time, &Index::root(), target)
    }

    /// Rebuild the subtree at `prefix` as of `time` into `target`
    pub fn restore_path(&self, time: SessionTime, prefix: &Index, target: &Path) -> Result<RestoreResult> {
        let restorer = self.restorer()?;
        let resolved = restorer.resolve_time(time)?;
        if resolved != time {
            debug!("Restoring {} for requested time {}", resolved, time);
        }
        restorer.restore(resolved, prefix, target, self.progress.clone())
    }

    /// Check content digests of the newest session at or before `time`
    pub fn verify(&self, time: SessionTime) -> Result<VerificationReport> {
        let restorer = self.restorer()?;
        let resolved = restorer.resolve_time(time)?;
        let report = Verifier::new(&restorer).verify(resolved)?;
        if !report.is_valid() {
            warn!("{} files failed verification", report.failures.len());
        }
        Ok(report)
    }
}

/// Builder for [`Backstep`]
///
/// Settings only apply when the repository is created; an existing
/// repository keeps the configuration it was created with.
///
/// # Examples
///
/// ```rust
/// use backstep::BackstepBuilder;
///
/// let builder = BackstepBuilder::new()
///     .compress_increments(false)
///     .max_collision_retries(10);
/// ```
#[derive(Default)]
pub struct BackstepBuilder {
    config: BackstepConfig,
    hooks: Vec<Box<dyn SessionHook>>,
    progress: Option<ProgressCallback>,
}

impl BackstepBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration
    pub fn config(mut self, config: BackstepConfig) -> Self {
        self.config = config;
        self
    }

    /// Separator used inside rendered timestamps
    ///
    /// `:` is the default. Some filesystems reject it in file names; `-` is
    /// not allowed because it is part of the date.
    pub fn timestamp_separator(mut self, separator: char) -> Self {
        self.config.timestamp_separator = separator;
        self
    }

    /// Gzip diff and snapshot increments
    pub fn compress_increments(mut self, enabled: bool) -> Self {
        self.config.compress_increments = enabled;
        self
    }

    /// File name globs whose increments are stored uncompressed
    pub fn no_compression_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.no_compression_patterns = patterns;
        self
    }

    /// Gzip metadata snapshots
    pub fn compress_metadata(mut self, enabled: bool) -> Self {
        self.config.compress_metadata = enabled;
        self
    }

    /// Store every Nth metadata snapshot in full, the others as forward diffs
    pub fn full_snapshot_interval(mut self, interval: u32) -> Self {
        self.config.full_snapshot_interval = interval;
        self
    }

    /// Timestamps tried before an increment name collision is an error
    pub fn max_collision_retries(mut self, retries: u32) -> Self {
        self.config.max_collision_retries = retries;
        self
    }

    /// Also compare file content digests when deciding what changed
    pub fn compare_hashes(mut self, enabled: bool) -> Self {
        self.config.compare_hashes = enabled;
        self
    }

    /// Add a session hook
    pub fn hook(mut self, hook: Box<dyn SessionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Set the progress callback
    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Open the repository at `dest`, creating it if needed
    pub fn build(self, dest: impl Into<PathBuf>) -> Result<Backstep> {
        let dest = dest.into();
        let repository = load_or_init(&dest, &self.config)?;
        let mut backstep = Backstep::from_repository(dest, repository);
        backstep.hooks = self.hooks;
        backstep.progress = self.progress;
        Ok(backstep)
    }
}
