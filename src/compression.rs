//! Gzip compression for increments and metadata snapshots
//!
//! Increment content and metadata snapshots are stored gzip compressed unless
//! the strategy says otherwise. Compressed files carry a `.gz` suffix, so
//! readers decide from the filename alone and never sniff content.
//!
//! ## Strategies
//!
//! - **None**: never compress
//! - **Gzip**: compress everything at the given level
//! - **Adaptive**: compress unless the entry's file name matches one of the
//!   "already compressed" glob patterns (archives, images, media)
//! - **Custom**: caller decides per path
//!
//! ```rust
//! use backstep::compression::{CompressionEngine, CompressionStrategy};
//! use std::path::Path;
//!
//! let engine = CompressionEngine::new(CompressionStrategy::adaptive_default()).unwrap();
//! assert!(engine.should_compress(Path::new("notes.txt")));
//! assert!(!engine.should_compress(Path::new("photo.JPG")));
//! ```

use crate::error::{BackstepError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Default gzip level
pub const DEFAULT_LEVEL: u32 = 6;

/// File name patterns whose content is already compressed
pub const DEFAULT_NO_COMPRESSION_PATTERNS: &[&str] = &[
    "*.gz", "*.tgz", "*.bz2", "*.xz", "*.zst", "*.lz4", "*.zip", "*.7z", "*.rar", "*.jar", "*.deb",
    "*.rpm", "*.jpg", "*.jpeg", "*.png", "*.gif", "*.webp", "*.heic", "*.mp3", "*.ogg", "*.flac",
    "*.mp4", "*.mkv", "*.mov", "*.avi", "*.webm",
];

/// When increment content is compressed
#[derive(Clone)]
pub enum CompressionStrategy {
    /// Never compress
    None,
    /// Always compress at this level
    Gzip {
        /// Gzip level, 0 to 9
        level: u32,
    },
    /// Compress unless the file name matches a skip pattern
    Adaptive {
        /// Gzip level, 0 to 9
        level: u32,
        /// Glob patterns matched case-insensitively against the file name
        skip_patterns: Vec<String>,
    },
    /// Caller-defined decision on the entry path
    Custom(Arc<dyn Fn(&Path) -> bool + Send + Sync>),
}

impl CompressionStrategy {
    /// Adaptive strategy with the default skip patterns
    pub fn adaptive_default() -> Self {
        CompressionStrategy::Adaptive {
            level: DEFAULT_LEVEL,
            skip_patterns: DEFAULT_NO_COMPRESSION_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        Self::adaptive_default()
    }
}

impl std::fmt::Debug for CompressionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Gzip { level } => f.debug_struct("Gzip").field("level", level).finish(),
            Self::Adaptive { level, skip_patterns } => f
                .debug_struct("Adaptive")
                .field("level", level)
                .field("skip_patterns", skip_patterns)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(Fn)"),
        }
    }
}

/// Compression counters for one session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompressionStats {
    /// Files written compressed
    pub files_compressed: usize,
    /// Files written raw because the strategy said so
    pub files_stored_raw: usize,
}

/// Applies a [`CompressionStrategy`]
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    skip: GlobSet,
    level: u32,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Compile the strategy's patterns
    pub fn new(strategy: CompressionStrategy) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut level = DEFAULT_LEVEL;
        match &strategy {
            CompressionStrategy::Adaptive { level: l, skip_patterns } => {
                level = *l;
                for pattern in skip_patterns {
                    let glob = GlobBuilder::new(pattern)
                        .case_insensitive(true)
                        .literal_separator(true)
                        .build()
                        .map_err(|e| {
                            BackstepError::InvalidConfiguration(format!("bad pattern {:?}: {}", pattern, e))
                        })?;
                    builder.add(glob);
                }
            }
            CompressionStrategy::Gzip { level: l } => level = *l,
            _ => {}
        }
        if level > 9 {
            return Err(BackstepError::InvalidConfiguration(format!("gzip level {} out of range", level)));
        }
        let skip = builder
            .build()
            .map_err(|e| BackstepError::InvalidConfiguration(e.to_string()))?;
        Ok(CompressionEngine {
            strategy,
            skip,
            level,
            stats: CompressionStats::default(),
        })
    }

    /// Counters since creation or the last reset
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Reset counters
    pub fn reset_stats(&mut self) {
        self.stats = CompressionStats::default();
    }

    /// Whether content for the entry at `path` should be compressed
    pub fn should_compress(&self, path: &Path) -> bool {
        match &self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Gzip { .. } => true,
            CompressionStrategy::Adaptive { .. } => match path.file_name() {
                Some(name) => !self.skip.is_match(Path::new(name)),
                None => true,
            },
            CompressionStrategy::Custom(decide) => decide(path),
        }
    }

    /// Record one decision made through [`CompressionEngine::should_compress`]
    pub fn note(&mut self, compressed: bool) {
        if compressed {
            self.stats.files_compressed += 1;
        } else {
            self.stats.files_stored_raw += 1;
        }
    }

    /// Wrap `inner` in a gzip encoder at the engine's level
    pub fn encoder<W: Write>(&self, inner: W) -> GzEncoder<W> {
        GzEncoder::new(inner, Compression::new(self.level))
    }

    /// Compress a buffer
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = self.encoder(Vec::with_capacity(data.len() / 2 + 64));
        encoder.write_all(data)?;
        let out = encoder.finish()?;
        trace!("Compressed {} -> {} bytes", data.len(), out.len());
        Ok(out)
    }
}

/// Decompress a gzip buffer
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| BackstepError::compression(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

/// Open a file for reading, decompressing when `gzipped`
pub fn open_reader(path: &Path, gzipped: bool) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| BackstepError::from_io(e, path))?;
    if gzipped {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read a whole file, decompressing when `gzipped`
pub fn read_all(path: &Path, gzipped: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    open_reader(path, gzipped)?
        .read_to_end(&mut out)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => BackstepError::PermissionDenied { path: path.to_path_buf() },
            _ if gzipped => BackstepError::compression(format!("{:?}: {}", path, e)),
            _ => BackstepError::Io(e),
        })?;
    Ok(out)
}
