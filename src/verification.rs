//! Content verification against recorded digests
//!
//! Every regular file copied into the mirror gets a SHA-256 digest in the
//! session's metadata snapshot. Verification recomputes the digest of each
//! regular file as of a session and compares the two.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use backstep::verification;
//! use backstep::timestamp::SessionTime;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let report = verification::verify(Path::new("/backups/home"), SessionTime::now())?;
//! if report.is_valid() {
//!     println!("{}", report.summary());
//! } else {
//!     for failure in &report.failures {
//!         eprintln!("{}: {}", failure.index, failure.describe());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For the newest session the mirror itself is hashed. Older sessions are
//! reconstructed file by file from the increments, which is much slower.

use crate::error::Result;
use crate::layout::IncrementLookup;
use crate::record::Record;
use crate::restore::Restorer;
use crate::timestamp::SessionTime;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Verify the session at or before `time` in the destination at `dest`
pub fn verify(dest: &Path, time: SessionTime) -> Result<VerificationReport> {
    let restorer = Restorer::open(dest)?;
    let resolved = restorer.resolve_time(time)?;
    Verifier::new(&restorer).verify(resolved)
}

/// Outcome of checking one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVerification {
    /// Index of the file
    pub index: String,
    /// Digest recorded in the snapshot
    pub expected: String,
    /// Digest of the content found, if it could be read
    pub actual: Option<String>,
    /// Whether the content length matched the recorded size
    pub size_matches: bool,
    /// Why the content could not be read
    pub error: Option<String>,
}

impl FileVerification {
    /// Whether the content matched
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.size_matches && self.actual.as_deref() == Some(self.expected.as_str())
    }

    /// Short description of what went wrong
    pub fn describe(&self) -> String {
        match (&self.error, &self.actual) {
            (Some(err), _) => format!("unreadable: {}", err),
            (None, Some(actual)) if actual != &self.expected => {
                format!("digest {} does not match recorded {}", short(actual), short(&self.expected))
            }
            (None, _) if !self.size_matches => "size differs from the snapshot".to_string(),
            _ => "ok".to_string(),
        }
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}

/// Result of verifying one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Session that was verified
    pub time: SessionTime,
    /// Whether content came straight from the mirror
    pub from_mirror: bool,
    /// Regular files whose digest was recomputed
    pub files_checked: usize,
    /// Files whose content matched
    pub files_valid: usize,
    /// Regular files without a recorded digest
    pub unverifiable: usize,
    /// Files that failed
    pub failures: Vec<FileVerification>,
    /// Bytes hashed
    pub bytes_hashed: u64,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    fn new(time: SessionTime, from_mirror: bool) -> Self {
        VerificationReport {
            time,
            from_mirror,
            files_checked: 0,
            files_valid: 0,
            unverifiable: 0,
            failures: Vec::new(),
            bytes_hashed: 0,
            verification_time_ms: 0,
        }
    }

    /// Whether every checked file matched
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {}/{} files valid",
            self.time, self.files_valid, self.files_checked
        );
        if self.unverifiable > 0 {
            summary.push_str(&format!(", {} without digest", self.unverifiable));
        }
        if !self.failures.is_empty() {
            summary.push_str(&format!(", {} failed", self.failures.len()));
        }
        summary
    }
}

/// Digest checker over one destination
pub struct Verifier<'a> {
    restorer: &'a Restorer,
}

impl<'a> Verifier<'a> {
    /// Verifier reading through `restorer`
    pub fn new(restorer: &'a Restorer) -> Self {
        Verifier { restorer }
    }

    /// Check every regular file of the session at `time`
    ///
    /// Mismatches are reported, not returned as errors. Errors are returned
    /// only when the snapshot itself cannot be read.
    #[instrument(skip(self))]
    pub fn verify(&self, time: SessionTime) -> Result<VerificationReport> {
        let start = Instant::now();
        let sessions = self.restorer.sessions()?;
        let from_mirror = sessions.last() == Some(&time);
        let mut report = VerificationReport::new(time, from_mirror);
        let mut lookup = IncrementLookup::new();

        for record in self.restorer.read_tree_at(time)? {
            let record = record?;
            if !record.is_regular() {
                continue;
            }
            let Some(expected) = record.sha256().map(str::to_string) else {
                report.unverifiable += 1;
                continue;
            };
            report.files_checked += 1;
            let check = self.check(
                &record,
                expected,
                time,
                from_mirror,
                &sessions,
                &mut lookup,
                &mut report.bytes_hashed,
            );
            if check.is_valid() {
                report.files_valid += 1;
            } else {
                warn!("{} failed verification: {}", record.index, check.describe());
                report.failures.push(check);
            }
        }

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        info!("Verified {} in {}ms: {}", time, report.verification_time_ms, report.summary());
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn check(
        &self,
        record: &Record,
        expected: String,
        time: SessionTime,
        from_mirror: bool,
        sessions: &[SessionTime],
        lookup: &mut IncrementLookup,
        bytes_hashed: &mut u64,
    ) -> FileVerification {
        let mut check = FileVerification {
            index: record.index.to_string(),
            expected,
            actual: None,
            size_matches: false,
            error: None,
        };
        let content = if from_mirror {
            let path = self.restorer.layout().mirror_path(&record.index);
            utils::with_forced_access(&path, || {
                let size = std::fs::symlink_metadata(&path)?.len();
                Ok((utils::hash_file_content(&path)?, size))
            })
        } else {
            self.restorer
                .content_at(&record.index, time, sessions, lookup)
                .map(|data| (utils::hash_data(&data), data.len() as u64))
        };
        match content {
            Ok((digest, size)) => {
                debug!("{} hashed to {}", record.index, short(&digest));
                check.actual = Some(digest);
                check.size_matches = record.size() == Some(size);
                *bytes_hashed += size;
            }
            Err(err) => check.error = Some(err.to_string()),
        }
        check
    }
}
