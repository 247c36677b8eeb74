//! # backstep - mirror plus reverse increments
//!
//! An incremental backup engine. The destination always holds a plain
//! mirror of the newest session, and everything older is kept as reverse
//! increments: for each entry that changed, enough data to step the mirror
//! back to what it was before.
//!
//! ## Overview
//!
//! A destination looks like this:
//!
//! ```text
//! dest/                    mirror of the source at the newest session
//! dest/backstep-data/      metadata snapshots, increments, markers, stats
//! ```
//!
//! Each session:
//! - walks the source and the previous session's metadata snapshot in lockstep
//! - writes a reverse increment for every changed entry before touching the mirror
//! - updates the mirror and streams a new metadata snapshot
//! - commits by writing a completion marker
//!
//! A session that never reached its marker is rolled back with a regress,
//! which runs automatically before the next backup.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backstep::{Backstep, SessionTime};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backstep = Backstep::init("/backups/project")?;
//!
//! let report = backstep.backup(Path::new("./project"))?;
//! println!("{} new, {} changed", report.stats.new_entries, report.stats.changed_entries);
//!
//! // Put yesterday's tree somewhere else
//! let yesterday = SessionTime::from_secs(SessionTime::now().as_secs() - 86_400);
//! backstep.restore(yesterday, Path::new("/tmp/project-yesterday"))?;
//! # Ok(())
//! # }
//! ```
//!
//! The free functions [`run_backup_session`], [`run_regress`] and
//! [`read_tree_at`] cover the same ground without a handle.
//!
//! ## Module Organization
//!
//! - [`record`], [`index`]: metadata records and their ordering
//! - [`metadata`]: text metadata snapshots, full or forward diff
//! - [`collate`]: lockstep iteration over index-ordered streams
//! - [`hardlink`]: inode correlation within one session
//! - [`increment`]: reverse increments
//! - [`backup`], [`regress`], [`restore`], [`verification`]: operations
//! - [`protocol`]: framed request/response messages for remote destinations
//! - [`types`], [`error`]: reports, configuration, hooks and errors

pub mod backstep;
pub mod backup;
pub mod collate;
pub mod compression;
pub mod delta;
pub mod error;
pub mod hardlink;
pub mod increment;
pub mod index;
pub mod layout;
pub mod metadata;
pub mod protocol;
pub mod record;
pub mod regress;
pub mod restore;
pub mod timestamp;
pub mod types;
pub mod verification;
pub mod walk;

mod utils;

pub use crate::backstep::{Backstep, BackstepBuilder};
pub use backup::run_backup_session;
pub use compression::CompressionStrategy;
pub use error::{BackstepError, Result};
pub use index::Index;
pub use record::{Record, RecordKind};
pub use regress::run_regress;
pub use restore::{list_sessions, read_tree_at, restore};
pub use timestamp::SessionTime;
pub use types::*;
pub use verification::{verify, VerificationReport};
