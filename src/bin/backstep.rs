//! # backstep CLI
//!
//! ## Usage
//! ```bash
//! # Mirror a directory, keeping reverse increments of what changed
//! backstep backup ~/project /backups/project
//!
//! # List sessions
//! backstep list /backups/project
//!
//! # Restore the tree as it was two days ago
//! backstep restore /backups/project /tmp/project --at 2days
//!
//! # Roll back an interrupted session
//! backstep regress /backups/project
//! ```

use backstep::{
    Backstep, BackstepBuilder, BackstepError, Index, ProgressInfo, Result, SessionReport, SessionTime,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Incremental mirror backups with reverse increments
#[derive(Parser)]
#[command(name = "backstep")]
#[command(version)]
#[command(about = "Mirror a directory and keep reverse increments of every change")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide progress spinners
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup session
    Backup {
        /// Directory to back up
        source: PathBuf,

        /// Destination directory
        dest: PathBuf,

        /// Separator inside timestamps for a new destination
        #[arg(long, default_value_t = ':')]
        separator: char,

        /// Store increments uncompressed
        #[arg(long)]
        no_compression: bool,

        /// Compare file contents by SHA-256, not only size and mtime
        #[arg(long)]
        compare_hashes: bool,
    },

    /// Restore a past state into a new directory
    #[command(alias = "rs")]
    Restore {
        /// Destination directory
        dest: PathBuf,

        /// Where to put the restored tree
        target: PathBuf,

        /// Session time, RFC 3339 time, epoch seconds, or an age like `3days`
        #[arg(long)]
        at: Option<String>,

        /// Only restore this path inside the tree
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Roll back an interrupted session
    Regress {
        /// Destination directory
        dest: PathBuf,
    },

    /// List committed sessions
    #[command(alias = "ls")]
    List {
        /// Destination directory
        dest: PathBuf,

        /// Show per-session statistics
        #[arg(short, long)]
        detailed: bool,
    },

    /// Check content digests of a session
    Verify {
        /// Destination directory
        dest: PathBuf,

        /// Session time; defaults to the newest session
        #[arg(long)]
        at: Option<String>,
    },

    /// Answer protocol requests on stdin/stdout
    Serve {
        /// Destination directory
        dest: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `serve` keeps stdout for frames
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let quiet = cli.quiet;
    match cli.command {
        Commands::Backup {
            source,
            dest,
            separator,
            no_compression,
            compare_hashes,
        } => cmd_backup(&source, dest, separator, no_compression, compare_hashes, quiet),
        Commands::Restore { dest, target, at, path } => cmd_restore(dest, &target, at, path, quiet),
        Commands::Regress { dest } => cmd_regress(dest),
        Commands::List { dest, detailed } => cmd_list(dest, detailed),
        Commands::Verify { dest, at } => cmd_verify(dest, at, quiet),
        Commands::Serve { dest } => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            backstep::protocol::serve(&dest, stdin.lock(), stdout.lock())
        }
    }
}

fn spinner(quiet: bool, message: &'static str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn attach_progress(backstep: &mut Backstep, pb: &Option<ProgressBar>) {
    if let Some(pb) = pb {
        let pb = pb.clone();
        backstep.set_progress(Arc::new(move |info: ProgressInfo| {
            if let Some(item) = info.current_item {
                pb.set_message(format!("{} {} ({} entries)", info.operation, item, info.processed));
            }
        }));
    }
}

/// Parse a `--at` value; ages are counted back from now
fn parse_time(text: Option<String>) -> Result<SessionTime> {
    let Some(text) = text else {
        return Ok(SessionTime::now());
    };
    if let Ok(age) = humantime::parse_duration(&text) {
        return Ok(SessionTime::from_secs(SessionTime::now().as_secs() - age.as_secs() as i64));
    }
    SessionTime::parse_user(&text, ':')
}

fn cmd_backup(
    source: &Path,
    dest: PathBuf,
    separator: char,
    no_compression: bool,
    compare_hashes: bool,
    quiet: bool,
) -> Result<()> {
    let mut backstep = BackstepBuilder::new()
        .timestamp_separator(separator)
        .compress_increments(!no_compression)
        .compare_hashes(compare_hashes)
        .build(dest)?;

    println!("{}", "Backing up...".blue().bold());
    let start = Instant::now();
    let pb = spinner(quiet, "Scanning source...");
    attach_progress(&mut backstep, &pb);
    let report = backstep.backup(source);
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report?;

    if let Some(regress) = report.regress.as_ref().filter(|r| r.rolled_back()) {
        println!(
            "{} Rolled back interrupted session {}",
            "!".yellow().bold(),
            regress.aborted_time.map(|t| t.to_string()).unwrap_or_default().yellow()
        );
    }
    println!("{} Session {}", "✓".green().bold(), report.time.to_string().yellow().bold());
    print_session(&report);
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());

    if report.is_degraded() {
        println!(
            "{} {} entries were skipped and keep their previous state:",
            "Warning:".yellow().bold(),
            report.errors.len()
        );
        for error in report.errors.iter().take(20) {
            println!("  {}", error.to_string().yellow());
        }
        if report.errors.len() > 20 {
            println!("  ... and {} more in the session error log", report.errors.len() - 20);
        }
    }
    Ok(())
}

fn print_session(report: &SessionReport) {
    let stats = &report.stats;
    println!("  Entries: {}", stats.source_entries.to_string().cyan());
    println!(
        "  New: {}  Changed: {}  Deleted: {}",
        stats.new_entries.to_string().green(),
        stats.changed_entries.to_string().yellow(),
        stats.deleted_entries.to_string().red()
    );
    println!(
        "  Increments: {} ({})",
        stats.increment_files.to_string().cyan(),
        format_bytes(stats.increment_bytes).cyan()
    );
    println!("  Written to mirror: {}", format_bytes(stats.mirror_bytes_written).cyan());
}

fn cmd_restore(dest: PathBuf, target: &Path, at: Option<String>, path: Option<PathBuf>, quiet: bool) -> Result<()> {
    let mut backstep = Backstep::open(dest)?;
    let requested = parse_time(at)?;
    let time = backstep.resolve_time(requested)?;
    let prefix = match &path {
        Some(path) => Index::from_relative_path(path)?,
        None => Index::root(),
    };

    println!("{} {}", "Restoring session".blue().bold(), time.to_string().yellow());
    let start = Instant::now();
    let pb = spinner(quiet, "Restoring files...");
    attach_progress(&mut backstep, &pb);
    let result = backstep.restore_path(time, &prefix, target);
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let result = result?;

    println!("{} Restored into {}", "✓".green().bold(), target.display().to_string().cyan());
    println!("  Files: {}", result.files_restored.to_string().cyan());
    println!("  Directories: {}", result.directories_restored.to_string().cyan());
    if result.special_restored > 0 {
        println!("  Special: {}", result.special_restored.to_string().cyan());
    }
    if result.links_restored > 0 {
        println!("  Hard links: {}", result.links_restored.to_string().cyan());
    }
    println!("  Size: {}", format_bytes(result.bytes_written).cyan());
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    for warning in &result.warnings {
        println!("  {} {}", "Warning:".yellow().bold(), warning);
    }
    Ok(())
}

fn cmd_regress(dest: PathBuf) -> Result<()> {
    let backstep = Backstep::open(dest)?;
    let report = backstep.regress()?;
    if !report.rolled_back() {
        println!("{} Nothing to roll back", "✓".green().bold());
        return Ok(());
    }
    println!(
        "{} Rolled back {} to {}",
        "✓".green().bold(),
        report.aborted_time.map(|t| t.to_string()).unwrap_or_default().yellow(),
        report
            .regress_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "an empty mirror".to_string())
            .cyan()
    );
    println!(
        "  Deleted: {}  Patched: {}  Replaced: {}  Increments removed: {}",
        report.entries_deleted, report.entries_patched, report.entries_replaced, report.increments_removed
    );
    for error in &report.errors {
        println!("  {} {}", "Warning:".yellow().bold(), error);
    }
    Ok(())
}

fn cmd_list(dest: PathBuf, detailed: bool) -> Result<()> {
    let backstep = Backstep::open(dest)?;
    if backstep.regress_state()?.needs_regress() {
        println!(
            "{} The newest session was interrupted; run {}",
            "Warning:".yellow().bold(),
            "backstep regress".yellow()
        );
    }
    let sessions = backstep.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions yet");
        return Ok(());
    }
    println!("{}", format!("{} sessions", sessions.len()).bold());
    for time in sessions.iter().rev() {
        let local = time.to_datetime().with_timezone(&chrono::Local);
        print!("  {}  {}", time.to_string().yellow(), local.format("%a %b %e %H:%M:%S %Y").to_string().dimmed());
        if detailed {
            match backstep.session_report(*time) {
                Ok(report) => print!(
                    "  {} changes, {} increments{}",
                    report.stats.total_changes(),
                    format_bytes(report.stats.increment_bytes),
                    if report.is_degraded() { " (degraded)".yellow().to_string() } else { String::new() }
                ),
                Err(_) => print!("  {}", "no statistics".dimmed()),
            }
        }
        println!();
    }
    Ok(())
}

fn cmd_verify(dest: PathBuf, at: Option<String>, quiet: bool) -> Result<()> {
    let backstep = Backstep::open(dest)?;
    let time = backstep.resolve_time(parse_time(at)?)?;
    let pb = spinner(quiet, "Hashing files...");
    let report = backstep.verify(time);
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report?;

    if report.is_valid() {
        println!("{} {}", "✓".green().bold(), report.summary());
    } else {
        println!("{} {}", "✗".red().bold(), report.summary());
        for failure in &report.failures {
            println!("  {} {}", failure.index.red(), failure.describe());
        }
        return Err(BackstepError::CorruptMetadata(format!(
            "{} files do not match their recorded digest",
            report.failures.len()
        )));
    }
    if report.unverifiable > 0 {
        println!(
            "  {} files have no recorded digest",
            report.unverifiable.to_string().yellow()
        );
    }
    println!("  Time: {}", format_duration(Duration::from_millis(report.verification_time_ms)).to_string().cyan());
    Ok(())
}

fn round(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
