//! Metadata snapshot store
//!
//! One snapshot per session lists every [`Record`] of the mirror in index
//! order. Each record is a block of lines:
//!
//! ```text
//! File docs/report.txt
//!   Type reg
//!   Size 1832
//!   ModTime 1700000000
//!   Uid 1000
//!   Gid 1000
//!   Permissions 420
//!   NumHardLinks 1
//!   Inode 393219
//!   DeviceLoc 2049
//!   SHA256Digest 5d41402abc4b2a76b9719d911017c592...
//! ```
//!
//! Backslash and newline inside the index and symlink targets are escaped,
//! so a block always starts at a line beginning with `File `. Unknown field
//! names are a parse error.
//!
//! Snapshots are stored either in full or as a forward delta against the
//! previous snapshot's bytes. Every `full_interval`-th snapshot is full so
//! reading one never patches through a long chain.

use crate::collate::AscendingValidator;
use crate::compression::{self, CompressionEngine, CompressionStrategy, DEFAULT_LEVEL};
use crate::delta;
use crate::error::{BackstepError, Result};
use crate::index::{escape_bytes, unescape_bytes, Index};
use crate::layout::{Layout, SnapshotFile, SnapshotForm};
use crate::record::{Attributes, DeviceKind, HardlinkInfo, Record, RecordKind};
use crate::timestamp::SessionTime;
use crate::utils;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, instrument};

const HEADER: &[u8] = b"File ";
const FIELD_INDENT: &[u8] = b"  ";

fn push_field(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(FIELD_INDENT);
    out.extend_from_slice(name.as_bytes());
    out.push(b' ');
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// Serialize one record as a text block
pub fn record_to_text(rec: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(HEADER);
    out.extend_from_slice(&rec.index.to_quoted());
    out.push(b'\n');
    push_field(&mut out, "Type", rec.kind.type_name().as_bytes());

    match &rec.kind {
        RecordKind::Absent => return out,
        RecordKind::Regular { size, mtime, .. } => {
            push_field(&mut out, "Size", size.to_string().as_bytes());
            push_field(&mut out, "ModTime", mtime.to_string().as_bytes());
        }
        RecordKind::Directory { mtime } | RecordKind::Socket { mtime } | RecordKind::Fifo { mtime } => {
            push_field(&mut out, "ModTime", mtime.to_string().as_bytes());
        }
        RecordKind::Symlink { target } => push_field(&mut out, "SymData", &escape_bytes(target)),
        RecordKind::Device { kind, major, minor } => {
            let flag = match kind {
                DeviceKind::Char => 'c',
                DeviceKind::Block => 'b',
            };
            push_field(&mut out, "DeviceNum", format!("{} {} {}", flag, major, minor).as_bytes());
        }
    }
    push_field(&mut out, "Uid", rec.attrs.uid.to_string().as_bytes());
    push_field(&mut out, "Gid", rec.attrs.gid.to_string().as_bytes());
    push_field(&mut out, "Permissions", rec.attrs.perms.to_string().as_bytes());
    if let RecordKind::Regular { sha256, link, .. } = &rec.kind {
        if let Some(link) = link {
            push_field(&mut out, "NumHardLinks", link.nlink.to_string().as_bytes());
            push_field(&mut out, "Inode", link.inode.to_string().as_bytes());
            push_field(&mut out, "DeviceLoc", link.device.to_string().as_bytes());
        }
        if let Some(digest) = sha256 {
            push_field(&mut out, "SHA256Digest", digest.as_bytes());
        }
    }
    out
}

/// Parse exactly one record block
pub fn text_to_record(text: &[u8]) -> Result<Record> {
    let mut reader = RecordReader::new(Cursor::new(text), "record");
    let rec = reader
        .next()
        .ok_or_else(|| BackstepError::parse("record", 0, "empty input"))??;
    if reader.next().is_some() {
        return Err(BackstepError::parse("record", 0, "more than one record"));
    }
    Ok(rec)
}

#[derive(Default)]
struct Fields {
    kind: Option<String>,
    size: Option<u64>,
    mtime: Option<i64>,
    uid: Option<u32>,
    gid: Option<u32>,
    perms: Option<u32>,
    nlink: Option<u64>,
    inode: Option<u64>,
    device_loc: Option<u64>,
    sym_data: Option<Vec<u8>>,
    device_num: Option<(DeviceKind, u64, u64)>,
    sha256: Option<String>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, name: &str, err: &dyn Fn(String) -> BackstepError) -> Result<()> {
    if slot.is_some() {
        return Err(err(format!("duplicate field {}", name)));
    }
    *slot = Some(value);
    Ok(())
}

fn number<T: FromStr>(value: &str, name: &str, err: &dyn Fn(String) -> BackstepError) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| err(format!("{} is not a valid number for {}", value, name)))
}

impl Fields {
    fn set(&mut self, line: &[u8], err: &dyn Fn(String) -> BackstepError) -> Result<()> {
        let body = line
            .strip_prefix(FIELD_INDENT)
            .ok_or_else(|| err("expected an indented field line".to_string()))?;
        let split = body.iter().position(|&b| b == b' ').unwrap_or(body.len());
        let name = std::str::from_utf8(&body[..split]).map_err(|_| err("field name is not UTF-8".to_string()))?;
        let raw = body.get(split + 1..).unwrap_or_default();

        if name == "SymData" {
            let target = unescape_bytes(raw).map_err(|m| err(m))?;
            return set_once(&mut self.sym_data, target, name, err);
        }
        let value = std::str::from_utf8(raw).map_err(|_| err(format!("{} value is not UTF-8", name)))?;
        match name {
            "Type" => set_once(&mut self.kind, value.to_string(), name, err),
            "Size" => {
                let size: u64 = number(value, name, err)?;
                if size > i64::MAX as u64 {
                    return Err(err(format!("Size {} out of range", size)));
                }
                set_once(&mut self.size, size, name, err)
            }
            "ModTime" => set_once(&mut self.mtime, number(value, name, err)?, name, err),
            "Uid" => set_once(&mut self.uid, number(value, name, err)?, name, err),
            "Gid" => set_once(&mut self.gid, number(value, name, err)?, name, err),
            "Permissions" => {
                let perms: u32 = number(value, name, err)?;
                if perms > 0o7777 {
                    return Err(err(format!("Permissions {} out of range", perms)));
                }
                set_once(&mut self.perms, perms, name, err)
            }
            "NumHardLinks" => set_once(&mut self.nlink, number(value, name, err)?, name, err),
            "Inode" => set_once(&mut self.inode, number(value, name, err)?, name, err),
            "DeviceLoc" => set_once(&mut self.device_loc, number(value, name, err)?, name, err),
            "DeviceNum" => {
                let parts: Vec<&str> = value.split(' ').collect();
                let [flag, major, minor] = parts.as_slice() else {
                    return Err(err(format!("malformed DeviceNum {:?}", value)));
                };
                let kind = match *flag {
                    "c" => DeviceKind::Char,
                    "b" => DeviceKind::Block,
                    other => return Err(err(format!("unknown device flag {:?}", other))),
                };
                let parsed = (kind, number(major, name, err)?, number(minor, name, err)?);
                set_once(&mut self.device_num, parsed, name, err)
            }
            "SHA256Digest" => {
                if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(err(format!("malformed digest {:?}", value)));
                }
                set_once(&mut self.sha256, value.to_ascii_lowercase(), name, err)
            }
            other => Err(err(format!("unknown field {}", other))),
        }
    }

    fn build(self, index: Index, err: &dyn Fn(String) -> BackstepError) -> Result<Record> {
        let kind_name = self.kind.clone().ok_or_else(|| err("missing Type".to_string()))?;
        let require = |present: bool, name: &str| -> Result<()> {
            if present {
                Ok(())
            } else {
                Err(err(format!("{} record is missing {}", kind_name, name)))
            }
        };
        let forbid = |present: bool, name: &str| -> Result<()> {
            if present {
                Err(err(format!("{} is not valid for a {} record", name, kind_name)))
            } else {
                Ok(())
            }
        };

        if kind_name == "None" {
            forbid(self.uid.is_some() || self.gid.is_some() || self.perms.is_some(), "ownership")?;
            forbid(self.size.is_some() || self.mtime.is_some(), "Size/ModTime")?;
            forbid(self.sym_data.is_some() || self.device_num.is_some(), "SymData/DeviceNum")?;
            forbid(self.nlink.is_some() || self.inode.is_some() || self.device_loc.is_some(), "hardlink data")?;
            forbid(self.sha256.is_some(), "SHA256Digest")?;
            return Ok(Record::absent(index));
        }

        require(self.uid.is_some(), "Uid")?;
        require(self.gid.is_some(), "Gid")?;
        require(self.perms.is_some(), "Permissions")?;
        let attrs = Attributes {
            uid: self.uid.unwrap_or_default(),
            gid: self.gid.unwrap_or_default(),
            perms: self.perms.unwrap_or_default(),
        };

        let regular = kind_name == "reg";
        forbid(!regular && self.size.is_some(), "Size")?;
        forbid(!regular && self.sha256.is_some(), "SHA256Digest")?;
        forbid(
            !regular && (self.nlink.is_some() || self.inode.is_some() || self.device_loc.is_some()),
            "hardlink data",
        )?;
        forbid(kind_name != "sym" && self.sym_data.is_some(), "SymData")?;
        forbid(kind_name != "dev" && self.device_num.is_some(), "DeviceNum")?;
        let timed = matches!(kind_name.as_str(), "reg" | "dir" | "sock" | "fifo");
        forbid(!timed && self.mtime.is_some(), "ModTime")?;
        if timed {
            require(self.mtime.is_some(), "ModTime")?;
        }
        let mtime = self.mtime.unwrap_or_default();

        let kind = match kind_name.as_str() {
            "reg" => {
                require(self.size.is_some(), "Size")?;
                let link = match (self.nlink, self.inode, self.device_loc) {
                    (Some(nlink), Some(inode), Some(device)) => Some(HardlinkInfo { inode, device, nlink }),
                    (None, None, None) => None,
                    _ => return Err(err("NumHardLinks, Inode and DeviceLoc must appear together".to_string())),
                };
                RecordKind::Regular {
                    size: self.size.unwrap_or_default(),
                    mtime,
                    sha256: self.sha256,
                    link,
                }
            }
            "dir" => RecordKind::Directory { mtime },
            "sock" => RecordKind::Socket { mtime },
            "fifo" => RecordKind::Fifo { mtime },
            "sym" => {
                require(self.sym_data.is_some(), "SymData")?;
                RecordKind::Symlink {
                    target: self.sym_data.unwrap_or_default(),
                }
            }
            "dev" => {
                let (kind, major, minor) = self
                    .device_num
                    .ok_or_else(|| err("dev record is missing DeviceNum".to_string()))?;
                RecordKind::Device { kind, major, minor }
            }
            other => return Err(err(format!("unknown Type {}", other))),
        };
        Ok(Record { index, kind, attrs })
    }
}

/// Lazy reader of record blocks
pub struct RecordReader<R> {
    reader: R,
    context: String,
    line_no: usize,
    pending: Option<(Index, usize)>,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    /// Read records from `reader`; `context` names the source in errors
    pub fn new(reader: R, context: impl Into<String>) -> Self {
        RecordReader {
            reader,
            context: context.into(),
            line_no: 0,
            pending: None,
            done: false,
        }
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .map_err(|e| BackstepError::corrupt(format!("{}: {}", self.context, e)))?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn error_at(&self, line: usize) -> impl Fn(String) -> BackstepError + '_ {
        move |message| BackstepError::parse(self.context.clone(), line, message)
    }

    fn parse_header(&self, line: &[u8]) -> Result<(Index, usize)> {
        let err = self.error_at(self.line_no);
        let quoted = line
            .strip_prefix(HEADER)
            .ok_or_else(|| err("expected a File line".to_string()))?;
        let index = Index::from_quoted(quoted).map_err(|e| err(e.to_string()))?;
        Ok((index, self.line_no))
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let (index, header_line) = match self.pending.take() {
            Some(header) => header,
            None => loop {
                match self.read_line()? {
                    None => return Ok(None),
                    Some(line) if line.is_empty() => continue,
                    Some(line) => break self.parse_header(&line)?,
                }
            },
        };

        let mut fields = Fields::default();
        loop {
            match self.read_line()? {
                None => break,
                Some(line) if line.is_empty() => continue,
                Some(line) if line.starts_with(HEADER) => {
                    self.pending = Some(self.parse_header(&line)?);
                    break;
                }
                Some(line) => {
                    let err = self.error_at(self.line_no);
                    fields.set(&line, &err)?;
                }
            }
        }
        let err = self.error_at(header_line);
        fields.build(index, &err).map(Some)
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Record stream over a snapshot of any form
pub type SnapshotRecords = RecordReader<Box<dyn BufRead>>;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
        }
    }

    fn finish(self) -> Result<()> {
        let buffered = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Writes one snapshot, checking index order as it goes
pub struct SnapshotWriter {
    sink: Sink,
    path: PathBuf,
    validator: AscendingValidator,
    count: usize,
}

impl SnapshotWriter {
    /// Append `rec`; indexes must be strictly ascending
    pub fn write_record(&mut self, rec: &Record) -> Result<()> {
        self.validator.check(&rec.index)?;
        self.sink.writer().write_all(&record_to_text(rec))?;
        self.count += 1;
        Ok(())
    }

    /// Records written so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Where the snapshot is being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, finish compression, and sync
    pub fn close(self) -> Result<PathBuf> {
        self.sink.finish()?;
        debug!("Closed snapshot {:?} with {} records", self.path, self.count);
        Ok(self.path)
    }
}

/// Reads and writes the metadata snapshots of one destination
#[derive(Debug)]
pub struct MetadataStore {
    layout: Layout,
    compress: bool,
    full_interval: u32,
    engine: CompressionEngine,
}

impl MetadataStore {
    /// Store over `layout`
    ///
    /// `full_interval` of 0 or 1 keeps every snapshot full.
    pub fn new(layout: Layout, compress: bool, full_interval: u32) -> Result<Self> {
        Ok(MetadataStore {
            layout,
            compress,
            full_interval,
            engine: CompressionEngine::new(CompressionStrategy::Gzip { level: DEFAULT_LEVEL })?,
        })
    }

    /// Layout this store reads
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Start the full snapshot of `time` under its final name
    ///
    /// The file appears immediately. Until a completion marker for `time`
    /// exists, its presence is what tells regress a session was interrupted.
    #[instrument(skip(self))]
    pub fn open_snapshot(&self, time: SessionTime) -> Result<SnapshotWriter> {
        fs::create_dir_all(self.layout.data_dir())?;
        let path = self.layout.snapshot_path(time, SnapshotForm::Full, self.compress);
        let file = File::create(&path).map_err(|e| BackstepError::from_io(e, &path))?;
        let buffered = BufWriter::new(file);
        let sink = if self.compress {
            Sink::Gzip(self.engine.encoder(buffered))
        } else {
            Sink::Plain(buffered)
        };
        Ok(SnapshotWriter {
            sink,
            path,
            validator: AscendingValidator::new(),
            count: 0,
        })
    }

    /// One file per session time, preferring the full form when both exist
    fn preferred_files(&self) -> Result<Vec<SnapshotFile>> {
        let mut files = self.layout.snapshots()?;
        files.dedup_by_key(|f| f.time);
        Ok(files)
    }

    fn file_at(&self, time: SessionTime) -> Result<(Vec<SnapshotFile>, usize)> {
        let files = self.preferred_files()?;
        let pos = files
            .iter()
            .position(|f| f.time == time)
            .ok_or_else(|| BackstepError::SessionNotFound(format!("no metadata snapshot for {}", time)))?;
        Ok((files, pos))
    }

    /// Times that have a snapshot, oldest first
    pub fn times(&self) -> Result<Vec<SessionTime>> {
        Ok(self.preferred_files()?.into_iter().map(|f| f.time).collect())
    }

    /// Serialized bytes of the snapshot at `time`, patching diffs forward
    pub fn read_bytes(&self, time: SessionTime) -> Result<Vec<u8>> {
        let (files, pos) = self.file_at(time)?;
        let base = files[..=pos]
            .iter()
            .rposition(|f| f.form == SnapshotForm::Full)
            .ok_or_else(|| BackstepError::corrupt(format!("diff snapshot {} has no full snapshot before it", time)))?;

        let full = &files[base];
        let mut bytes = compression::read_all(&full.path, full.gzipped).map_err(corrupt_read)?;
        for diff in &files[base + 1..=pos] {
            let delta_bytes = compression::read_all(&diff.path, diff.gzipped).map_err(corrupt_read)?;
            bytes = delta::patch(&bytes, &delta_bytes)
                .map_err(|e| BackstepError::corrupt(format!("{:?}: {}", diff.path, e)))?;
        }
        Ok(bytes)
    }

    /// Records of the snapshot at `time`, in index order
    ///
    /// Full snapshots stream from disk; diff snapshots are reconstructed in
    /// memory first.
    pub fn iterate(&self, time: SessionTime) -> Result<SnapshotRecords> {
        let (files, pos) = self.file_at(time)?;
        let file = &files[pos];
        let context = file.path.display().to_string();
        let reader: Box<dyn BufRead> = match file.form {
            SnapshotForm::Full => Box::new(BufReader::new(compression::open_reader(&file.path, file.gzipped)?)),
            SnapshotForm::Diff => Box::new(Cursor::new(self.read_bytes(time)?)),
        };
        Ok(RecordReader::new(reader, context))
    }

    /// Records at or below `prefix`
    ///
    /// Reading stops at the first record past the subtree. Records before
    /// `prefix` are still read and parsed, so the cost grows with the part of
    /// the snapshot that precedes the subtree.
    pub fn slice(
        &self,
        time: SessionTime,
        prefix: Index,
    ) -> Result<impl Iterator<Item = Result<Record>>> {
        let skip_prefix = prefix.clone();
        Ok(self
            .iterate(time)?
            .skip_while(move |rec| matches!(rec, Ok(r) if r.index < skip_prefix))
            .take_while(move |rec| match rec {
                Ok(r) => r.index.starts_with(&prefix),
                Err(_) => true,
            }))
    }

    /// Convert the snapshot at `time` to a forward diff when the interval allows
    ///
    /// The diff is written atomically before the full file is removed, so a
    /// crash in between leaves both forms and readers use the full one.
    #[instrument(skip(self))]
    pub fn finalize(&self, time: SessionTime) -> Result<SnapshotForm> {
        if self.full_interval <= 1 {
            return Ok(SnapshotForm::Full);
        }
        let (files, pos) = self.file_at(time)?;
        let current = &files[pos];
        if current.form == SnapshotForm::Diff || pos == 0 {
            return Ok(current.form);
        }
        let diffs_before = files[..pos]
            .iter()
            .rev()
            .take_while(|f| f.form == SnapshotForm::Diff)
            .count();
        if diffs_before + 1 >= self.full_interval as usize {
            debug!("Keeping {} as a full snapshot", time);
            return Ok(SnapshotForm::Full);
        }

        let previous = self.read_bytes(files[pos - 1].time)?;
        let new_bytes = compression::read_all(&current.path, current.gzipped)?;
        let forward = delta::delta(&delta::signature(&previous), &new_bytes)?;
        let payload = if self.compress {
            self.engine.compress(&forward)?
        } else {
            forward
        };
        let diff_path = self.layout.snapshot_path(time, SnapshotForm::Diff, self.compress);
        utils::atomic_write(&diff_path, &payload)?;
        fs::remove_file(&current.path).map_err(|e| BackstepError::from_io(e, &current.path))?;
        info!(
            "Stored snapshot {} as diff ({} bytes instead of {})",
            time,
            payload.len(),
            new_bytes.len()
        );
        Ok(SnapshotForm::Diff)
    }

    /// Remove every snapshot file of `time`; missing files are fine
    pub fn delete(&self, time: SessionTime) -> Result<usize> {
        let files = self.layout.snapshots_at(time)?;
        let mut removed = 0;
        for file in files {
            match fs::remove_file(&file.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(BackstepError::from_io(err, &file.path)),
            }
        }
        Ok(removed)
    }
}

fn corrupt_read(err: BackstepError) -> BackstepError {
    match err {
        BackstepError::Compression(msg) => BackstepError::CorruptMetadata(msg),
        other => other,
    }
}
