//! Session times and the repository filename grammars
//!
//! Every file the engine writes into the data directory embeds a session
//! time rendered as a fixed-width ISO-8601 string in UTC, e.g.
//! `2024-03-01T12:30:05+00:00`. The `:` inside the time of day and the offset
//! can be swapped for another separator on filesystems that disallow it.
//!
//! Names follow `<base>.<timestamp>.<suffix>[.gz]`. Because the timestamp
//! never contains a `.`, names are parsed from the right.

use crate::error::{BackstepError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Width of a rendered timestamp
pub const TIMESTAMP_WIDTH: usize = 25;

/// Default separator inside the time of day
pub const DEFAULT_SEPARATOR: char = ':';

/// A session time with one-second resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionTime(i64);

impl SessionTime {
    /// Session time from seconds since the epoch
    pub fn from_secs(secs: i64) -> Self {
        SessionTime(secs)
    }

    /// Current time truncated to seconds
    pub fn now() -> Self {
        SessionTime(Utc::now().timestamp())
    }

    /// Seconds since the epoch
    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// The next representable session time
    pub fn next(&self) -> Self {
        SessionTime(self.0 + 1)
    }

    /// As a chrono UTC timestamp
    ///
    /// Seconds outside chrono's range map to the epoch.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).single().unwrap_or_else(|| {
            warn!("Session time {}s is out of range, using the epoch", self.0);
            DateTime::<Utc>::UNIX_EPOCH
        })
    }

    /// Render with the given time separator
    pub fn to_timestring(&self, separator: char) -> String {
        let dt = self.to_datetime();
        let s = separator;
        format!(
            "{}T{}{s}{}{s}{}+00{s}00",
            dt.format("%Y-%m-%d"),
            dt.format("%H"),
            dt.format("%M"),
            dt.format("%S"),
        )
    }

    /// Parse a timestamp written by [`SessionTime::to_timestring`]
    ///
    /// Offsets other than `+00` are accepted and normalized to UTC.
    pub fn parse(text: &str, separator: char) -> Result<Self> {
        let err = |msg: &str| BackstepError::parse("timestamp", 0, format!("{}: {:?}", msg, text));
        if !text.is_ascii() || text.len() != TIMESTAMP_WIDTH {
            return Err(err("wrong width"));
        }
        let (date_part, rest) = text.split_at(10);
        let rest = rest.strip_prefix('T').ok_or_else(|| err("missing T"))?;
        let (time_part, offset_part) = rest.split_at(8);

        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| err("bad date"))?;
        let time_fields: Vec<&str> = time_part.split(separator).collect();
        if time_fields.len() != 3 {
            return Err(err("bad time separator"));
        }
        let hms: Vec<u32> = time_fields
            .iter()
            .map(|f| f.parse::<u32>().map_err(|_| err("bad time")))
            .collect::<Result<_>>()?;
        let time = NaiveTime::from_hms_opt(hms[0], hms[1], hms[2]).ok_or_else(|| err("bad time"))?;

        let sign = match offset_part.as_bytes()[0] {
            b'+' => 1i64,
            b'-' => -1i64,
            _ => return Err(err("bad offset sign")),
        };
        let offset_fields: Vec<&str> = offset_part[1..].split(separator).collect();
        if offset_fields.len() != 2 {
            return Err(err("bad offset"));
        }
        let oh: i64 = offset_fields[0].parse().map_err(|_| err("bad offset"))?;
        let om: i64 = offset_fields[1].parse().map_err(|_| err("bad offset"))?;

        let local = date.and_time(time).and_utc().timestamp();
        Ok(SessionTime(local - sign * (oh * 3600 + om * 60)))
    }

    /// Parse a human supplied time: a timestamp, RFC 3339, or epoch seconds
    pub fn parse_user(text: &str, separator: char) -> Result<Self> {
        if let Ok(t) = Self::parse(text, separator) {
            return Ok(t);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(SessionTime(dt.timestamp()));
        }
        text.parse::<i64>()
            .map(SessionTime)
            .map_err(|_| BackstepError::parse("time", 0, format!("unrecognized time {:?}", text)))
    }
}

impl fmt::Display for SessionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_timestring(DEFAULT_SEPARATOR))
    }
}

/// Check that `separator` cannot be confused with the rest of the grammar
pub fn validate_separator(separator: char) -> Result<()> {
    if separator.is_ascii_digit() || "-+T./\\\0\n".contains(separator) || !separator.is_ascii_graphic() {
        return Err(BackstepError::InvalidConfiguration(format!(
            "{:?} cannot be used as a timestamp separator",
            separator
        )));
    }
    Ok(())
}

/// Kinds of increments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncrementKind {
    /// Entry did not exist before
    Missing,
    /// Entry was a directory before
    Dir,
    /// Reverse delta against the current mirror content
    Diff,
    /// Verbatim copy of the prior entry
    Snapshot,
}

impl IncrementKind {
    /// Suffix used in increment names
    pub fn suffix(&self) -> &'static str {
        match self {
            IncrementKind::Missing => "missing",
            IncrementKind::Dir => "dir",
            IncrementKind::Diff => "diff",
            IncrementKind::Snapshot => "snapshot",
        }
    }

    /// Parse a suffix
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "missing" => Some(IncrementKind::Missing),
            "dir" => Some(IncrementKind::Dir),
            "diff" => Some(IncrementKind::Diff),
            "snapshot" => Some(IncrementKind::Snapshot),
            _ => None,
        }
    }
}

/// A parsed `<base>.<timestamp>.<suffix>[.gz]` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedName {
    /// Everything before the timestamp
    pub base: Vec<u8>,
    /// Embedded session time
    pub time: SessionTime,
    /// Suffix after the timestamp
    pub suffix: String,
    /// Whether the name ends in `.gz`
    pub gzipped: bool,
}

impl TimedName {
    /// Build a name
    pub fn new(base: impl Into<Vec<u8>>, time: SessionTime, suffix: impl Into<String>, gzipped: bool) -> Self {
        TimedName {
            base: base.into(),
            time,
            suffix: suffix.into(),
            gzipped,
        }
    }

    /// Render with the given separator
    pub fn render(&self, separator: char) -> Vec<u8> {
        let mut name = self.base.clone();
        name.push(b'.');
        name.extend_from_slice(self.time.to_timestring(separator).as_bytes());
        name.push(b'.');
        name.extend_from_slice(self.suffix.as_bytes());
        if self.gzipped {
            name.extend_from_slice(b".gz");
        }
        name
    }

    /// Parse a name, `None` when it does not follow the grammar
    pub fn parse(name: &[u8], separator: char) -> Option<TimedName> {
        let (rest, gzipped) = match name.strip_suffix(b".gz") {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let dot = rest.iter().rposition(|&b| b == b'.')?;
        let suffix = std::str::from_utf8(&rest[dot + 1..]).ok()?;
        let rest = &rest[..dot];
        if rest.len() < TIMESTAMP_WIDTH + 2 {
            return None;
        }
        let ts_start = rest.len() - TIMESTAMP_WIDTH;
        if rest[ts_start - 1] != b'.' {
            return None;
        }
        let ts = std::str::from_utf8(&rest[ts_start..]).ok()?;
        let time = SessionTime::parse(ts, separator).ok()?;
        Some(TimedName {
            base: rest[..ts_start - 1].to_vec(),
            time,
            suffix: suffix.to_string(),
            gzipped,
        })
    }

    /// Interpret the suffix as an increment kind
    pub fn increment_kind(&self) -> Option<IncrementKind> {
        IncrementKind::from_suffix(&self.suffix)
    }
}
