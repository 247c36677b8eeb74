//! Request/response protocol for operating on a remote destination
//!
//! Every message is one frame: a 4-byte big-endian body length followed by
//! the bincode encoding of a [`Request`] or [`Response`]. A conversation
//! starts with `Hello` in both directions; the versions must match.
//! `ReadTreeAt` is answered by one `Record` frame per entry and a closing
//! `EndOfStream`.
//!
//! ```text
//! client                         server
//!   Hello { version }      ->
//!                          <-    Hello { version, backstep_version }
//!   ReadTreeAt { time }    ->
//!                          <-    Record ... Record, EndOfStream
//!   Goodbye                ->
//! ```

use crate::backstep::Backstep;
use crate::error::{BackstepError, Result};
use crate::record::Record;
use crate::timestamp::SessionTime;
use crate::types::RegressReport;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info, instrument, trace, warn};

/// Version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Open the conversation
    Hello {
        /// Client protocol version
        version: u32,
    },
    /// Committed session times
    ListSessions,
    /// Records of the newest session at or before `time`
    ReadTreeAt {
        /// Requested time
        time: SessionTime,
    },
    /// Roll back an interrupted session
    Regress,
    /// End the conversation
    Goodbye,
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to `Hello`
    Hello {
        /// Server protocol version
        version: u32,
        /// Server crate version
        backstep_version: String,
    },
    /// Answer to `ListSessions`
    Sessions(Vec<SessionTime>),
    /// One record of a `ReadTreeAt` stream
    Record(Record),
    /// End of a `ReadTreeAt` stream
    EndOfStream,
    /// Answer to `Regress`
    Regressed(RegressReport),
    /// The request failed
    Error {
        /// Error text
        message: String,
    },
}

/// Write one frame
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| BackstepError::protocol(format!("frame of {} bytes is too large", body.len())))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame
///
/// Returns `None` when the stream ends cleanly between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(BackstepError::protocol("stream ended inside a frame header")),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(BackstepError::protocol(format!("frame length {} exceeds {}", len, MAX_FRAME_LEN)));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => BackstepError::protocol("stream ended inside a frame body"),
        _ => err.into(),
    })?;
    let (message, used) = bincode::serde::decode_from_slice(&body, bincode::config::standard())?;
    if used != body.len() {
        return Err(BackstepError::protocol(format!("{} trailing bytes after message", body.len() - used)));
    }
    Ok(Some(message))
}

/// Answer requests about the destination at `dest` until the client says goodbye
///
/// Failed operations are reported to the client and the conversation goes
/// on. A version mismatch or a request before `Hello` ends it with a
/// [`BackstepError::Protocol`] error.
#[instrument(skip(reader, writer))]
pub fn serve<R: Read, W: Write>(dest: &Path, mut reader: R, mut writer: W) -> Result<()> {
    let backstep = Backstep::open(dest)?;
    let mut greeted = false;

    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        trace!("Request {:?}", request);
        match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    let message = format!("client speaks version {}, server speaks {}", version, PROTOCOL_VERSION);
                    write_frame(&mut writer, &Response::Error { message: message.clone() })?;
                    return Err(BackstepError::Protocol(message));
                }
                greeted = true;
                write_frame(
                    &mut writer,
                    &Response::Hello {
                        version: PROTOCOL_VERSION,
                        backstep_version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                )?;
            }
            _ if !greeted => {
                let message = "request before Hello".to_string();
                write_frame(&mut writer, &Response::Error { message: message.clone() })?;
                return Err(BackstepError::Protocol(message));
            }
            Request::ListSessions => {
                let response = match backstep.list_sessions() {
                    Ok(sessions) => Response::Sessions(sessions),
                    Err(err) => error_response(err),
                };
                write_frame(&mut writer, &response)?;
            }
            Request::ReadTreeAt { time } => stream_tree(&backstep, time, &mut writer)?,
            Request::Regress => {
                let response = match backstep.regress() {
                    Ok(report) => Response::Regressed(report),
                    Err(err) => error_response(err),
                };
                write_frame(&mut writer, &response)?;
            }
            Request::Goodbye => {
                debug!("Client said goodbye");
                return Ok(());
            }
        }
    }
    info!("Client closed the connection");
    Ok(())
}

fn error_response(err: BackstepError) -> Response {
    warn!("Request failed: {}", err);
    Response::Error { message: err.to_string() }
}

fn stream_tree<W: Write>(backstep: &Backstep, time: SessionTime, writer: &mut W) -> Result<()> {
    let records = match backstep.read_tree_at(time) {
        Ok(records) => records,
        Err(err) => return write_frame(writer, &error_response(err)),
    };
    let mut sent = 0usize;
    for record in records {
        match record {
            Ok(record) => {
                write_frame(writer, &Response::Record(record))?;
                sent += 1;
            }
            Err(err) => return write_frame(writer, &error_response(err)),
        }
    }
    debug!("Streamed {} records", sent);
    write_frame(writer, &Response::EndOfStream)
}

/// Client side of the protocol
pub struct RemoteDestination<R: Read, W: Write> {
    reader: R,
    writer: W,
    server_version: String,
}

impl<R: Read, W: Write> RemoteDestination<R, W> {
    /// Greet the server over `reader`/`writer`
    pub fn connect(reader: R, writer: W) -> Result<Self> {
        let mut remote = RemoteDestination {
            reader,
            writer,
            server_version: String::new(),
        };
        write_frame(&mut remote.writer, &Request::Hello { version: PROTOCOL_VERSION })?;
        match remote.receive()? {
            Response::Hello { version, backstep_version } if version == PROTOCOL_VERSION => {
                remote.server_version = backstep_version;
                Ok(remote)
            }
            Response::Hello { version, .. } => Err(BackstepError::protocol(format!(
                "server speaks version {}, client speaks {}",
                version, PROTOCOL_VERSION
            ))),
            other => Err(unexpected(other)),
        }
    }

    /// Crate version reported by the server
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn receive(&mut self) -> Result<Response> {
        match read_frame(&mut self.reader)? {
            Some(Response::Error { message }) => Err(BackstepError::Protocol(format!("server: {}", message))),
            Some(response) => Ok(response),
            None => Err(BackstepError::protocol("server closed the connection")),
        }
    }

    /// Committed session times of the remote destination
    pub fn list_sessions(&mut self) -> Result<Vec<SessionTime>> {
        write_frame(&mut self.writer, &Request::ListSessions)?;
        match self.receive()? {
            Response::Sessions(sessions) => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Records of the newest remote session at or before `time`
    pub fn read_tree_at(&mut self, time: SessionTime) -> Result<RemoteRecords<'_, R, W>> {
        write_frame(&mut self.writer, &Request::ReadTreeAt { time })?;
        Ok(RemoteRecords { remote: self, done: false })
    }

    /// Roll back an interrupted remote session
    pub fn regress(&mut self) -> Result<RegressReport> {
        write_frame(&mut self.writer, &Request::Regress)?;
        match self.receive()? {
            Response::Regressed(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// End the conversation
    pub fn close(mut self) -> Result<()> {
        write_frame(&mut self.writer, &Request::Goodbye)
    }
}

fn unexpected(response: Response) -> BackstepError {
    BackstepError::protocol(format!("unexpected response {:?}", response))
}

/// Lazy stream of records from a `ReadTreeAt` request
///
/// The stream must be consumed to the end before the next request.
pub struct RemoteRecords<'a, R: Read, W: Write> {
    remote: &'a mut RemoteDestination<R, W>,
    done: bool,
}

impl<'a, R: Read, W: Write> Iterator for RemoteRecords<'a, R, W> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.remote.receive() {
            Ok(Response::Record(record)) => return Some(Ok(record)),
            Ok(Response::EndOfStream) => None,
            Ok(other) => Some(Err(unexpected(other))),
            Err(err) => Some(Err(err)),
        };
        self.done = true;
        item
    }
}
