//! Replay binary format: header parsing and tick counting
//!
//! The relay treats replay bytes as opaque except for two things: the
//! header that prefixes every stream (needed so spectators can be greeted
//! with it, and so merge strategies compare only body bytes) and the
//! tick-advance commands in the body (needed for persisted metadata).
//!
//! Header layout:
//! - game version, NUL-terminated UTF-8
//! - replay format version, NUL-terminated UTF-8
//! - u32 little-endian metadata length, then that many bytes of JSON
//!   (map, mods, players, seed)
//!
//! The body is a sequence of commands, each `[op: u8][len: u16 LE][payload]`
//! where `op` 0x00 advances the game clock by a u32 LE number of ticks.

use serde_json::Value;
use thiserror::Error;

/// Longest accepted NUL-terminated version string.
const MAX_VERSION_LEN: usize = 4096;
/// Longest accepted JSON metadata blob.
const MAX_INFO_LEN: usize = 16 * 1024 * 1024;
/// Command op that advances the game clock.
const OP_ADVANCE: u8 = 0x00;

/// Raised when replay bytes cannot be a valid header.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("version string is not valid UTF-8")]
    BadVersionString,
    #[error("version string exceeds {MAX_VERSION_LEN} bytes without terminator")]
    VersionTooLong,
    #[error("metadata blob of {0} bytes exceeds the {MAX_INFO_LEN} byte cap")]
    InfoTooLong(usize),
    #[error("metadata blob is not valid JSON: {0}")]
    BadInfo(#[from] serde_json::Error),
}

/// Parsed replay header plus the exact bytes it came from.
///
/// `raw` is what gets replayed to spectators and written to disk; the
/// parsed fields feed the persisted metadata line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayHeader {
    pub raw: Vec<u8>,
    pub game_version: String,
    pub replay_version: String,
    pub info: Value,
}

impl ReplayHeader {
    /// Map name from the metadata blob, if present.
    pub fn map_name(&self) -> Option<&str> {
        self.info.get("map").and_then(Value::as_str)
    }

    /// Host login from the metadata blob, if present.
    pub fn host(&self) -> Option<&str> {
        self.info.get("host").and_then(Value::as_str)
    }
}

/// Incremental header parser: feed bytes until a full header is available.
///
/// Buffers everything fed so far; once the header parses, any surplus
/// bytes are returned to the caller as the first chunk of body data.
#[derive(Debug, Default)]
pub struct HeaderParser {
    buf: Vec<u8>,
}

/// Outcome of feeding bytes to a [`HeaderParser`].
#[derive(Debug)]
pub enum HeaderProgress {
    /// Not enough bytes yet; feed more.
    NeedMore,
    /// Header complete. Carries the leftover bytes past the header.
    Done(ReplayHeader, Vec<u8>),
}

impl HeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered so far (header prefix under construction).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends `bytes` and attempts to complete the header.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<HeaderProgress, FormatError> {
        self.buf.extend_from_slice(bytes);
        match try_parse(&self.buf)? {
            None => Ok(HeaderProgress::NeedMore),
            Some(body_offset) => {
                let header = finish_parse(&self.buf[..body_offset])?;
                let leftover = self.buf[body_offset..].to_vec();
                Ok(HeaderProgress::Done(header, leftover))
            }
        }
    }
}

/// Returns the body offset if `buf` contains a complete header.
fn try_parse(buf: &[u8]) -> Result<Option<usize>, FormatError> {
    let mut pos = 0;
    for _ in 0..2 {
        match scan_nul(&buf[pos..])? {
            None => return Ok(None),
            Some(end) => pos += end + 1,
        }
    }
    if buf.len() < pos + 4 {
        return Ok(None);
    }
    let info_len =
        u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
    if info_len > MAX_INFO_LEN {
        return Err(FormatError::InfoTooLong(info_len));
    }
    pos += 4;
    if buf.len() < pos + info_len {
        return Ok(None);
    }
    Ok(Some(pos + info_len))
}

/// Parses a buffer already known to hold exactly one complete header.
fn finish_parse(raw: &[u8]) -> Result<ReplayHeader, FormatError> {
    let game_end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let game_version = utf8(&raw[..game_end])?;
    let rest = &raw[game_end + 1..];
    let replay_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let replay_version = utf8(&rest[..replay_end])?;
    let info_bytes = &rest[replay_end + 1 + 4..];
    let info: Value = serde_json::from_slice(info_bytes)?;
    Ok(ReplayHeader {
        raw: raw.to_vec(),
        game_version,
        replay_version,
        info,
    })
}

fn scan_nul(buf: &[u8]) -> Result<Option<usize>, FormatError> {
    match buf.iter().take(MAX_VERSION_LEN + 1).position(|&b| b == 0) {
        Some(i) => Ok(Some(i)),
        None if buf.len() > MAX_VERSION_LEN => Err(FormatError::VersionTooLong),
        None => Ok(None),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, FormatError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::BadVersionString)
}

/// Total ticks advanced over a command stream.
///
/// Tolerates a truncated trailing command; crashed hosts routinely cut a
/// stream mid-frame and the prefix is still worth persisting.
pub fn count_ticks(body: &[u8]) -> u32 {
    let mut ticks: u32 = 0;
    let mut pos = 0;
    while pos + 3 <= body.len() {
        let op = body[pos];
        let len = u16::from_le_bytes([body[pos + 1], body[pos + 2]]) as usize;
        if pos + 3 + len > body.len() {
            break;
        }
        if op == OP_ADVANCE && len >= 4 {
            let delta = u32::from_le_bytes([
                body[pos + 3],
                body[pos + 4],
                body[pos + 5],
                body[pos + 6],
            ]);
            ticks = ticks.saturating_add(delta);
        }
        pos += 3 + len;
    }
    ticks
}

/// Builds valid header bytes, used by tests and the demo client.
pub fn encode_header(game_version: &str, replay_version: &str, info: &Value) -> Vec<u8> {
    let info_bytes = serde_json::to_vec(info).unwrap_or_else(|_| b"{}".to_vec());
    let mut out = Vec::new();
    out.extend_from_slice(game_version.as_bytes());
    out.push(0);
    out.extend_from_slice(replay_version.as_bytes());
    out.push(0);
    out.extend_from_slice(&(info_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&info_bytes);
    out
}

/// Builds one body command, used by tests and the demo client.
pub fn encode_command(op: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(op);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
