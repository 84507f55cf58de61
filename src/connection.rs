//! Client connection wrapper and greeting protocol
//!
//! Every connection opens with a NUL-terminated ASCII greeting selecting a
//! role: `P/<game id>/<game name>\0` to submit replay bytes, or
//! `G/<game id>/<game name>\0` to spectate. After the greeting, writers
//! send raw replay bytes until they close; readers receive header bytes
//! followed by the delayed merged stream.
//!
//! The wrapper translates socket failures and protocol violations into the
//! [`ConnectionError`] taxonomy so callers can tell routine garbage (port
//! scans, aborted lobbies) from real faults.

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ConnResult, ConnectionError};

/// Greeting length cap; anything longer without a terminator is garbage.
const MAX_GREETING_LEN: usize = 1024;
/// Read buffer for the replay byte pump.
const READ_CHUNK: usize = 64 * 1024;

/// Role requested by the connection greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// `P/` — submit replay bytes for merging.
    Write,
    /// `G/` — spectate the merged stream.
    Read,
}

/// Parsed connection greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub mode: ConnectionMode,
    pub game_id: u64,
    pub game_name: String,
}

/// Byte-stream wrapper over an accepted socket.
///
/// Generic over the transport so unit tests can drive it with
/// [`tokio::io::duplex`] pipes; the server uses [`TcpConnection`].
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    buf: Vec<u8>,
}

/// The production connection type.
pub type TcpConnection = Connection<TcpStream>;

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Reads and parses the greeting line.
    ///
    /// A connection that closes before its first byte is reported as
    /// [`ConnectionError::EmptyConnection`]; any protocol violation is
    /// [`ConnectionError::MalformedData`].
    pub async fn read_greeting(&mut self) -> ConnResult<Greeting> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self.stream.read(&mut byte).await?;
            if n == 0 {
                if line.is_empty() {
                    return Err(ConnectionError::EmptyConnection);
                }
                return Err(ConnectionError::MalformedData(
                    "connection closed mid-greeting".into(),
                ));
            }
            if byte[0] == 0 {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_GREETING_LEN {
                return Err(ConnectionError::MalformedData(
                    "greeting exceeds length cap without terminator".into(),
                ));
            }
        }
        let greeting = parse_greeting(&line)?;
        debug!(
            "greeting: mode={:?} game={} name={:?}",
            greeting.mode, greeting.game_id, greeting.game_name
        );
        Ok(greeting)
    }

    /// Reads the next chunk of replay bytes. `Ok(None)` means the peer
    /// closed its write half.
    pub async fn read_chunk(&mut self) -> ConnResult<Option<Vec<u8>>> {
        let n = self.stream.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> ConnResult<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Flushes and closes the write half, signalling end of stream.
    pub async fn shutdown(&mut self) -> ConnResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Parses a greeting line (terminator already stripped).
pub fn parse_greeting(line: &[u8]) -> ConnResult<Greeting> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ConnectionError::MalformedData("greeting is not valid UTF-8".into()))?;

    let mode = match text.get(..2) {
        Some("P/") => ConnectionMode::Write,
        Some("G/") => ConnectionMode::Read,
        _ => {
            return Err(ConnectionError::MalformedData(format!(
                "bad greeting prefix in {text:?}"
            )))
        }
    };

    let rest = &text[2..];
    let slash = rest.find('/').ok_or_else(|| {
        ConnectionError::MalformedData("greeting lacks a game id separator".into())
    })?;
    let (id_part, name_part) = rest.split_at(slash);
    let game_id: u64 = id_part.parse().map_err(|_| {
        ConnectionError::MalformedData(format!("game id {id_part:?} is not a non-negative integer"))
    })?;

    Ok(Greeting {
        mode,
        game_id,
        game_name: name_part[1..].to_string(),
    })
}
