//! Persisting finished replays to disk
//!
//! A finished replay becomes a single file: one JSON metadata line, a
//! newline, then the gzip-compressed replay bytes (header plus merged
//! body). Files are sharded under the storage root by game id so a long
//! running deployment never piles millions of files into one directory.
//!
//! Everything here is synchronous `std::fs`; the registry runs saves on
//! the blocking thread pool. A failed save is logged and dropped, it never
//! disturbs live replays.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::BookkeepingError;
use crate::format::count_ticks;
use crate::replay::Replay;

/// Supplies supplementary game metadata for the persisted line.
///
/// Deployments with a lobby database implement this against it; the
/// default [`LocalInfoSource`] contributes nothing.
pub trait GameInfoSource: Send + Sync {
    fn game_info(&self, game_id: u64) -> Result<Value, BookkeepingError>;
}

/// Info source for standalone deployments without an external database.
pub struct LocalInfoSource;

impl GameInfoSource for LocalInfoSource {
    fn game_info(&self, _game_id: u64) -> Result<Value, BookkeepingError> {
        Ok(Value::Null)
    }
}

/// The JSON line written ahead of the compressed replay bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMetadata {
    pub game_id: u64,
    pub game_name: String,
    /// False when the replay was cut off before the game ended.
    pub complete: bool,
    /// Game clock ticks covered by the merged body.
    pub ticks: u32,
    pub game_version: Option<String>,
    pub replay_version: Option<String>,
    pub map_name: Option<String>,
    pub host: Option<String>,
    /// Unix seconds when the replay session opened.
    pub started_at: u64,
    /// Unix seconds when the file was written.
    pub saved_at: u64,
    /// Whatever the configured [`GameInfoSource`] contributed.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

/// Writes finished replays under a storage root.
pub struct ReplaySaver {
    root: PathBuf,
    info_source: Box<dyn GameInfoSource>,
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ReplaySaver {
    pub fn new(root: PathBuf, info_source: Box<dyn GameInfoSource>) -> Self {
        Self { root, info_source }
    }

    /// Sharded path for a game id: the id is zero-padded to ten digits and
    /// the first four digit pairs become directories, so ids cluster in
    /// groups of 100 per leaf directory.
    pub fn replay_path(&self, game_id: u64) -> PathBuf {
        let padded = format!("{game_id:010}");
        let mut path = self.root.clone();
        for pair in [&padded[0..2], &padded[2..4], &padded[4..6], &padded[6..8]] {
            path.push(pair);
        }
        path.push(format!("{padded}.replay"));
        path
    }

    /// Persists a finished replay. Refuses to overwrite an existing file.
    pub fn save(&self, replay: &Replay) -> Result<PathBuf, BookkeepingError> {
        let canonical = replay.canonical();
        let header = canonical.header();
        let body = canonical.data_from(0);

        let metadata = ReplayMetadata {
            game_id: replay.id(),
            game_name: replay.game_name().to_string(),
            complete: replay.is_complete(),
            ticks: count_ticks(&body),
            game_version: header.as_ref().map(|h| h.game_version.clone()),
            replay_version: header.as_ref().map(|h| h.replay_version.clone()),
            map_name: header
                .as_ref()
                .and_then(|h| h.map_name().map(str::to_string)),
            host: header.as_ref().and_then(|h| h.host().map(str::to_string)),
            started_at: unix_seconds(replay.started_at()),
            saved_at: unix_seconds(SystemTime::now()),
            extra: self.info_source.game_info(replay.id())?,
        };

        let path = self.replay_path(replay.id());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    BookkeepingError::AlreadySaved(path.display().to_string())
                } else {
                    BookkeepingError::Io(e)
                }
            })?;
        let mut out = BufWriter::new(file);

        serde_json::to_writer(&mut out, &metadata)?;
        out.write_all(b"\n")?;

        let mut encoder = GzEncoder::new(out, Compression::default());
        if let Some(header) = &header {
            encoder.write_all(&header.raw)?;
        }
        encoder.write_all(&body)?;
        encoder.finish()?.flush()?;

        info!(
            "saved replay {} ({} body bytes, {} ticks, complete={}) to {}",
            metadata.game_id,
            body.len(),
            metadata.ticks,
            metadata.complete,
            path.display()
        );
        Ok(path)
    }
}

/// Reads a persisted replay file back into its metadata line and the
/// decompressed replay bytes (header plus body).
pub fn load_replay(path: &Path) -> Result<(ReplayMetadata, Vec<u8>), BookkeepingError> {
    let raw = fs::read(path)?;
    let newline = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| BookkeepingError::InfoLookup("file has no metadata line".into()))?;
    let metadata: ReplayMetadata = serde_json::from_slice(&raw[..newline])?;
    let mut bytes = Vec::new();
    GzDecoder::new(&raw[newline + 1..]).read_to_end(&mut bytes)?;
    Ok((metadata, bytes))
}
