//! Runtime settings for the relay server
//!
//! All durations that drive the connection and replay state machines live
//! here so tests can shrink them to milliseconds. `main.rs` fills this from
//! command-line arguments; library users construct it directly.

use std::path::PathBuf;
use std::time::Duration;

/// Which merge strategy reconciles concurrent writer streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategyKind {
    /// Track one best stream, switch on divergence or stall. Cheap,
    /// reasonable for small writer counts.
    Follow,
    /// Require `desired_quorum` agreeing streams before publishing bytes.
    Quorum,
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
    /// How long to keep a replay open after its last writer disconnects.
    pub grace_period: Duration,
    /// Hard cap on a replay's total lifetime, for games that never end.
    pub forced_end_timeout: Duration,
    /// How far spectators lag behind the live merged stream.
    pub spectator_delay: Duration,
    /// How often the spectator position is recomputed.
    pub delay_interval: Duration,
    /// Streams that must agree before the quorum strategy publishes bytes.
    pub desired_quorum: usize,
    /// How long the follow strategy tolerates a stalled tracked stream.
    pub stall_period: Duration,
    /// Time allowed for reading a connection greeting and replay header.
    pub header_read_timeout: Duration,
    /// Strategy used to merge writer streams.
    pub merge_strategy: MergeStrategyKind,
    /// Root directory for persisted replay files.
    pub storage_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:15000".to_string(),
            grace_period: Duration::from_secs(30),
            forced_end_timeout: Duration::from_secs(5 * 60 * 60),
            spectator_delay: Duration::from_secs(300),
            delay_interval: Duration::from_secs(1),
            desired_quorum: 2,
            stall_period: Duration::from_secs(60),
            header_read_timeout: Duration::from_secs(60),
            merge_strategy: MergeStrategyKind::Quorum,
            storage_root: PathBuf::from("replays"),
        }
    }
}

impl Settings {
    /// Number of length samples the delayed-position history must retain:
    /// one per interval across the delay window, plus the slot being filled.
    pub fn delay_history_size(&self) -> usize {
        let delay = self.spectator_delay.as_secs_f64();
        let interval = self.delay_interval.as_secs_f64().max(1e-9);
        (delay / interval).ceil() as usize + 1
    }
}
