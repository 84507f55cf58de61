//! Replay relay server library
//!
//! Receives live replay streams from the players of a running game,
//! merges the concurrent (and occasionally divergent) streams into one
//! canonical replay, serves it to spectators behind a fixed time delay,
//! and persists the finished replay to disk.
//!
//! The pieces compose bottom-up:
//! - [`connection`] wraps sockets and parses the greeting protocol
//! - [`format`] understands the replay header and tick commands
//! - [`stream`] is the shared append-only byte stream everything reads
//! - [`merge`] holds the strategies that reconcile writer streams
//! - [`merger`], [`delay`] and [`sender`] are the writer side, the
//!   spectator delay and the reader side of one replay
//! - [`replay`] ties those into a session, [`registry`] maps game ids to
//!   sessions and runs the accept loop
//! - [`bookkeeping`] persists finished replays

pub mod bookkeeping;
pub mod config;
pub mod connection;
pub mod delay;
pub mod error;
pub mod format;
pub mod merge;
pub mod merger;
pub mod registry;
pub mod replay;
pub mod sender;
pub mod stream;
