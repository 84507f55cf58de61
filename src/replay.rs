//! One live replay: merged writer side, delayed reader side, lifecycle
//!
//! A [`Replay`] ties a [`Merger`], a [`DelayedStream`] and a [`Sender`]
//! together and supervises their combined lifetime: it ends when the
//! writer side has finalized the canonical stream AND the last spectator
//! has drained the delayed view. A hard timeout force-closes replays of
//! games that never end; a force-closed replay is marked incomplete so the
//! persisted artifact records that its tail may be missing.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::config::{MergeStrategyKind, Settings};
use crate::connection::{Connection, ConnectionMode};
use crate::delay::DelayedStream;
use crate::error::ConnResult;
use crate::merge::follow::FollowStrategy;
use crate::merge::quorum::QuorumStrategy;
use crate::merge::MergeStrategy;
use crate::merger::Merger;
use crate::sender::Sender;
use crate::stream::StreamRef;

/// A single game's replay session.
pub struct Replay {
    id: u64,
    game_name: String,
    started_at: SystemTime,
    merger: Arc<Merger>,
    sender: Arc<Sender>,
    /// Set when the replay was cut off rather than ending naturally.
    forced: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

fn build_strategy(settings: &Settings) -> Box<dyn MergeStrategy> {
    match settings.merge_strategy {
        MergeStrategyKind::Follow => Box::new(FollowStrategy::new()),
        MergeStrategyKind::Quorum => Box::new(QuorumStrategy::new(settings.desired_quorum)),
    }
}

impl Replay {
    /// Creates the replay and spawns its lifecycle supervisor.
    pub fn new(id: u64, game_name: String, settings: &Settings) -> Arc<Self> {
        let merger = Merger::new(
            build_strategy(settings),
            settings.grace_period,
            settings.stall_period,
            settings.header_read_timeout,
        );
        let delayed = DelayedStream::new(
            merger.canonical(),
            settings.spectator_delay,
            settings.delay_interval,
        );
        let sender = Sender::new(delayed);
        let (ended_tx, _) = watch::channel(false);
        let replay = Arc::new(Self {
            id,
            game_name,
            started_at: SystemTime::now(),
            merger,
            sender,
            forced: AtomicBool::new(false),
            ended_tx,
        });

        let supervisor = Arc::clone(&replay);
        let forced_end = settings.forced_end_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = supervisor.merger.wait_ended() => {}
                _ = tokio::time::sleep(forced_end) => {
                    warn!(
                        "replay {} exceeded its lifetime cap, forcing an end",
                        supervisor.id
                    );
                    supervisor.forced.store(true, Ordering::SeqCst);
                    supervisor.merger.close();
                    supervisor.merger.wait_ended().await;
                }
            }
            // The canonical stream is final; the delayed view flushes on its
            // own. Drain remaining spectators, then declare the replay over.
            supervisor.sender.stop_accepting();
            supervisor.sender.wait_done().await;
            info!("replay {} ended", supervisor.id);
            let _ = supervisor.ended_tx.send(true);
        });

        debug!("replay {id} created");
        replay
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// The finalized merged stream. Meaningful for persistence only after
    /// [`wait_ended`](Self::wait_ended) resolves.
    pub fn canonical(&self) -> StreamRef {
        self.merger.canonical()
    }

    /// False when the replay was cut off by the lifetime cap or an
    /// explicit shutdown.
    pub fn is_complete(&self) -> bool {
        !self.forced.load(Ordering::SeqCst)
    }

    /// Routes an already-greeted connection to the writer or reader side.
    pub async fn handle_connection<S>(
        &self,
        mode: ConnectionMode,
        conn: &mut Connection<S>,
    ) -> ConnResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match mode {
            ConnectionMode::Write => self.merger.handle_connection(conn).await,
            ConnectionMode::Read => self.sender.handle_connection(conn).await,
        }
    }

    /// Force-ends both sides; the replay is marked incomplete.
    pub fn close(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.merger.close();
        self.sender.close();
    }

    /// Resolves once writers are merged and all spectators have drained.
    pub async fn wait_ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
