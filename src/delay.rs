//! Time-delayed view of the canonical stream
//!
//! Spectators must not see replay bytes before a live broadcast would
//! reveal them: a player could otherwise open a spectator connection to
//! their own game and read the future. [`DelayedStream`] wraps the
//! canonical stream and only releases data up to where the stream stood
//! `delay` seconds ago.
//!
//! The implementation keeps one scalar per tick, not one per byte: every
//! `interval` the tracker task records the source length into a bounded
//! history and releases the oldest retained sample as the new visible
//! position. When the source ends, the final length is released
//! immediately; there is nothing left to hide.
//!
//! The header is not delayed. Merge strategies never go through this
//! layer at all; they read the source stream directly.

use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::format::ReplayHeader;
use crate::stream::StreamRef;

/// Bounded ring of length samples; the front is the released position.
#[derive(Debug)]
pub struct PositionHistory {
    samples: VecDeque<usize>,
    capacity: usize,
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Records the current source length and returns the position to
    /// release: the oldest sample still in the window.
    pub fn push(&mut self, length: usize) -> usize {
        self.samples.push_back(length);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        *self.samples.front().unwrap_or(&0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayState {
    position: usize,
    ended: bool,
}

/// Read-side wrapper releasing source data with a fixed time lag.
#[derive(Debug)]
pub struct DelayedStream {
    source: StreamRef,
    state_tx: watch::Sender<DelayState>,
}

impl DelayedStream {
    /// Wraps `source` and spawns the tracker task that advances the
    /// released position every `interval`.
    pub fn new(source: StreamRef, delay: Duration, interval: Duration) -> Arc<Self> {
        let capacity = (delay.as_secs_f64() / interval.as_secs_f64().max(1e-9)).ceil() as usize + 1;
        let (state_tx, _) = watch::channel(DelayState {
            position: 0,
            ended: false,
        });
        let delayed = Arc::new(Self { source, state_tx });

        let tracker = Arc::clone(&delayed);
        tokio::spawn(async move {
            let mut history = PositionHistory::new(capacity);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tracker.source.wait_for_ended() => break,
                    _ = ticker.tick() => {
                        let position = history.push(tracker.source.data_len());
                        tracker.release(position, false);
                    }
                }
            }
            // Source over: flush the true final length right away.
            let final_len = tracker.source.data_len();
            debug!("delayed stream flushing to final length {final_len}");
            tracker.release(final_len, true);
        });

        delayed
    }

    fn release(&self, position: usize, ended: bool) {
        self.state_tx.send_modify(|state| {
            // The released position never moves backwards.
            state.position = state.position.max(position);
            state.ended |= ended;
        });
    }

    /// Headers pass through undelayed; they reveal nothing about play.
    pub async fn wait_for_header(&self) -> Option<ReplayHeader> {
        self.source.wait_for_header().await
    }

    /// Like [`ReplayStream::wait_for_data`], but clipped to the released
    /// position. Returns an empty vec once the stream is over and fully
    /// drained.
    ///
    /// [`ReplayStream::wait_for_data`]: crate::stream::ReplayStream::wait_for_data
    pub async fn wait_for_data(&self, position: usize) -> Vec<u8> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state.position > position {
                return self.source.data_range(position, state.position);
            }
            if state.ended {
                return Vec::new();
            }
            if rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    /// True once the source has ended and the final length was released.
    pub fn ended(&self) -> bool {
        self.state_tx.borrow().ended
    }

    /// The undelayed source, for components allowed to see the future.
    pub fn future_data(&self) -> StreamRef {
        self.source.clone()
    }
}
