//! Follow-stream merge strategy
//!
//! Tracks a single "best" writer stream and copies its bytes straight into
//! the sink. All other streams stay candidates until they are caught
//! diverging from the sink, at which point they are dropped for good. When
//! the tracked stream disconnects or stalls, the lowest-numbered candidate
//! that agrees with the sink and is strictly ahead of it takes over.
//!
//! The sink always equals some maximal input stream. It is not necessarily
//! the most widely agreed-on one: a majority that disconnects early loses
//! to a minority that stays connected with a matching prefix.

use log::{debug, info};
use std::collections::BTreeMap;

use super::{CompareCursor, MergeStrategy, StreamId};
use crate::stream::{ReplayStream, StreamRef};

#[derive(Debug)]
struct Candidate {
    stream: StreamRef,
    cursor: CompareCursor,
}

/// Greedy single-tracked-stream merge policy.
pub struct FollowStrategy {
    sink: StreamRef,
    tracked: Option<StreamId>,
    /// Streams not yet known to diverge, in registration order.
    candidates: BTreeMap<StreamId, Candidate>,
    /// Sink length at the previous stall check.
    stall_watermark: usize,
}

impl FollowStrategy {
    pub fn new() -> Self {
        Self {
            sink: ReplayStream::new(),
            tracked: None,
            candidates: BTreeMap::new(),
            stall_watermark: 0,
        }
    }

    /// Drops the candidate if its fresh bytes disagree with the sink.
    /// Returns true if it survived.
    fn verify(&mut self, id: StreamId) -> bool {
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return false;
        };
        if candidate
            .cursor
            .found_divergence(&candidate.stream, &self.sink, usize::MAX)
        {
            debug!("follow: stream {id} diverged from sink, dropping");
            self.candidates.remove(&id);
            if self.tracked == Some(id) {
                self.tracked = None;
            }
            return false;
        }
        true
    }

    /// Copies everything the tracked stream holds beyond the sink's length
    /// into the sink. Safe by construction: the tracked stream is verified
    /// equal to the sink up to the sink's length.
    fn flush_tracked(&mut self) {
        let Some(id) = self.tracked else { return };
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        let sink_len = self.sink.data_len();
        let fresh = candidate.stream.data_from(sink_len);
        if !fresh.is_empty() {
            self.sink.feed_data(&fresh);
            candidate.cursor.skip_to(self.sink.data_len());
        }
    }

    /// Promotes the first candidate that agrees with the sink and is
    /// strictly ahead of it. Registration order breaks ties.
    fn try_track(&mut self) {
        if self.tracked.is_some() {
            return;
        }
        let ids: Vec<StreamId> = self.candidates.keys().copied().collect();
        for id in ids {
            let sink_len = self.sink.data_len();
            let ahead = self
                .candidates
                .get(&id)
                .map(|c| c.stream.data_len() > sink_len)
                .unwrap_or(false);
            if !ahead || !self.verify(id) {
                continue;
            }
            debug!("follow: now tracking stream {id}");
            self.tracked = Some(id);
            self.flush_tracked();
            return;
        }
    }
}

impl Default for FollowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeStrategy for FollowStrategy {
    fn stream_added(&mut self, id: StreamId, stream: StreamRef) {
        self.candidates.insert(
            id,
            Candidate {
                stream,
                cursor: CompareCursor::new(),
            },
        );
    }

    fn new_header(&mut self, id: StreamId) {
        if let Some(candidate) = self.candidates.get(&id) {
            if let Some(header) = candidate.stream.header() {
                self.sink.set_header(header);
            }
        }
    }

    fn new_data(&mut self, id: StreamId) {
        if !self.verify(id) {
            self.try_track();
            return;
        }
        if self.tracked == Some(id) {
            self.flush_tracked();
        } else if self.tracked.is_none() {
            self.try_track();
        }
    }

    fn stream_removed(&mut self, id: StreamId) {
        self.candidates.remove(&id);
        if self.tracked == Some(id) {
            debug!("follow: tracked stream {id} ended");
            self.tracked = None;
            self.try_track();
        }
    }

    fn check_stall(&mut self) {
        let sink_len = self.sink.data_len();
        if self.tracked.is_some() && sink_len == self.stall_watermark {
            let stalled = self.tracked.take();
            debug!("follow: tracked stream {stalled:?} stalled, re-electing");
            self.try_track();
        }
        self.stall_watermark = sink_len;
    }

    fn finalize(&mut self) {
        info!(
            "follow: finalizing sink with {} bytes from {} surviving streams",
            self.sink.data_len(),
            self.candidates.len()
        );
        self.tracked = None;
        self.candidates.clear();
        self.sink.finish();
    }

    fn sink(&self) -> StreamRef {
        self.sink.clone()
    }
}
