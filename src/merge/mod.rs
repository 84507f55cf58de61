//! Merge strategies: reconciling N writer streams into one canonical stream
//!
//! A merge strategy is the sole writer of the canonical (sink) stream. It
//! receives lifecycle callbacks from the [`Merger`](crate::merger::Merger)
//! as writer streams appear, produce header/data, and disconnect, and it
//! decides which bytes become canonical. Two policies are provided:
//!
//! - [`follow::FollowStrategy`] tracks a single best stream and switches
//!   on divergence or stall; cheap, fine for small writer counts.
//! - [`quorum::QuorumStrategy`] only publishes bytes that a configurable
//!   number of streams agree on, and resolves disagreement by re-grouping
//!   streams on their next byte.
//!
//! Both guarantee monotonic output: a byte written to the sink is never
//! taken back, so readers can stream it immediately.

pub mod follow;
pub mod quorum;

use crate::stream::{ReplayStream, StreamRef};

/// Handle for a writer stream inside a strategy. Assigned by the merger in
/// registration order, which doubles as the deterministic tie-break for
/// otherwise-equal candidates.
pub type StreamId = u64;

/// Policy deciding which writer bytes become canonical.
///
/// All callbacks run synchronously under the merger's strategy lock, so
/// implementations can maintain multi-step invariants without further
/// synchronization. Between callbacks the strategy must leave the sink in
/// a published-bytes-are-final state.
pub trait MergeStrategy: Send {
    /// A new writer stream joined. Called before any of its data events.
    fn stream_added(&mut self, id: StreamId, stream: StreamRef);

    /// The stream's replay header became available.
    fn new_header(&mut self, id: StreamId);

    /// The stream's data grew.
    fn new_data(&mut self, id: StreamId);

    /// The stream disconnected. Its data is final by this point.
    fn stream_removed(&mut self, id: StreamId);

    /// Periodic hook driven by the merger; default does nothing.
    fn check_stall(&mut self) {}

    /// Ends the sink. Called exactly once, after every stream has been
    /// removed.
    fn finalize(&mut self);

    /// The canonical output stream this strategy writes.
    fn sink(&self) -> StreamRef;
}

/// Cursor for at-most-once byte-range comparison between a candidate
/// stream and the sink.
///
/// Bytes are compared exactly once over the life of a candidate: each call
/// only inspects the overlap that has grown since the previous call, so
/// total comparison work is linear in stream length.
#[derive(Debug, Default, Clone)]
pub struct CompareCursor {
    compared: usize,
}

impl CompareCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes verified equal so far.
    pub fn compared(&self) -> usize {
        self.compared
    }

    /// Marks `[0, upto)` as verified without comparing, used when the
    /// candidate itself produced those sink bytes.
    pub fn skip_to(&mut self, upto: usize) {
        self.compared = self.compared.max(upto);
    }

    /// Compares the not-yet-compared overlap of `candidate` and `sink`,
    /// bounded by `limit`. Returns true if any byte differs.
    pub fn found_divergence(
        &mut self,
        candidate: &ReplayStream,
        sink: &ReplayStream,
        limit: usize,
    ) -> bool {
        let end = candidate.data_len().min(sink.data_len()).min(limit);
        if end <= self.compared {
            return false;
        }
        let fresh = candidate.data_range(self.compared, end);
        let diverged = sink.with_data(|sink_data| fresh[..] != sink_data[self.compared..end]);
        self.compared = end;
        diverged
    }
}
