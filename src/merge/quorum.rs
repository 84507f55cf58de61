//! Quorum merge strategy
//!
//! Publishes a byte to the sink only once the policy's quorum has agreed on
//! it. Every tracked stream carries a role:
//!
//! - **candidate** — not yet classified against the current quorum point
//! - **quorum** — member of the set whose agreed bytes feed the sink
//! - **stalemate candidate** — reported its next byte at a disagreement
//!   point, waiting for a new quorum to form around some byte value
//! - **diverged** — contradicted the sink, permanently out
//!
//! The strategy alternates between two phases. In the *quorum* phase the
//! member streams' common prefix is flushed to the sink, bounded by the
//! shortest member. When members disagree on the next byte (or all end),
//! the *stalemate* phase partitions the remaining streams by that byte:
//! the first group to reach the desired quorum size wins; once every
//! remaining stream has reported, the best-ranked group wins. Either way
//! the winning group is guaranteed one new byte of agreement, so each
//! phase transition strictly grows the sink and the machine cannot spin.
//!
//! The strategy starts in the stalemate phase with an empty sink; the
//! first quorum forms through ordinary stalemate resolution.

use log::{debug, info};
use std::collections::BTreeMap;

use super::{CompareCursor, MergeStrategy, StreamId};
use crate::stream::{ReplayStream, StreamRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Candidate,
    Quorum,
    Diverged,
    /// Tagged with the stream's byte at the disagreement point.
    StalemateCandidate(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Quorum,
    Stalemate,
}

#[derive(Debug)]
struct Tracked {
    stream: StreamRef,
    role: Role,
    cursor: CompareCursor,
    ended: bool,
}

/// Majority-agreement merge policy.
pub struct QuorumStrategy {
    sink: StreamRef,
    desired_quorum: usize,
    phase: Phase,
    /// Keyed by registration order; the key is the final tie-break.
    streams: BTreeMap<StreamId, Tracked>,
}

impl QuorumStrategy {
    pub fn new(desired_quorum: usize) -> Self {
        Self {
            sink: ReplayStream::new(),
            desired_quorum: desired_quorum.max(1),
            phase: Phase::Stalemate,
            streams: BTreeMap::new(),
        }
    }

    /// The sink length doubles as the quorum point: everything before it
    /// is agreed history, the byte at it is what stalemates argue about.
    fn quorum_point(&self) -> usize {
        self.sink.data_len()
    }

    /// Runs the at-most-once comparison for a candidate. On mismatch the
    /// stream is diverged for good. Returns true if it survived.
    fn verify_candidate(&mut self, id: StreamId) -> bool {
        let sink = self.sink.clone();
        let Some(tracked) = self.streams.get_mut(&id) else {
            return false;
        };
        if tracked
            .cursor
            .found_divergence(&tracked.stream, &sink, usize::MAX)
        {
            debug!("quorum: stream {id} diverged from sink");
            tracked.role = Role::Diverged;
            return false;
        }
        true
    }

    /// Stalemate-phase classification of a candidate: it either reports a
    /// next byte, gets discarded as a spent prefix, or keeps waiting.
    fn classify_candidate(&mut self, id: StreamId) {
        if !self.verify_candidate(id) {
            return;
        }
        let qp = self.quorum_point();
        let Some(tracked) = self.streams.get_mut(&id) else {
            return;
        };
        if tracked.role != Role::Candidate {
            return;
        }
        if tracked.cursor.compared() >= qp {
            if let Some(byte) = tracked.stream.byte_at(qp) {
                debug!("quorum: stream {id} reports byte {byte:#04x} at point {qp}");
                tracked.role = Role::StalemateCandidate(byte);
                return;
            }
        }
        if tracked.ended {
            // Ended at or before the quorum point with nothing to add.
            debug!("quorum: stream {id} ended as a spent prefix, discarding");
            self.streams.remove(&id);
        }
    }

    /// Quorum-phase engine: flushes the members' agreed common prefix,
    /// bounded by the shortest member, until someone has to be waited for
    /// or the members disagree.
    fn try_advance(&mut self) {
        loop {
            let qp = self.quorum_point();

            // Retire members that ended and were fully consumed; their
            // contribution is absorbed into sink history.
            let retired: Vec<StreamId> = self
                .streams
                .iter()
                .filter(|(_, t)| {
                    t.role == Role::Quorum && t.ended && t.stream.data_len() <= qp
                })
                .map(|(id, _)| *id)
                .collect();
            for id in retired {
                debug!("quorum: member {id} fully consumed, retiring");
                self.streams.remove(&id);
            }

            let members: Vec<StreamId> = self
                .streams
                .iter()
                .filter(|(_, t)| t.role == Role::Quorum)
                .map(|(id, _)| *id)
                .collect();
            if members.is_empty() {
                self.enter_stalemate();
                return;
            }

            // Advancement is bounded by the shortest member; a live member
            // still at the quorum point forces a wait.
            let limit = members
                .iter()
                .map(|id| self.streams[id].stream.data_len())
                .min()
                .unwrap_or(qp);
            if limit <= qp {
                return;
            }

            let first = self.streams[&members[0]].stream.data_range(qp, limit);
            let mut agreed = first.len();
            for id in &members[1..] {
                let other = self.streams[id].stream.data_range(qp, limit);
                let common = first
                    .iter()
                    .zip(other.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                agreed = agreed.min(common);
            }

            if agreed == 0 {
                self.enter_stalemate();
                return;
            }

            self.sink.feed_data(&first[..agreed]);
            for id in &members {
                if let Some(t) = self.streams.get_mut(id) {
                    t.cursor.skip_to(qp + agreed);
                }
            }
        }
    }

    /// Quorum members disagreed at the quorum point (or all were
    /// consumed): re-partition everyone by their next byte.
    fn enter_stalemate(&mut self) {
        self.phase = Phase::Stalemate;
        let qp = self.quorum_point();
        debug!("quorum: stalemate at point {qp}");

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let Some(tracked) = self.streams.get_mut(&id) else {
                continue;
            };
            match tracked.role {
                Role::Quorum => {
                    if let Some(byte) = tracked.stream.byte_at(qp) {
                        tracked.role = Role::StalemateCandidate(byte);
                    } else if tracked.ended {
                        self.streams.remove(&id);
                    } else {
                        // Verified to the point but silent: back to
                        // candidate until it produces the next byte.
                        tracked.role = Role::Candidate;
                        tracked.cursor.skip_to(qp);
                    }
                }
                Role::Candidate => self.classify_candidate(id),
                Role::Diverged | Role::StalemateCandidate(_) => {}
            }
        }
        self.try_resolve();
    }

    /// Promotes a byte-group to be the new quorum if the rules allow:
    /// immediately once a group reaches the desired size, or the
    /// best-ranked group once every remaining stream has reported.
    fn try_resolve(&mut self) {
        let mut groups: BTreeMap<u8, Vec<StreamId>> = BTreeMap::new();
        for (id, tracked) in &self.streams {
            if let Role::StalemateCandidate(byte) = tracked.role {
                groups.entry(byte).or_default().push(*id);
            }
        }
        if groups.is_empty() {
            return;
        }

        let full: Vec<u8> = groups
            .iter()
            .filter(|(_, members)| members.len() >= self.desired_quorum)
            .map(|(byte, _)| *byte)
            .collect();

        let winner = if !full.is_empty() {
            Some(self.best_group(&groups, &full))
        } else {
            let unreported = self
                .streams
                .values()
                .any(|t| t.role == Role::Candidate);
            if unreported {
                None
            } else {
                let all: Vec<u8> = groups.keys().copied().collect();
                Some(self.best_group(&groups, &all))
            }
        };

        if let Some(byte) = winner {
            self.promote(byte, &groups[&byte]);
        }
    }

    /// Ranks competing groups: larger group first, then the group with the
    /// most lookahead data, then the one holding the earliest-registered
    /// stream. Registration order makes the outcome deterministic when
    /// everything else ties.
    fn best_group(&self, groups: &BTreeMap<u8, Vec<StreamId>>, bytes: &[u8]) -> u8 {
        let rank = |byte: u8| {
            let members = &groups[&byte];
            let size = members.len();
            let lookahead = members
                .iter()
                .map(|id| self.streams[id].stream.data_len())
                .max()
                .unwrap_or(0);
            let earliest = members.iter().min().copied().unwrap_or(StreamId::MAX);
            (size, lookahead, std::cmp::Reverse(earliest))
        };
        bytes
            .iter()
            .copied()
            .max_by_key(|byte| rank(*byte))
            .expect("best_group called with no groups")
    }

    fn promote(&mut self, byte: u8, members: &[StreamId]) {
        info!(
            "quorum: promoting {} stream(s) agreeing on byte {byte:#04x} at point {}",
            members.len(),
            self.quorum_point()
        );
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let Some(tracked) = self.streams.get_mut(&id) else {
                continue;
            };
            if let Role::StalemateCandidate(b) = tracked.role {
                tracked.role = if b == byte && members.contains(&id) {
                    Role::Quorum
                } else {
                    Role::Diverged
                };
            }
        }
        self.phase = Phase::Quorum;
        // The winning group agrees on at least one byte, so this makes
        // strict progress before any new stalemate.
        self.try_advance();
    }
}

impl MergeStrategy for QuorumStrategy {
    fn stream_added(&mut self, id: StreamId, stream: StreamRef) {
        self.streams.insert(
            id,
            Tracked {
                stream,
                role: Role::Candidate,
                cursor: CompareCursor::new(),
                ended: false,
            },
        );
    }

    fn new_header(&mut self, id: StreamId) {
        if let Some(tracked) = self.streams.get(&id) {
            if let Some(header) = tracked.stream.header() {
                self.sink.set_header(header);
            }
        }
    }

    fn new_data(&mut self, id: StreamId) {
        let Some(role) = self.streams.get(&id).map(|t| t.role) else {
            return;
        };
        match (self.phase, role) {
            (Phase::Quorum, Role::Candidate) => {
                self.verify_candidate(id);
            }
            (Phase::Quorum, Role::Quorum) => self.try_advance(),
            (Phase::Stalemate, Role::Candidate) => {
                self.classify_candidate(id);
                self.try_resolve();
            }
            // Stalemate candidates already reported their byte; diverged
            // streams are out for good.
            _ => {}
        }
    }

    fn stream_removed(&mut self, id: StreamId) {
        let Some(tracked) = self.streams.get_mut(&id) else {
            return;
        };
        tracked.ended = true;
        let role = tracked.role;
        match (self.phase, role) {
            (_, Role::Diverged) => {
                self.streams.remove(&id);
            }
            (Phase::Quorum, Role::Quorum) => self.try_advance(),
            (Phase::Quorum, Role::Candidate) => {
                // Stays tracked; the next stalemate classifies it and can
                // still take its tie-break byte.
            }
            (Phase::Stalemate, Role::Candidate) => {
                self.classify_candidate(id);
                self.try_resolve();
            }
            (Phase::Stalemate, Role::StalemateCandidate(_)) => {
                // Already reported; its final bytes are consumed if its
                // group wins.
            }
            (Phase::Stalemate, Role::Quorum) | (Phase::Quorum, Role::StalemateCandidate(_)) => {
                unreachable!("role {role:?} cannot occur in phase {:?}", self.phase)
            }
        }
    }

    fn finalize(&mut self) {
        // Only legal once every stream has been removed; anything left
        // unclassified is a logic bug worth crashing on.
        assert!(
            self.phase == Phase::Stalemate,
            "finalize called while a quorum is still active"
        );
        assert!(
            self.streams.values().all(|t| t.role == Role::Diverged),
            "finalize called with unresolved streams"
        );
        info!(
            "quorum: finalizing sink with {} bytes",
            self.sink.data_len()
        );
        self.streams.clear();
        self.sink.finish();
    }

    fn sink(&self) -> StreamRef {
        self.sink.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_header, HeaderParser, HeaderProgress, ReplayHeader};
    use serde_json::json;

    fn header(version: &str) -> ReplayHeader {
        let bytes = encode_header(version, "replay/1", &json!({}));
        match HeaderParser::new().feed(&bytes).unwrap() {
            HeaderProgress::Done(h, _) => h,
            HeaderProgress::NeedMore => unreachable!(),
        }
    }

    /// Runs the full add/feed/remove cycle for a set of complete streams,
    /// feeding each stream's data in one chunk, round-robin, then removes
    /// and finalizes.
    fn merge_complete(desired_quorum: usize, inputs: &[&[u8]]) -> Vec<u8> {
        let mut strategy = QuorumStrategy::new(desired_quorum);
        let sink = strategy.sink();
        let streams: Vec<StreamRef> = inputs.iter().map(|_| ReplayStream::new()).collect();
        for (i, stream) in streams.iter().enumerate() {
            strategy.stream_added(i as StreamId, stream.clone());
        }
        for (i, (stream, input)) in streams.iter().zip(inputs).enumerate() {
            stream.feed_data(input);
            strategy.new_data(i as StreamId);
        }
        for (i, stream) in streams.iter().enumerate() {
            stream.finish();
            strategy.stream_removed(i as StreamId);
        }
        strategy.finalize();
        assert!(sink.ended());
        sink.data_from(0)
    }

    #[test]
    fn agreeing_pair_is_published_in_full() {
        let merged = merge_complete(2, &[b"Best friends", b"Best friends"]);
        assert_eq!(merged, b"Best friends");
    }

    #[test]
    fn diverging_pair_keeps_the_common_prefix() {
        let merged = merge_complete(2, &[b"Best friends", b"Best pals"]);
        assert!(merged.starts_with(b"Best "));
        // The longer stream has more lookahead and wins the tie-break.
        assert_eq!(merged, b"Best friends");
    }

    #[test]
    fn majority_outvotes_a_diverging_minority() {
        let merged = merge_complete(
            2,
            &[
                b"attack at dawn",
                b"attack at dawn",
                b"attack at dusk and keep going much longer",
            ],
        );
        assert_eq!(merged, b"attack at dawn");
    }

    #[test]
    fn equal_groups_resolve_by_lookahead_then_registration() {
        // Two groups of one; the longer stream wins.
        let merged = merge_complete(3, &[b"aaa", b"ab longer tail"]);
        assert_eq!(merged, b"ab longer tail");

        // Same lengths: the earlier-registered stream wins.
        let merged = merge_complete(3, &[b"axx", b"bxx"]);
        assert_eq!(merged, b"axx");
    }

    #[test]
    fn single_stream_header_survives_without_data() {
        let mut strategy = QuorumStrategy::new(2);
        let sink = strategy.sink();
        let stream = ReplayStream::new();

        strategy.stream_added(1, stream.clone());
        stream.set_header(header("1.0"));
        strategy.new_header(1);
        stream.finish();
        strategy.stream_removed(1);
        strategy.finalize();

        assert!(sink.ended());
        assert_eq!(sink.header().unwrap().game_version, "1.0");
        assert!(sink.data_from(0).is_empty());
    }

    #[test]
    fn single_stream_is_published_once_it_reports() {
        // With one writer the sole group of one wins every stalemate.
        let merged = merge_complete(2, &[b"lone wolf replay"]);
        assert_eq!(merged, b"lone wolf replay");
    }

    #[test]
    fn slow_member_gates_publication_until_it_catches_up() {
        let mut strategy = QuorumStrategy::new(2);
        let sink = strategy.sink();
        let fast = ReplayStream::new();
        let slow = ReplayStream::new();
        strategy.stream_added(1, fast.clone());
        strategy.stream_added(2, slow.clone());

        fast.feed_data(b"shared bytes, then some");
        strategy.new_data(1);
        // One reported stalemate candidate, one silent live candidate: no
        // quorum can form yet and nothing is published.
        assert_eq!(sink.data_len(), 0);

        slow.feed_data(b"shared");
        strategy.new_data(2);
        // Quorum of two formed on the first byte; publication is bounded
        // by the shorter member.
        assert_eq!(sink.data_from(0), b"shared");

        slow.feed_data(b" bytes, then some");
        strategy.new_data(2);
        assert_eq!(sink.data_from(0), b"shared bytes, then some");

        for (id, stream) in [(1, &fast), (2, &slow)] {
            stream.finish();
            strategy.stream_removed(id);
        }
        strategy.finalize();
        assert_eq!(sink.data_from(0), b"shared bytes, then some");
    }

    #[test]
    fn late_diverging_stream_is_rejected_against_history() {
        let mut strategy = QuorumStrategy::new(2);
        let sink = strategy.sink();
        let a = ReplayStream::new();
        let b = ReplayStream::new();
        strategy.stream_added(1, a.clone());
        strategy.stream_added(2, b.clone());

        a.feed_data(b"the true history");
        strategy.new_data(1);
        b.feed_data(b"the true history");
        strategy.new_data(2);
        assert_eq!(sink.data_from(0), b"the true history");

        // A third stream shows up disagreeing with settled bytes.
        let c = ReplayStream::new();
        strategy.stream_added(3, c.clone());
        c.feed_data(b"the fake history with lots of extra data");
        strategy.new_data(3);
        assert_eq!(sink.data_from(0), b"the true history");

        for (id, stream) in [(1, &a), (2, &b), (3, &c)] {
            stream.finish();
            strategy.stream_removed(id);
        }
        strategy.finalize();
        assert_eq!(sink.data_from(0), b"the true history");
    }

    #[test]
    fn removed_candidate_still_contributes_its_tie_break_byte() {
        let mut strategy = QuorumStrategy::new(2);
        let sink = strategy.sink();
        let a = ReplayStream::new();
        let b = ReplayStream::new();
        strategy.stream_added(1, a.clone());
        strategy.stream_added(2, b.clone());

        a.feed_data(b"x");
        strategy.new_data(1);
        // b ends carrying a matching byte it never announced via
        // new_data; removal classifies it and completes the quorum.
        b.feed_data(b"xy");
        b.finish();
        strategy.stream_removed(2);
        assert_eq!(sink.data_from(0), b"x");

        a.finish();
        strategy.stream_removed(1);
        strategy.finalize();
        assert_eq!(sink.data_from(0), b"xy");
    }

    #[test]
    fn finalize_terminates_for_scrambled_finite_streams() {
        // A mix of agreement, divergence and different lengths; the exact
        // winner matters less than termination and prefix consistency.
        let inputs: Vec<&[u8]> = vec![
            b"prefix-alpha-omega",
            b"prefix-alpha",
            b"prefix-beta-gamma-delta",
            b"prefix-alpha-omega-plus",
            b"",
        ];
        let merged = merge_complete(2, &inputs);
        assert!(merged.starts_with(b"prefix-"));
        assert!(inputs.iter().any(|input| input.starts_with(&merged[..])));
    }

    #[test]
    #[should_panic(expected = "finalize called")]
    fn finalize_with_live_streams_is_a_logic_bug() {
        let mut strategy = QuorumStrategy::new(2);
        let stream = ReplayStream::new();
        strategy.stream_added(1, stream.clone());
        stream.feed_data(b"still going");
        strategy.new_data(1);
        strategy.finalize();
    }
}
