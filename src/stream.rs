//! Append-only replay stream with header slot and event waiting
//!
//! [`ReplayStream`] is the shared buffer every other component is built on:
//! connection readers append into one, merge strategies read many and write
//! one canonical sink, the delay layer and senders read from that. The
//! contract is strict:
//!
//! - data only grows, bytes are never rewritten
//! - the header is set at most once
//! - once `finish` is called the header and length are frozen and every
//!   pending wait resolves
//!
//! Waiting uses [`tokio::sync::Notify`] with the enable-before-check
//! pattern: the `Notified` future is created before the state is inspected,
//! so an append racing with the check cannot be missed.

use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::format::ReplayHeader;

/// Shared handle to a [`ReplayStream`].
pub type StreamRef = Arc<ReplayStream>;

#[derive(Debug, Default)]
struct StreamState {
    header: Option<ReplayHeader>,
    data: Vec<u8>,
    ended: bool,
}

/// Append-only byte stream with a set-once header.
///
/// Producer side (`set_header`, `feed_data`, `finish`) is synchronous and
/// owned by exactly one component; consumers use the `wait_for_*` methods.
#[derive(Debug, Default)]
pub struct ReplayStream {
    state: Mutex<StreamState>,
    notify: Notify,
}

impl ReplayStream {
    pub fn new() -> StreamRef {
        Arc::new(Self::default())
    }

    /// Sets the header. A second call is ignored; the first header sticks.
    pub fn set_header(&self, header: ReplayHeader) {
        {
            let mut state = self.state.lock().unwrap();
            if state.ended || state.header.is_some() {
                return;
            }
            state.header = Some(header);
        }
        self.notify.notify_waiters();
    }

    /// Appends bytes. Ignored after `finish`.
    pub fn feed_data(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.ended {
                return;
            }
            state.data.extend_from_slice(bytes);
        }
        self.notify.notify_waiters();
    }

    /// Marks the stream complete. Idempotent; wakes all waiters.
    pub fn finish(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        self.notify.notify_waiters();
    }

    pub fn ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    pub fn header(&self) -> Option<ReplayHeader> {
        self.state.lock().unwrap().header.clone()
    }

    /// Current data length. Non-decreasing over the stream's life.
    pub fn data_len(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }

    /// Copy of `data[from..]`, clamped to the current length.
    pub fn data_from(&self, from: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.data.get(from..).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Copy of `data[from..to]`, clamped to the current length.
    pub fn data_range(&self, from: usize, to: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let to = to.min(state.data.len());
        state.data.get(from..to).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn byte_at(&self, pos: usize) -> Option<u8> {
        self.state.lock().unwrap().data.get(pos).copied()
    }

    /// Runs `f` against the raw data without copying. Used by the merge
    /// strategies' divergence comparisons; `f` must not block.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state.data)
    }

    /// Resolves once the header is set or the stream ends.
    /// Returns `None` only for a stream that ended without a header.
    pub async fn wait_for_header(&self) -> Option<ReplayHeader> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if let Some(header) = &state.header {
                    return Some(header.clone());
                }
                if state.ended {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Resolves with `data[position..]` once the stream grows past
    /// `position`, or with an empty vec once it ends with nothing new.
    pub async fn wait_for_data(&self, position: usize) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if state.data.len() > position {
                    return state.data[position..].to_vec();
                }
                if state.ended {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }

    /// Resolves once `finish` has been called.
    pub async fn wait_for_ended(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state.lock().unwrap().ended {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode_header;
    use crate::format::{HeaderParser, HeaderProgress};
    use serde_json::json;
    use std::time::Duration;

    fn test_header() -> ReplayHeader {
        let bytes = encode_header("1.0", "replay/1", &json!({"map": "m"}));
        let mut parser = HeaderParser::new();
        match parser.feed(&bytes).unwrap() {
            HeaderProgress::Done(header, _) => header,
            HeaderProgress::NeedMore => unreachable!(),
        }
    }

    #[test]
    fn data_length_is_non_decreasing_and_prefix_preserving() {
        let stream = ReplayStream::new();
        let mut seen = Vec::new();
        for chunk in [&b"Best"[..], b" ", b"friends"] {
            let before = stream.data_from(0);
            stream.feed_data(chunk);
            let after = stream.data_from(0);
            assert!(after.len() >= before.len());
            assert_eq!(&after[..before.len()], &before[..]);
            seen = after;
        }
        assert_eq!(seen, b"Best friends");
    }

    #[test]
    fn header_is_set_once() {
        let stream = ReplayStream::new();
        let first = test_header();
        stream.set_header(first.clone());

        let mut second = test_header();
        second.game_version = "9.9".into();
        stream.set_header(second);

        assert_eq!(stream.header().unwrap().game_version, first.game_version);
    }

    #[test]
    fn finish_freezes_the_stream() {
        let stream = ReplayStream::new();
        stream.feed_data(b"abc");
        stream.finish();
        stream.feed_data(b"def");
        stream.set_header(test_header());
        assert_eq!(stream.data_len(), 3);
        assert!(stream.header().is_none());
        assert!(stream.ended());
        // finish is idempotent
        stream.finish();
        assert!(stream.ended());
    }

    #[tokio::test]
    async fn wait_for_data_resolves_immediately_when_behind() {
        let stream = ReplayStream::new();
        stream.feed_data(b"hello world");
        assert_eq!(stream.wait_for_data(6).await, b"world");
        assert_eq!(stream.wait_for_data(0).await, b"hello world");
    }

    #[tokio::test]
    async fn wait_for_data_sees_concurrent_append() {
        let stream = ReplayStream::new();
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.wait_for_data(0).await })
        };
        // Give the waiter a chance to suspend first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.feed_data(b"late bytes");
        assert_eq!(reader.await.unwrap(), b"late bytes");
    }

    #[tokio::test]
    async fn waiters_resolve_on_end_without_data() {
        let stream = ReplayStream::new();
        let header_wait = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.wait_for_header().await })
        };
        let data_wait = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.wait_for_data(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.finish();
        assert!(header_wait.await.unwrap().is_none());
        assert!(data_wait.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_for_ended_follows_finish() {
        let stream = ReplayStream::new();
        let waiter = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.wait_for_ended().await })
        };
        stream.feed_data(b"data does not end the stream");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        stream.finish();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn many_appends_are_all_observed() {
        let stream = ReplayStream::new();
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move {
                let mut collected = Vec::new();
                loop {
                    let chunk = stream.wait_for_data(collected.len()).await;
                    if chunk.is_empty() {
                        return collected;
                    }
                    collected.extend_from_slice(&chunk);
                }
            })
        };
        let mut expected = Vec::new();
        for i in 0..100u32 {
            let chunk = i.to_le_bytes();
            expected.extend_from_slice(&chunk);
            stream.feed_data(&chunk);
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        stream.finish();
        assert_eq!(reader.await.unwrap(), expected);
    }
}
