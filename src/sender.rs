//! Reader-side fan-out: streaming the delayed replay to spectators
//!
//! Mirrors the merger's lifecycle on the read side: a reader count, a
//! stop-accepting flag, and one pump loop per spectator connection that
//! writes the header followed by delayed data until the stream is over or
//! the peer goes away. A peer that disappears mid-stream is routine and
//! aborts only its own pump.

use log::debug;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::connection::Connection;
use crate::delay::DelayedStream;
use crate::error::{ConnResult, ConnectionError};

struct SenderState {
    readers: usize,
    accepting: bool,
}

/// Streams the delayed canonical replay to any number of spectators.
pub struct Sender {
    delayed: Arc<DelayedStream>,
    state: Mutex<SenderState>,
    closed_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl Sender {
    pub fn new(delayed: Arc<DelayedStream>) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            delayed,
            state: Mutex::new(SenderState {
                readers: 0,
                accepting: true,
            }),
            closed_tx,
            done_tx,
        })
    }

    /// Refuses further readers. With none attached the sender is done
    /// immediately; otherwise it reports done when the last one leaves.
    pub fn stop_accepting(&self) {
        let done = {
            let mut state = self.state.lock().unwrap();
            state.accepting = false;
            state.readers == 0
        };
        if done {
            let _ = self.done_tx.send(true);
        }
    }

    /// Force-closes every reader pump and stops accepting.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
        self.stop_accepting();
    }

    pub fn accepting(&self) -> bool {
        self.state.lock().unwrap().accepting
    }

    /// Resolves once accepting has stopped and the last reader is gone.
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serves one spectator: header first, then delayed data to the end.
    pub async fn handle_connection<S>(&self, conn: &mut Connection<S>) -> ConnResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        {
            let mut state = self.state.lock().unwrap();
            if !state.accepting {
                return Err(ConnectionError::CannotAccept(
                    "replay no longer accepts readers".into(),
                ));
            }
            state.readers += 1;
        }

        let result = self.pump(conn).await;

        let done = {
            let mut state = self.state.lock().unwrap();
            state.readers -= 1;
            !state.accepting && state.readers == 0
        };
        if done {
            let _ = self.done_tx.send(true);
        }
        result
    }

    async fn pump<S>(&self, conn: &mut Connection<S>) -> ConnResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut closed_rx = self.closed_tx.subscribe();

        let header = tokio::select! {
            header = self.delayed.wait_for_header() => header,
            _ = closed_rx.changed() => return Ok(()),
        };
        let Some(header) = header else {
            // The merged stream ended without ever producing a header;
            // there is nothing meaningful to serve.
            return Err(ConnectionError::MalformedData(
                "replay ended without a header".into(),
            ));
        };
        if let Err(e) = conn.write_all(&header.raw).await {
            debug!("reader dropped during header: {e}");
            return Ok(());
        }

        let mut position = 0usize;
        loop {
            if *closed_rx.borrow() {
                return Ok(());
            }
            let chunk = tokio::select! {
                chunk = self.delayed.wait_for_data(position) => chunk,
                _ = closed_rx.changed() => continue,
            };
            if chunk.is_empty() {
                // Delayed stream over and fully drained.
                let _ = conn.shutdown().await;
                return Ok(());
            }
            if let Err(e) = conn.write_all(&chunk).await {
                // Peer went away mid-stream; normal for spectators.
                debug!("reader dropped at position {position}: {e}");
                return Ok(());
            }
            position += chunk.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode_header;
    use crate::stream::ReplayStream;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn delayed_pair() -> (crate::stream::StreamRef, Arc<DelayedStream>) {
        let source = ReplayStream::new();
        let delayed = DelayedStream::new(
            source.clone(),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        (source, delayed)
    }

    fn feed_header(source: &ReplayStream) -> Vec<u8> {
        let raw = encode_header("1.0", "replay/1", &json!({}));
        let mut parser = crate::format::HeaderParser::new();
        match parser.feed(&raw).unwrap() {
            crate::format::HeaderProgress::Done(header, _) => {
                source.set_header(header);
            }
            crate::format::HeaderProgress::NeedMore => unreachable!(),
        }
        raw
    }

    #[tokio::test]
    async fn reader_receives_header_then_all_data() {
        let (source, delayed) = delayed_pair();
        let sender = Sender::new(delayed);

        let (server, mut client) = tokio::io::duplex(4096);
        let pump = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut conn = Connection::new(server);
                sender.handle_connection(&mut conn).await
            })
        };

        let header_raw = feed_header(&source);
        source.feed_data(b"every last byte");
        tokio::time::sleep(Duration::from_millis(30)).await;
        source.finish();

        pump.await.unwrap().unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut expected = header_raw;
        expected.extend_from_slice(b"every last byte");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn headerless_end_is_malformed() {
        let (source, delayed) = delayed_pair();
        let sender = Sender::new(delayed);
        source.finish();

        let (server, _client) = tokio::io::duplex(64);
        let mut conn = Connection::new(server);
        assert!(matches!(
            sender.handle_connection(&mut conn).await,
            Err(ConnectionError::MalformedData(_))
        ));
    }

    #[tokio::test]
    async fn readers_are_refused_after_stop_accepting() {
        let (_source, delayed) = delayed_pair();
        let sender = Sender::new(delayed);
        sender.stop_accepting();
        // With no readers attached the sender is immediately done.
        sender.wait_done().await;

        let (server, _client) = tokio::io::duplex(64);
        let mut conn = Connection::new(server);
        assert!(matches!(
            sender.handle_connection(&mut conn).await,
            Err(ConnectionError::CannotAccept(_))
        ));
    }

    #[tokio::test]
    async fn done_waits_for_the_last_reader() {
        let (source, delayed) = delayed_pair();
        let sender = Sender::new(delayed);

        let (server, mut client) = tokio::io::duplex(4096);
        let pump = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut conn = Connection::new(server);
                sender.handle_connection(&mut conn).await
            })
        };
        feed_header(&source);
        tokio::time::sleep(Duration::from_millis(20)).await;

        sender.stop_accepting();
        assert!(!*sender.done_tx.borrow());

        source.feed_data(b"tail");
        source.finish();
        pump.await.unwrap().unwrap();
        sender.wait_done().await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.ends_with(b"tail"));
    }

    #[tokio::test]
    async fn close_aborts_attached_readers() {
        let (source, delayed) = delayed_pair();
        let sender = Sender::new(delayed);

        let (server, _client) = tokio::io::duplex(4096);
        let pump = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut conn = Connection::new(server);
                sender.handle_connection(&mut conn).await
            })
        };
        feed_header(&source);
        tokio::time::sleep(Duration::from_millis(20)).await;

        sender.close();
        pump.await.unwrap().unwrap();
        sender.wait_done().await;
    }
}
