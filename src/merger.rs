//! Writer-side lifecycle: accepting streams and driving the merge strategy
//!
//! The [`Merger`] owns a merge strategy and feeds it events from writer
//! connections. A [`StreamLifetime`] tracks how many writers are attached
//! and runs the grace period: when the last writer disconnects, a
//! cancellable timer starts; a new writer cancels it, and when it fires
//! the replay permanently stops accepting writers and the strategy is
//! finalized exactly once.
//!
//! Force-closing (explicit shutdown or the forced replay timeout) is just
//! an early grace expiry plus a broadcast that makes every connection pump
//! bail out of its read loop, so forced and natural disconnects share one
//! cleanup path.

use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::Connection;
use crate::error::{ConnResult, ConnectionError};
use crate::format::{HeaderParser, HeaderProgress};
use crate::merge::{MergeStrategy, StreamId};
use crate::stream::{ReplayStream, StreamRef};

/// Counter of attached writer streams plus the grace-period timer.
///
/// Invariant: the timer is running exactly when the count is zero and the
/// lifetime has not ended. Firing the timer is permanent; no writer is
/// admitted afterwards.
pub struct StreamLifetime {
    inner: Mutex<LifetimeInner>,
    ended_tx: watch::Sender<bool>,
    me: Weak<Self>,
}

struct LifetimeInner {
    count: usize,
    grace: Duration,
    timer: Option<JoinHandle<()>>,
}

impl StreamLifetime {
    pub fn new(grace: Duration) -> Arc<Self> {
        let (ended_tx, _) = watch::channel(false);
        let lifetime = Arc::new_cyclic(|me| Self {
            inner: Mutex::new(LifetimeInner {
                count: 0,
                grace,
                timer: None,
            }),
            ended_tx,
            me: me.clone(),
        });
        // A replay with no writers yet is already in its grace window.
        lifetime.arm_timer();
        lifetime
    }

    /// Registers a writer. Returns false if the lifetime already ended.
    /// Joining and expiry are linearized under one lock, so a writer can
    /// never slip in while the timer is declaring the lifetime over.
    pub fn stream_joined(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if *self.ended_tx.borrow() {
            return false;
        }
        inner.count += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        true
    }

    /// Deregisters a writer; the last one out arms the grace timer.
    pub fn stream_left(&self) {
        let arm = {
            let mut inner = self.inner.lock().unwrap();
            inner.count = inner.count.saturating_sub(1);
            inner.count == 0 && !*self.ended_tx.borrow()
        };
        if arm {
            self.arm_timer();
        }
    }

    /// Disables the grace period: if no writer is attached the lifetime
    /// ends now, otherwise it ends the moment the count reaches zero.
    pub fn expire_now(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.grace = Duration::ZERO;
        if inner.count == 0 {
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            let _ = self.ended_tx.send(true);
        }
    }

    pub fn ended(&self) -> bool {
        *self.ended_tx.borrow()
    }

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

    fn arm_timer(&self) {
        let mut inner = self.inner.lock().unwrap();
        if *self.ended_tx.borrow() {
            return;
        }
        if inner.grace.is_zero() {
            inner.timer = None;
            let _ = self.ended_tx.send(true);
            return;
        }
        let grace = inner.grace;
        let Some(lifetime) = self.me.upgrade() else {
            return;
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            lifetime.fire_if_empty();
        });
        if let Some(old) = inner.timer.replace(timer) {
            old.abort();
        }
    }

    /// Timer body: a writer that re-joined after the sleep started keeps
    /// the lifetime alive.
    fn fire_if_empty(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.count > 0 {
            return;
        }
        inner.timer = None;
        let _ = self.ended_tx.send(true);
    }
}

/// Accepts writer connections and feeds their streams into the strategy.
pub struct Merger {
    strategy: Mutex<Box<dyn MergeStrategy>>,
    lifetime: Arc<StreamLifetime>,
    canonical: StreamRef,
    next_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
    header_timeout: Duration,
}

impl Merger {
    /// Wraps a strategy and spawns the supervisor task that drives the
    /// periodic stall check and performs the single finalize call.
    pub fn new(
        strategy: Box<dyn MergeStrategy>,
        grace: Duration,
        stall_period: Duration,
        header_timeout: Duration,
    ) -> Arc<Self> {
        let canonical = strategy.sink();
        let (closed_tx, _) = watch::channel(false);
        let merger = Arc::new(Self {
            strategy: Mutex::new(strategy),
            lifetime: StreamLifetime::new(grace),
            canonical,
            next_id: AtomicU64::new(1),
            closed_tx,
            header_timeout,
        });

        let supervisor = Arc::clone(&merger);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stall_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = supervisor.lifetime.wait_ended() => break,
                    _ = ticker.tick() => {
                        supervisor.strategy.lock().unwrap().check_stall();
                    }
                }
            }
            supervisor.strategy.lock().unwrap().finalize();
            info!(
                "merger finalized, canonical stream has {} bytes",
                supervisor.canonical.data_len()
            );
        });

        merger
    }

    /// The canonical stream the strategy writes.
    pub fn canonical(&self) -> StreamRef {
        self.canonical.clone()
    }

    pub fn accepting(&self) -> bool {
        !self.lifetime.ended()
    }

    /// Resolves once the strategy has finalized the canonical stream.
    pub async fn wait_ended(&self) {
        self.canonical.wait_for_ended().await;
    }

    /// Disables the grace period and force-closes every writer pump.
    pub fn close(&self) {
        debug!("merger closing, forcing writer pumps to stop");
        let _ = self.closed_tx.send(true);
        self.lifetime.expire_now();
    }

    /// Drives one writer connection to completion: register, read header,
    /// pump data, deregister. All exits — clean EOF, socket error, forced
    /// close — go through the same deregistration path.
    pub async fn handle_connection<S>(&self, conn: &mut Connection<S>) -> ConnResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.lifetime.stream_joined() {
            return Err(ConnectionError::CannotAccept(
                "replay no longer accepts writers".into(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = ReplayStream::new();
        self.strategy
            .lock()
            .unwrap()
            .stream_added(id, stream.clone());
        debug!("writer stream {id} attached");

        let result = self.pump(conn, id, &stream).await;

        stream.finish();
        self.strategy.lock().unwrap().stream_removed(id);
        self.lifetime.stream_left();
        debug!("writer stream {id} detached");
        result
    }

    async fn pump<S>(
        &self,
        conn: &mut Connection<S>,
        id: StreamId,
        stream: &StreamRef,
    ) -> ConnResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut closed_rx = self.closed_tx.subscribe();

        // Header phase: bounded by the header timeout, interruptible by a
        // forced close.
        let header = tokio::time::timeout(self.header_timeout, async {
            let mut parser = HeaderParser::new();
            loop {
                if *closed_rx.borrow() {
                    return Ok(None);
                }
                tokio::select! {
                    chunk = conn.read_chunk() => match chunk? {
                        None => {
                            return Err(ConnectionError::MalformedData(
                                "connection closed before replay header completed".into(),
                            ))
                        }
                        Some(bytes) => match parser
                            .feed(&bytes)
                            .map_err(|e| ConnectionError::MalformedData(e.to_string()))?
                        {
                            HeaderProgress::NeedMore => continue,
                            HeaderProgress::Done(header, leftover) => {
                                return Ok(Some((header, leftover)))
                            }
                        },
                    },
                    _ = closed_rx.changed() => continue,
                }
            }
        })
        .await
        .map_err(|_| ConnectionError::MalformedData("timed out reading replay header".into()))??;

        let Some((header, leftover)) = header else {
            return Ok(());
        };
        stream.set_header(header);
        self.strategy.lock().unwrap().new_header(id);
        if !leftover.is_empty() {
            stream.feed_data(&leftover);
            self.strategy.lock().unwrap().new_data(id);
        }

        // Data phase: append chunks until EOF or forced close.
        loop {
            if *closed_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                chunk = conn.read_chunk() => match chunk? {
                    None => return Ok(()),
                    Some(bytes) => {
                        stream.feed_data(&bytes);
                        self.strategy.lock().unwrap().new_data(id);
                    }
                },
                _ = closed_rx.changed() => continue,
            }
        }
    }
}
