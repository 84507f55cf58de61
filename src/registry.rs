//! Replay registry and the TCP accept loop
//!
//! [`Replays`] maps game ids to live [`Replay`] sessions. A writer greeting
//! creates the session on demand; a reader greeting requires one to exist
//! already. Each session removes itself from the map when it ends and is
//! then handed to the saver on the blocking pool, so the map only ever
//! holds live replays.
//!
//! [`Server`] owns the listener: accept, read the greeting under the
//! header timeout, route to the session, log the outcome. One misbehaving
//! client can only ever take down its own connection task.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::{TcpListener, TcpStream};

use crate::bookkeeping::ReplaySaver;
use crate::config::Settings;
use crate::connection::{Connection, ConnectionMode, TcpConnection};
use crate::error::{ConnResult, ConnectionError};
use crate::replay::Replay;

/// Live replay sessions keyed by game id.
pub struct Replays {
    settings: Settings,
    saver: Arc<ReplaySaver>,
    map: Mutex<HashMap<u64, Arc<Replay>>>,
    me: Weak<Self>,
}

impl Replays {
    pub fn new(settings: Settings, saver: ReplaySaver) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            saver: Arc::new(saver),
            map: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Session for a writer: joins the existing one or creates it.
    fn writer_session(&self, game_id: u64, game_name: &str) -> Arc<Replay> {
        let mut map = self.map.lock().unwrap();
        if let Some(replay) = map.get(&game_id) {
            return Arc::clone(replay);
        }
        info!("creating replay session for game {game_id} ({game_name:?})");
        let replay = Replay::new(game_id, game_name.to_string(), &self.settings);
        map.insert(game_id, Arc::clone(&replay));

        // Session lifecycle: wait for the natural end, drop it from the
        // map, then persist on the blocking pool.
        let registry = self.me.clone();
        let session = Arc::clone(&replay);
        tokio::spawn(async move {
            session.wait_ended().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.map.lock().unwrap().remove(&game_id);
            let saver = Arc::clone(&registry.saver);
            let result = tokio::task::spawn_blocking(move || saver.save(&session)).await;
            match result {
                Ok(Ok(path)) => debug!("replay {game_id} persisted to {}", path.display()),
                Ok(Err(e)) => error!("failed to persist replay {game_id}: {e}"),
                Err(e) => error!("replay {game_id} save task panicked: {e}"),
            }
        });

        replay
    }

    /// Session for a reader: must already exist.
    fn reader_session(&self, game_id: u64) -> ConnResult<Arc<Replay>> {
        self.map
            .lock()
            .unwrap()
            .get(&game_id)
            .cloned()
            .ok_or_else(|| {
                ConnectionError::CannotAccept(format!("no live replay for game {game_id}"))
            })
    }

    /// Force-ends every live session; used on server shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Replay>> = self.map.lock().unwrap().values().cloned().collect();
        info!("closing {} live replay sessions", sessions.len());
        for session in sessions {
            session.close();
        }
    }

    /// Greets the connection and drives it against the right session.
    pub async fn handle_connection(&self, conn: &mut TcpConnection) -> ConnResult<()> {
        let greeting =
            tokio::time::timeout(self.settings.header_read_timeout, conn.read_greeting())
                .await
                .map_err(|_| {
                    ConnectionError::MalformedData("timed out reading greeting".into())
                })??;

        let replay = match greeting.mode {
            ConnectionMode::Write => self.writer_session(greeting.game_id, &greeting.game_name),
            ConnectionMode::Read => self.reader_session(greeting.game_id)?,
        };
        replay.handle_connection(greeting.mode, conn).await
    }
}

/// TCP front end: accepts connections and spawns one task per client.
pub struct Server {
    listener: TcpListener,
    replays: Arc<Replays>,
}

impl Server {
    /// Binds the listener from `settings.listen_addr`.
    pub async fn bind(settings: Settings, saver: ReplaySaver) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&settings.listen_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            replays: Replays::new(settings, saver),
        })
    }

    /// Actual bound address; tests bind port 0 and read it back.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn replays(&self) -> Arc<Replays> {
        Arc::clone(&self.replays)
    }

    /// Accept loop; runs until the task is cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!("accepted connection from {peer}");
            let replays = Arc::clone(&self.replays);
            tokio::spawn(async move {
                Self::serve(replays, socket, peer).await;
            });
        }
    }

    async fn serve(replays: Arc<Replays>, socket: TcpStream, peer: std::net::SocketAddr) {
        let mut conn = Connection::new(socket);
        match replays.handle_connection(&mut conn).await {
            Ok(()) => debug!("connection from {peer} finished"),
            Err(e) if e.is_expected() => debug!("connection from {peer} dropped: {e}"),
            Err(e) => warn!("connection from {peer} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeping::LocalInfoSource;
    use crate::config::MergeStrategyKind;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_settings() -> Settings {
        Settings {
            listen_addr: "127.0.0.1:0".into(),
            grace_period: Duration::from_millis(50),
            spectator_delay: Duration::from_millis(20),
            delay_interval: Duration::from_millis(5),
            merge_strategy: MergeStrategyKind::Follow,
            storage_root: std::env::temp_dir().join(format!(
                "replay-relay-registry-{}",
                std::process::id()
            )),
            ..Settings::default()
        }
    }

    fn test_saver(root: PathBuf) -> ReplaySaver {
        ReplaySaver::new(root, Box::new(LocalInfoSource))
    }

    async fn start_server(settings: Settings) -> (std::net::SocketAddr, Arc<Replays>) {
        let saver = test_saver(settings.storage_root.clone());
        let server = Server::bind(settings, saver).await.unwrap();
        let addr = server.local_addr().unwrap();
        let replays = server.replays();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, replays)
    }

    #[tokio::test]
    async fn reader_for_unknown_game_is_dropped() {
        let (addr, replays) = start_server(test_settings()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"G/999/nobody home\0").await.unwrap();
        // The server refuses and closes; the read returns EOF.
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(replays.is_empty());
    }

    #[tokio::test]
    async fn writer_creates_a_session_and_it_expires() {
        let (addr, replays) = start_server(test_settings()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"P/31/short game\0").await.unwrap();
        socket
            .write_all(&crate::format::encode_header(
                "1.0",
                "replay/1",
                &serde_json::json!({}),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replays.len(), 1);

        socket.shutdown().await.unwrap();
        drop(socket);
        // Session outlives the writer by the grace period, then expires.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(replays.is_empty());
    }

    #[tokio::test]
    async fn second_writer_joins_the_same_session() {
        let (addr, replays) = start_server(test_settings()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"P/32/shared\0").await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"P/32/shared\0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replays.len(), 1);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn close_all_force_ends_sessions() {
        let mut settings = test_settings();
        settings.grace_period = Duration::from_secs(3600);
        let (addr, replays) = start_server(settings).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"P/33/to be ended\0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replays.len(), 1);

        replays.close_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(replays.is_empty());
    }
}
