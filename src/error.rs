//! Error taxonomy for connection handling and bookkeeping
//!
//! Connection errors are isolated per connection task: they terminate the
//! offending connection and never unwind into the merge state, the registry
//! or sibling connections. Bookkeeping errors are caught at the save
//! boundary and logged without disturbing replay state.

use thiserror::Error;

/// Result alias for connection-scoped operations.
pub type ConnResult<T> = std::result::Result<T, ConnectionError>;

/// Errors raised while handling a single client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Protocol violation: bad greeting prefix, missing terminator,
    /// non-UTF8 name, unparseable game id, header timeout or a rejected
    /// replay header. Common in the wild (lobby-only connections), so
    /// callers log these at debug level.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// The peer closed the connection before sending a single byte.
    /// Explicitly not treated as an error worth reporting; port scans and
    /// aborted lobbies produce these constantly.
    #[error("connection closed before any data arrived")]
    EmptyConnection,

    /// A structurally valid connection arrived after the target replay,
    /// merger or sender stopped accepting. Surfaced distinctly so callers
    /// can ignore it without alarming.
    #[error("no longer accepting connections: {0}")]
    CannotAccept(String),

    /// Underlying socket failure. Routed through the same cleanup paths
    /// as a natural disconnect.
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// True for conditions that are routine rather than noteworthy.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ConnectionError::MalformedData(_)
                | ConnectionError::EmptyConnection
                | ConnectionError::CannotAccept(_)
        )
    }
}

/// Errors from the metadata lookup and persistence collaborators.
///
/// A failed save loses the replay file but never crashes the server or
/// corrupts in-memory state; clients were already served by then.
#[derive(Debug, Error)]
pub enum BookkeepingError {
    #[error("game info lookup failed: {0}")]
    InfoLookup(String),

    #[error("replay file already exists: {0}")]
    AlreadySaved(String),

    #[error("replay serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay storage i/o error: {0}")]
    Io(#[from] std::io::Error),
}
