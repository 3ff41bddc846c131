//! Connection transport seam.
//!
//! A transport is a thin adapter over a peer-to-peer primitive: it opens
//! connections by peer id, moves text frames and reports what happened as
//! [`TransportEvent`]s. Retry and buffering live in the supervisor.

use pokechess_core::PeerIdentity;
use std::fmt;
use std::future::Future;

/// Transport-local handle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connectivity signal of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The endpoint is registered under `id` and can accept connections.
    Ready { id: PeerIdentity },
    /// A remote peer opened a connection to us.
    Incoming { conn: ConnectionId, peer: PeerIdentity },
    Open { conn: ConnectionId },
    Data { conn: ConnectionId, frame: String },
    Close { conn: ConnectionId },
    /// `conn` is `None` for endpoint-level failures.
    Error {
        conn: Option<ConnectionId>,
        error: TransportError,
    },
    Ice { conn: ConnectionId, state: IceState },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unavailable")]
    PeerUnreachable(PeerIdentity),
    #[error("id {0} is already in use")]
    IdTaken(PeerIdentity),
    #[error("connection is not open")]
    NotOpen,
    #[error("network error: {0}")]
    Network(String),
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Errors after which retrying the same target is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::PeerUnreachable(_) | TransportError::IdTaken(_) | TransportError::Shutdown
        )
    }
}

/// A peer-to-peer endpoint.
///
/// All methods are non-blocking; outcomes of `open` and `close` are reported
/// later through [`ConnectionTransport::next_event`].
pub trait ConnectionTransport {
    fn local_id(&self) -> &PeerIdentity;

    fn open(&mut self, target: &PeerIdentity) -> Result<ConnectionId, TransportError>;

    fn send(&mut self, conn: ConnectionId, frame: &str) -> Result<(), TransportError>;

    /// Readiness as the channel sees it right now, independent of events.
    fn is_open(&self, conn: ConnectionId) -> bool;

    fn close(&mut self, conn: ConnectionId);

    /// Release the endpoint identity. Further calls fail with `Shutdown`.
    fn shutdown(&mut self);

    /// `None` once the endpoint is gone for good.
    fn next_event(&mut self) -> impl Future<Output = Option<TransportEvent>> + Send;
}

/// Creates one transport endpoint per match attempt.
pub trait TransportFactory {
    type Transport: ConnectionTransport;

    fn create(&mut self, id: PeerIdentity) -> Result<Self::Transport, TransportError>;
}
