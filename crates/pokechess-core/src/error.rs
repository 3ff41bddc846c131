//! User-facing failure taxonomy of a match attempt.

/// Failures a user may see while setting up or playing a match.
///
/// Transport and handshake failures travel as state transitions and events,
/// escrow failures as rejected calls carrying a displayable message. Running
/// out of time is a game outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    /// Room code not found or the peer cannot be reached.
    #[error("Peer unreachable: {0}")]
    TransportUnavailable(String),
    /// The other side did not answer in time.
    #[error("Connection timed out")]
    HandshakeTimeout,
    /// Nobody hosts the requested room.
    #[error("Match not found. Check the room code.")]
    MatchNotFound,
    /// The opponent sent a move that is illegal in the current position.
    #[error("Opponent sent an illegal move: {0}")]
    InvalidRemoteMove(String),
    /// Wallet or escrow program rejected a call.
    #[error("{0}")]
    EscrowCallFailed(String),
    /// The opponent left mid-match.
    #[error("Opponent disconnected")]
    PeerDisconnected,
}

impl MatchError {
    /// Whether the user should be offered a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            MatchError::InvalidRemoteMove(_) | MatchError::PeerDisconnected
        )
    }
}
