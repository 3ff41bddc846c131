//! Core types for PokeChess staked matches.
//!
//! This crate provides the protocol primitives both peers agree on: identities,
//! the wire envelope, board vocabulary and stake bookkeeping. Connection
//! handling and game logic live in `pokechess-session`.

mod board;
mod error;
mod identity;
mod message;
mod stake;

pub use board::{Color, Piece, PieceKind, PromotionPiece, Square, SquareParseError};
pub use error::MatchError;
pub use identity::{IdentityParseError, PeerIdentity, RoomCode, WalletAddress};
pub use message::{ForfeitReason, MoveMessage, WireError, WireMessage};
pub use stake::{
    BPS_DENOMINATOR, LAMPORTS_PER_SOL, MAX_STAKE_SOL, MIN_STAKE_SOL, MatchStakeInfo, MatchStatus,
    PLATFORM_FEE_BPS, RewardBreakdown, StakeError, StakeLimits, lamports_to_sol, sol_to_lamports,
};

use serde::{Deserialize, Serialize};

/// Connection lifecycle state of a supervised peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport identity allocated.
    #[default]
    Idle,
    /// Registered and waiting for an inbound connection.
    Waiting,
    /// Outbound or inbound connection is being established.
    Connecting,
    /// Data channel is usable.
    Open,
    /// Connection dropped, an automatic retry may be pending.
    Reconnecting,
    /// Connection ended and will not recover on its own.
    Closed,
}

impl ConnectionState {
    /// Whether a data channel is currently usable.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Whether the supervisor is trying to reach a peer.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Waiting | ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
