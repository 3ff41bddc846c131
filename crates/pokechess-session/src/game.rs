//! One game of chess between two sides.
//!
//! [`GameSession`] owns the rule engine. Everything that changes the position
//! goes through it, so the board snapshot, captured pieces and outcome are
//! always derived from moves the engine accepted.

use crate::rules::{MoveRecord, MoveRequest, RuleEngine, StandardChess};
use pokechess_core::{Color, ForfeitReason, MoveMessage, Piece, PieceKind, PromotionPiece, Square, WireMessage};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Both sides play on this device; nothing goes on the wire.
    Casual,
    /// Online against a peer; only `local` moves from here.
    Staked { local: Color },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Checkmate,
    Stalemate,
    ThreefoldRepetition,
    InsufficientMaterial,
    /// Fifty-move rule.
    Draw,
    Resigned,
    OpponentResigned,
    TimeExpired,
    OpponentDisconnected,
    WalletDisconnected,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Checkmate => "Checkmate",
            EndReason::Stalemate => "Stalemate",
            EndReason::ThreefoldRepetition => "Threefold Repetition",
            EndReason::InsufficientMaterial => "Insufficient Material",
            EndReason::Draw => "Draw",
            EndReason::Resigned => "Resigned",
            EndReason::OpponentResigned => "Opponent Resigned",
            EndReason::TimeExpired => "Time Expired",
            EndReason::OpponentDisconnected => "Opponent Disconnected",
            EndReason::WalletDisconnected => "Wallet Disconnected",
        };
        f.write_str(s)
    }
}

/// Terminal result. `winner` is `None` for draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameOutcome {
    pub winner: Option<Color>,
    pub reason: EndReason,
}

impl GameOutcome {
    pub fn win(winner: Color, reason: EndReason) -> Self {
        Self {
            winner: Some(winner),
            reason,
        }
    }

    pub fn draw(reason: EndReason) -> Self {
        Self { winner: None, reason }
    }

    pub fn is_draw(&self) -> bool {
        self.winner.is_none()
    }
}

impl fmt::Display for GameOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.winner {
            Some(color) => write!(f, "{color} wins ({})", self.reason),
            None => write!(f, "draw ({})", self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveRejection {
    #[error("the game is over")]
    GameOver,
    #[error("not your turn")]
    NotYourTurn,
    #[error("illegal move {from}{to}")]
    Illegal { from: Square, to: Square },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMove {
    pub record: MoveRecord,
    /// What to send to the peer, in staked mode.
    pub outbound: Option<WireMessage>,
    pub outcome: Option<GameOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalMove {
    Applied(AppliedMove),
    /// A pawn reached the last rank; ask for a piece and call again.
    PromotionRequired { from: Square, to: Square },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resignation {
    pub outbound: Option<WireMessage>,
    pub outcome: GameOutcome,
}

pub struct GameSession<R = StandardChess> {
    engine: R,
    mode: SessionMode,
    last_move: Option<(Square, Square)>,
    /// Pieces each color has taken.
    captured_by_white: Vec<PieceKind>,
    captured_by_black: Vec<PieceKind>,
    outcome: Option<GameOutcome>,
}

impl GameSession<StandardChess> {
    pub fn new(mode: SessionMode) -> Self {
        Self::with_engine(StandardChess::new(), mode)
    }
}

impl<R: RuleEngine> GameSession<R> {
    pub fn with_engine(engine: R, mode: SessionMode) -> Self {
        Self {
            engine,
            mode,
            last_move: None,
            captured_by_white: Vec::new(),
            captured_by_black: Vec::new(),
            outcome: None,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn local_color(&self) -> Option<Color> {
        match self.mode {
            SessionMode::Casual => None,
            SessionMode::Staked { local } => Some(local),
        }
    }

    pub fn turn(&self) -> Color {
        self.engine.turn()
    }

    pub fn is_local_turn(&self) -> bool {
        match self.mode {
            SessionMode::Casual => true,
            SessionMode::Staked { local } => self.engine.turn() == local,
        }
    }

    pub fn board(&self) -> [Option<Piece>; 64] {
        self.engine.board()
    }

    pub fn piece_at(&self, square: Square) -> Option<Piece> {
        self.engine.piece_at(square)
    }

    pub fn fen(&self) -> String {
        self.engine.fen()
    }

    pub fn history(&self) -> &[MoveRecord] {
        self.engine.history()
    }

    pub fn last_move(&self) -> Option<(Square, Square)> {
        self.last_move
    }

    pub fn captured_by(&self, color: Color) -> &[PieceKind] {
        match color {
            Color::White => &self.captured_by_white,
            Color::Black => &self.captured_by_black,
        }
    }

    pub fn outcome(&self) -> Option<GameOutcome> {
        self.outcome
    }

    pub fn is_over(&self) -> bool {
        self.outcome.is_some()
    }

    /// Where the piece on `from` may go. Empty when it is not ours to move.
    pub fn legal_destinations(&self, from: Square) -> Vec<Square> {
        if self.is_over() || !self.is_local_turn() {
            return Vec::new();
        }
        self.engine.legal_destinations(from)
    }

    pub fn apply_local_move(
        &mut self,
        from: Square,
        to: Square,
        promotion: Option<PromotionPiece>,
    ) -> Result<LocalMove, MoveRejection> {
        if self.is_over() {
            return Err(MoveRejection::GameOver);
        }
        if !self.is_local_turn() {
            return Err(MoveRejection::NotYourTurn);
        }
        if promotion.is_none() && self.engine.requires_promotion(from, to) {
            return Ok(LocalMove::PromotionRequired { from, to });
        }
        let record = self
            .engine
            .apply(MoveRequest { from, to, promotion })
            .ok_or(MoveRejection::Illegal { from, to })?;
        let outcome = self.after_move(&record);
        let outbound = match self.mode {
            SessionMode::Staked { .. } => Some(WireMessage::Move(record.to_message())),
            SessionMode::Casual => None,
        };
        Ok(LocalMove::Applied(AppliedMove {
            record,
            outbound,
            outcome,
        }))
    }

    /// Apply the opponent's move. Rejected moves change nothing.
    pub fn apply_remote_move(&mut self, msg: &MoveMessage) -> Result<AppliedMove, MoveRejection> {
        if self.is_over() {
            return Err(MoveRejection::GameOver);
        }
        if let SessionMode::Staked { local } = self.mode
            && self.engine.turn() == local
        {
            warn!(from = %msg.from, to = %msg.to, "opponent moved out of turn");
            return Err(MoveRejection::NotYourTurn);
        }
        let Some(record) = self.engine.apply(MoveRequest::from(*msg)) else {
            warn!(from = %msg.from, to = %msg.to, "opponent sent an illegal move");
            return Err(MoveRejection::Illegal {
                from: msg.from,
                to: msg.to,
            });
        };
        let outcome = self.after_move(&record);
        Ok(AppliedMove {
            record,
            outbound: None,
            outcome,
        })
    }

    /// The local side gives up. In casual mode the side to move resigns.
    pub fn resign(&mut self) -> Result<Resignation, MoveRejection> {
        if self.is_over() {
            return Err(MoveRejection::GameOver);
        }
        let (loser, outbound) = match self.mode {
            SessionMode::Staked { local } => (local, Some(WireMessage::Resign { reason: None })),
            SessionMode::Casual => (self.engine.turn(), None),
        };
        let outcome = GameOutcome::win(loser.opponent(), EndReason::Resigned);
        self.outcome = Some(outcome);
        Ok(Resignation { outbound, outcome })
    }

    /// The opponent forfeited, by choice unless `reason` says otherwise.
    pub fn opponent_resigned(&mut self, reason: Option<ForfeitReason>) -> Option<GameOutcome> {
        let local = self.local_color()?;
        let reason = match reason {
            None => EndReason::OpponentResigned,
            Some(ForfeitReason::TimeExpired) => EndReason::TimeExpired,
            Some(ForfeitReason::WalletDisconnected) => EndReason::WalletDisconnected,
        };
        self.end(GameOutcome::win(local, reason))
    }

    /// End the game for a reason outside the board. Only the first terminal
    /// result sticks.
    pub fn end(&mut self, outcome: GameOutcome) -> Option<GameOutcome> {
        if self.is_over() {
            debug!(ignored = %outcome, "game already over");
            return None;
        }
        self.outcome = Some(outcome);
        Some(outcome)
    }

    fn after_move(&mut self, record: &MoveRecord) -> Option<GameOutcome> {
        self.last_move = Some((record.from, record.to));
        if let Some(kind) = record.captured {
            match record.color {
                Color::White => self.captured_by_white.push(kind),
                Color::Black => self.captured_by_black.push(kind),
            }
        }
        self.outcome = self.detect_outcome();
        self.outcome
    }

    fn detect_outcome(&self) -> Option<GameOutcome> {
        if self.engine.is_checkmate() {
            return Some(GameOutcome::win(self.engine.turn().opponent(), EndReason::Checkmate));
        }
        if !self.engine.is_draw() {
            return None;
        }
        let reason = if self.engine.is_stalemate() {
            EndReason::Stalemate
        } else if self.engine.is_threefold_repetition() {
            EndReason::ThreefoldRepetition
        } else if self.engine.is_insufficient_material() {
            EndReason::InsufficientMaterial
        } else {
            EndReason::Draw
        };
        Some(GameOutcome::draw(reason))
    }
}
