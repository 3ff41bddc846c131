//! Chess rules.
//!
//! [`RuleEngine`] is the seam between the session and whatever knows the
//! rules. [`StandardChess`] backs it with the `chess` crate and adds the
//! draw bookkeeping that crate leaves to its caller: repetition counts, the
//! halfmove clock and dead positions.

use pokechess_core::{Color, MoveMessage, Piece, PieceKind, PromotionPiece, Square};
use std::collections::HashMap;
use std::str::FromStr;

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// A move as requested by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PromotionPiece>,
}

impl From<MoveMessage> for MoveRequest {
    fn from(m: MoveMessage) -> Self {
        Self {
            from: m.from,
            to: m.to,
            promotion: m.promotion,
        }
    }
}

/// A move the engine accepted, with everything the UI and the wire need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRecord {
    pub color: Color,
    pub piece: PieceKind,
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PromotionPiece>,
    pub captured: Option<PieceKind>,
}

impl MoveRecord {
    pub fn to_message(&self) -> MoveMessage {
        MoveMessage {
            from: self.from,
            to: self.to,
            promotion: self.promotion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
}

pub trait RuleEngine {
    fn load_fen(&mut self, fen: &str) -> Result<(), RuleError>;
    fn fen(&self) -> String;
    fn turn(&self) -> Color;
    fn piece_at(&self, square: Square) -> Option<Piece>;
    fn legal_moves(&self) -> Vec<MoveRequest>;
    /// Applies the move if legal. Illegal moves leave the position untouched.
    fn apply(&mut self, request: MoveRequest) -> Option<MoveRecord>;
    fn history(&self) -> &[MoveRecord];

    fn is_checkmate(&self) -> bool;
    fn is_stalemate(&self) -> bool;
    fn is_threefold_repetition(&self) -> bool;
    fn is_insufficient_material(&self) -> bool;
    /// Any draw, including the fifty-move rule.
    fn is_draw(&self) -> bool;

    fn is_game_over(&self) -> bool {
        self.is_checkmate() || self.is_draw()
    }

    fn legal_destinations(&self, from: Square) -> Vec<Square> {
        let mut out: Vec<Square> = self
            .legal_moves()
            .into_iter()
            .filter(|m| m.from == from)
            .map(|m| m.to)
            .collect();
        out.dedup();
        out
    }

    /// Whether moving `from` to `to` is legal only with a promotion piece.
    fn requires_promotion(&self, from: Square, to: Square) -> bool {
        self.legal_moves()
            .iter()
            .any(|m| m.from == from && m.to == to && m.promotion.is_some())
    }

    /// Squares indexed by [`Square::index`].
    fn board(&self) -> [Option<Piece>; 64] {
        let mut board = [None; 64];
        for (i, slot) in board.iter_mut().enumerate() {
            *slot = Square::from_index(i).and_then(|sq| self.piece_at(sq));
        }
        board
    }
}

/// Standard chess on top of the `chess` crate.
#[derive(Debug, Clone)]
pub struct StandardChess {
    board: chess::Board,
    halfmove_clock: u32,
    fullmove: u32,
    repetitions: HashMap<u64, u32>,
    history: Vec<MoveRecord>,
}

impl Default for StandardChess {
    fn default() -> Self {
        let board = chess::Board::default();
        let mut repetitions = HashMap::new();
        repetitions.insert(board.get_hash(), 1);
        Self {
            board,
            halfmove_clock: 0,
            fullmove: 1,
            repetitions,
            history: Vec::new(),
        }
    }
}

impl StandardChess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fen(fen: &str) -> Result<Self, RuleError> {
        let mut engine = Self::default();
        engine.load_fen(fen)?;
        Ok(engine)
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }
}

fn to_chess_square(sq: Square) -> Option<chess::Square> {
    chess::Square::from_str(&sq.to_string()).ok()
}

fn from_chess_square(sq: chess::Square) -> Option<Square> {
    Square::new(sq.get_file().to_index() as u8, sq.get_rank().to_index() as u8)
}

fn from_chess_color(color: chess::Color) -> Color {
    match color {
        chess::Color::White => Color::White,
        chess::Color::Black => Color::Black,
    }
}

fn from_chess_piece(piece: chess::Piece) -> PieceKind {
    match piece {
        chess::Piece::Pawn => PieceKind::Pawn,
        chess::Piece::Knight => PieceKind::Knight,
        chess::Piece::Bishop => PieceKind::Bishop,
        chess::Piece::Rook => PieceKind::Rook,
        chess::Piece::Queen => PieceKind::Queen,
        chess::Piece::King => PieceKind::King,
    }
}

fn to_chess_promotion(piece: PromotionPiece) -> chess::Piece {
    match piece {
        PromotionPiece::Queen => chess::Piece::Queen,
        PromotionPiece::Rook => chess::Piece::Rook,
        PromotionPiece::Bishop => chess::Piece::Bishop,
        PromotionPiece::Knight => chess::Piece::Knight,
    }
}

impl RuleEngine for StandardChess {
    fn load_fen(&mut self, fen: &str) -> Result<(), RuleError> {
        let board = chess::Board::from_str(fen).map_err(|_| RuleError::InvalidFen(fen.to_string()))?;
        let mut fields = fen.split_whitespace().skip(4);
        let halfmove_clock = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let fullmove = fields.next().and_then(|f| f.parse().ok()).unwrap_or(1);
        self.board = board;
        self.halfmove_clock = halfmove_clock;
        self.fullmove = fullmove;
        self.repetitions.clear();
        self.repetitions.insert(board.get_hash(), 1);
        self.history.clear();
        Ok(())
    }

    fn fen(&self) -> String {
        let full = self.board.to_string();
        let placement: Vec<&str> = full.split_whitespace().take(4).collect();
        format!("{} {} {}", placement.join(" "), self.halfmove_clock, self.fullmove)
    }

    fn turn(&self) -> Color {
        from_chess_color(self.board.side_to_move())
    }

    fn piece_at(&self, square: Square) -> Option<Piece> {
        let sq = to_chess_square(square)?;
        let kind = self.board.piece_on(sq)?;
        let color = self.board.color_on(sq)?;
        Some(Piece::new(from_chess_piece(kind), from_chess_color(color)))
    }

    fn legal_moves(&self) -> Vec<MoveRequest> {
        chess::MoveGen::new_legal(&self.board)
            .filter_map(|mv| {
                Some(MoveRequest {
                    from: from_chess_square(mv.get_source())?,
                    to: from_chess_square(mv.get_dest())?,
                    promotion: mv
                        .get_promotion()
                        .and_then(|p| PromotionPiece::from_kind(from_chess_piece(p))),
                })
            })
            .collect()
    }

    fn apply(&mut self, request: MoveRequest) -> Option<MoveRecord> {
        let from = to_chess_square(request.from)?;
        let to = to_chess_square(request.to)?;
        let mv = chess::ChessMove::new(from, to, request.promotion.map(to_chess_promotion));
        if !chess::MoveGen::new_legal(&self.board).any(|legal| legal == mv) {
            return None;
        }
        let piece = from_chess_piece(self.board.piece_on(from)?);
        let color = from_chess_color(self.board.side_to_move());
        let captured = match self.board.piece_on(to) {
            Some(p) => Some(from_chess_piece(p)),
            // A pawn changing file onto an empty square took en passant.
            None if piece == PieceKind::Pawn && from.get_file() != to.get_file() => Some(PieceKind::Pawn),
            None => None,
        };

        self.board = self.board.make_move_new(mv);
        if piece == PieceKind::Pawn || captured.is_some() {
            self.halfmove_clock = 0;
        } else {
            self.halfmove_clock += 1;
        }
        if color == Color::Black {
            self.fullmove += 1;
        }
        *self.repetitions.entry(self.board.get_hash()).or_insert(0) += 1;

        let record = MoveRecord {
            color,
            piece,
            from: request.from,
            to: request.to,
            promotion: request.promotion,
            captured,
        };
        self.history.push(record);
        Some(record)
    }

    fn history(&self) -> &[MoveRecord] {
        &self.history
    }

    fn is_checkmate(&self) -> bool {
        self.board.status() == chess::BoardStatus::Checkmate
    }

    fn is_stalemate(&self) -> bool {
        self.board.status() == chess::BoardStatus::Stalemate
    }

    fn is_threefold_repetition(&self) -> bool {
        self.repetitions.get(&self.board.get_hash()).is_some_and(|&n| n >= 3)
    }

    fn is_insufficient_material(&self) -> bool {
        let mut knights = 0;
        let mut bishop_shades = Vec::new();
        for sq in (0..64).filter_map(Square::from_index) {
            let Some(piece) = self.piece_at(sq) else { continue };
            match piece.kind {
                PieceKind::King => {}
                PieceKind::Knight => knights += 1,
                PieceKind::Bishop => bishop_shades.push((sq.file() + sq.rank()) % 2),
                PieceKind::Pawn | PieceKind::Rook | PieceKind::Queen => return false,
            }
        }
        let minors = knights + bishop_shades.len();
        if minors <= 1 {
            return true;
        }
        knights == 0 && bishop_shades.windows(2).all(|w| w[0] == w[1])
    }

    fn is_draw(&self) -> bool {
        self.halfmove_clock >= 100
            || self.is_stalemate()
            || self.is_insufficient_material()
            || self.is_threefold_repetition()
    }
}
