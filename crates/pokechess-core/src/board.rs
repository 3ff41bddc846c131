//! Board vocabulary shared by the wire format and the rule engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => f.write_str("White"),
            Color::Black => f.write_str("Black"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }
}

/// Piece a pawn may promote to. Serialized as its lowercase letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromotionPiece {
    #[serde(rename = "q")]
    Queen,
    #[serde(rename = "r")]
    Rook,
    #[serde(rename = "b")]
    Bishop,
    #[serde(rename = "n")]
    Knight,
}

impl PromotionPiece {
    pub const ALL: [PromotionPiece; 4] = [
        PromotionPiece::Queen,
        PromotionPiece::Rook,
        PromotionPiece::Bishop,
        PromotionPiece::Knight,
    ];

    pub fn kind(self) -> PieceKind {
        match self {
            PromotionPiece::Queen => PieceKind::Queen,
            PromotionPiece::Rook => PieceKind::Rook,
            PromotionPiece::Bishop => PieceKind::Bishop,
            PromotionPiece::Knight => PieceKind::Knight,
        }
    }

    pub fn from_kind(kind: PieceKind) -> Option<Self> {
        match kind {
            PieceKind::Queen => Some(PromotionPiece::Queen),
            PieceKind::Rook => Some(PromotionPiece::Rook),
            PieceKind::Bishop => Some(PromotionPiece::Bishop),
            PieceKind::Knight => Some(PromotionPiece::Knight),
            PieceKind::Pawn | PieceKind::King => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            PromotionPiece::Queen => 'q',
            PromotionPiece::Rook => 'r',
            PromotionPiece::Bishop => 'b',
            PromotionPiece::Knight => 'n',
        }
    }
}

/// A board square, `a1` through `h8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Square {
    file: u8,
    rank: u8,
}

impl Square {
    /// File and rank are zero based (`a1` is `(0, 0)`).
    pub fn new(file: u8, rank: u8) -> Option<Self> {
        (file < 8 && rank < 8).then_some(Self { file, rank })
    }

    pub fn file(self) -> u8 {
        self.file
    }

    pub fn rank(self) -> u8 {
        self.rank
    }

    /// Index in `0..64`, rank major.
    pub fn index(self) -> usize {
        usize::from(self.rank) * 8 + usize::from(self.file)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index >= 64 {
            return None;
        }
        Self::new((index % 8) as u8, (index / 8) as u8)
    }

    /// Whether a pawn of `color` promotes on this square.
    pub fn is_last_rank_for(self, color: Color) -> bool {
        match color {
            Color::White => self.rank == 7,
            Color::Black => self.rank == 0,
        }
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'a' + self.file) as char, self.rank + 1)
    }
}

impl FromStr for Square {
    type Err = SquareParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(SquareParseError(s.to_string()));
        }
        let file = bytes[0].to_ascii_lowercase().wrapping_sub(b'a');
        let rank = bytes[1].wrapping_sub(b'1');
        Self::new(file, rank).ok_or_else(|| SquareParseError(s.to_string()))
    }
}

impl TryFrom<String> for Square {
    type Error = SquareParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Square> for String {
    fn from(sq: Square) -> Self {
        sq.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid square: {0:?}")]
pub struct SquareParseError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_square() {
        let sq: Square = "e4".parse().unwrap();
        assert_eq!((sq.file(), sq.rank()), (4, 3));
        assert_eq!(sq.to_string(), "e4");
        assert_eq!(Square::from_index(sq.index()), Some(sq));
    }

    #[test]
    fn reject_off_board() {
        assert!("i1".parse::<Square>().is_err());
        assert!("a9".parse::<Square>().is_err());
        assert!("a".parse::<Square>().is_err());
        assert!("a10".parse::<Square>().is_err());
    }

    #[test]
    fn promotion_letters() {
        let json = serde_json::to_string(&PromotionPiece::Knight).unwrap();
        assert_eq!(json, "\"n\"");
        assert_eq!(PromotionPiece::Queen.letter(), 'q');
        assert_eq!(PromotionPiece::from_kind(PieceKind::King), None);
    }

    #[test]
    fn last_rank() {
        let h8: Square = "h8".parse().unwrap();
        let a1: Square = "a1".parse().unwrap();
        assert!(h8.is_last_rank_for(Color::White));
        assert!(!h8.is_last_rank_for(Color::Black));
        assert!(a1.is_last_rank_for(Color::Black));
    }
}
