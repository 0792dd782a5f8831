//! 128-bit content hash of a chess position.
//!
//! A polyglot-style XOR hash over a frozen random table: one table entry per
//! (piece, square), four castling entries, one entry per en-passant file
//! (only counted when a pawn of the side to move could capture), and one
//! entry when white is to move. The 32-hex-char rendering of the hash is the
//! primary key of the position relation, so the table and the selection
//! rules are part of the database schema.

mod table;

use std::fmt;
use std::str::FromStr;

use shakmaty::{CastlingSide, Chess, Color, EnPassantMode, Piece, Position, Role};
use thiserror::Error;

use table::RANDOM_TABLE;

/// Hash of the standard starting position. Asserted when a store is opened;
/// a mismatch means the table or the selection rules changed.
pub const ROOT_POSITION_HASH: PositionHash =
    PositionHash(0x3a653200920c4adb562ceff24c6af691);

/// Identity of a board position (placement, turn, castling rights and
/// en-passant target). Renders as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionHash(pub(crate) u128);

impl PositionHash {
    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for PositionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for PositionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PositionHash(\"{self}\")")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid position hash {0:?}: expected 32 lowercase hex characters")]
pub struct ParsePositionHashError(String);

impl FromStr for PositionHash {
    type Err = ParsePositionHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParsePositionHashError(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(PositionHash)
            .map_err(|_| ParsePositionHashError(s.to_string()))
    }
}

/// Hash a position.
pub fn hash_position(pos: &Chess) -> PositionHash {
    let mut hash: u128 = 0;
    let board = pos.board();
    for square in board.occupied() {
        if let Some(piece) = board.piece_at(square) {
            hash ^= RANDOM_TABLE[64 * piece_offset(piece) + square as usize];
        }
    }
    let castles = pos.castles();
    if castles.has(Color::White, CastlingSide::KingSide) {
        hash ^= RANDOM_TABLE[768];
    }
    if castles.has(Color::White, CastlingSide::QueenSide) {
        hash ^= RANDOM_TABLE[769];
    }
    if castles.has(Color::Black, CastlingSide::KingSide) {
        hash ^= RANDOM_TABLE[770];
    }
    if castles.has(Color::Black, CastlingSide::QueenSide) {
        hash ^= RANDOM_TABLE[771];
    }
    // The en-passant file counts only when a capture could actually be
    // played, otherwise transpositions into the same placement would hash
    // differently.
    if let Some(ep) = pos.ep_square(EnPassantMode::PseudoLegal) {
        hash ^= RANDOM_TABLE[772 + ep.file() as usize];
    }
    if pos.turn().is_white() {
        hash ^= RANDOM_TABLE[780];
    }
    PositionHash(hash)
}

/// Reusable hasher handed to code that hashes many positions of one game.
#[derive(Clone, Copy, Default)]
pub struct ZobristHasher;

impl ZobristHasher {
    pub fn new() -> ZobristHasher {
        ZobristHasher
    }

    pub fn hash(&self, pos: &Chess) -> PositionHash {
        hash_position(pos)
    }
}

// Polyglot piece ordering: black pawn 0, white pawn 1, black knight 2, ...
fn piece_offset(piece: Piece) -> usize {
    let role = match piece.role {
        Role::Pawn => 0,
        Role::Knight => 1,
        Role::Bishop => 2,
        Role::Rook => 3,
        Role::Queen => 4,
        Role::King => 5,
    };
    2 * role + usize::from(piece.color.is_white())
}
