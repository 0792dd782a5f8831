//! Compact encodings for half-moves and engine verdicts.
//!
//! A half-move becomes `from * 100 + to + promotion * 1_000_000` with squares
//! numbered 0..63 from a1 and promotion taking the piece value of the new
//! piece (knight 2 .. queen 5). A verdict becomes four comma-separated
//! signed lowercase-hex integers. Both encodings are persisted, so they must
//! round-trip exactly.

use std::fmt;

use shakmaty::{Chess, File, Move, Position, Role, Square};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid promotion piece value: {0}")]
    InvalidPromotion(u32),
    #[error("invalid square coordinates: {from} / {to}")]
    InvalidSquares { from: u32, to: u32 },
    #[error("malformed evaluation {0:?}")]
    MalformedEval(String),
    #[error("malformed UCI move {0:?}")]
    MalformedUci(String),
}

/// A decoded half-move: origin, destination and optional promotion piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPly {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Role>,
}

/// Encode a legal move as a small integer.
///
/// Castling is normalized to the king's origin and destination squares, the
/// way engines print it, so `O-O` for white encodes as e1-g1.
pub fn encode_ply(m: &Move) -> u32 {
    match *m {
        Move::Normal {
            from,
            to,
            promotion,
            ..
        } => encode_parts(from, to, promotion),
        Move::EnPassant { from, to } => encode_parts(from, to, None),
        Move::Castle { king, rook } => {
            let file = if rook.file() > king.file() {
                File::G
            } else {
                File::C
            };
            let to = Square::from_coords(file, king.rank());
            encode_parts(king, to, None)
        }
        // Drops only exist in crazyhouse-style variants, which never reach
        // the graph: non-standard games are rejected before encoding.
        Move::Put { .. } => unreachable!("drop moves cannot occur in standard chess"),
    }
}

fn encode_parts(from: Square, to: Square, promotion: Option<Role>) -> u32 {
    let base = from as u32 * 100 + to as u32;
    match promotion {
        Some(role) => base + promotion_value(role) * 1_000_000,
        None => base,
    }
}

fn promotion_value(role: Role) -> u32 {
    match role {
        Role::Pawn => 1,
        Role::Knight => 2,
        Role::Bishop => 3,
        Role::Rook => 4,
        Role::Queen => 5,
        Role::King => 6,
    }
}

fn promotion_role(value: u32) -> Option<Role> {
    match value {
        2 => Some(Role::Knight),
        3 => Some(Role::Bishop),
        4 => Some(Role::Rook),
        5 => Some(Role::Queen),
        _ => None,
    }
}

/// Invert [`encode_ply`].
pub fn decode_ply(encoded: u32) -> Result<DecodedPly, CodecError> {
    let mut rest = encoded;
    let mut promotion = None;
    if rest > 10_000 {
        let value = rest / 1_000_000;
        rest -= value * 1_000_000;
        promotion =
            Some(promotion_role(value).ok_or(CodecError::InvalidPromotion(value))?);
    }
    let from = rest / 100;
    let to = rest % 100;
    if from >= 64 || to >= 64 {
        return Err(CodecError::InvalidSquares { from, to });
    }
    Ok(DecodedPly {
        from: Square::new(from),
        to: Square::new(to),
        promotion,
    })
}

/// Find the legal move of `pos` matching an encoded ply.
pub fn find_encoded_move(pos: &Chess, encoded: u32) -> Result<Move, CodecError> {
    // Validates the encoding before scanning.
    let decoded = decode_ply(encoded)?;
    pos.legal_moves()
        .into_iter()
        .find(|m| encode_ply(m) == encoded)
        .ok_or(CodecError::InvalidSquares {
            from: decoded.from as u32,
            to: decoded.to as u32,
        })
}

/// Encode a UCI move string like `e2e4` or `a7a8q`.
pub fn encode_uci_str(uci: &str) -> Result<u32, CodecError> {
    let bytes = uci.as_bytes();
    if bytes.len() != 4 && bytes.len() != 5 {
        return Err(CodecError::MalformedUci(uci.to_string()));
    }
    let from = uci_square(bytes[0], bytes[1]).ok_or_else(|| {
        CodecError::MalformedUci(uci.to_string())
    })?;
    let to = uci_square(bytes[2], bytes[3]).ok_or_else(|| {
        CodecError::MalformedUci(uci.to_string())
    })?;
    let promotion = if bytes.len() == 5 {
        match bytes[4].to_ascii_lowercase() {
            b'n' => 2,
            b'b' => 3,
            b'r' => 4,
            b'q' => 5,
            _ => return Err(CodecError::MalformedUci(uci.to_string())),
        }
    } else {
        0
    };
    Ok(from * 100 + to + promotion * 1_000_000)
}

fn uci_square(file: u8, rank: u8) -> Option<u32> {
    if !(b'a'..=b'h').contains(&file) || !(b'1'..=b'8').contains(&rank) {
        return None;
    }
    Some((rank - b'1') as u32 * 8 + (file - b'a') as u32)
}

/// An engine's verdict on a position.
///
/// `mate` is signed plies-to-mate for the side to move (negative means the
/// opponent mates); `score` is centipawns and only meaningful when `mate` is
/// zero. `best` is the best move in ply encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eval {
    pub depth: u32,
    pub best: u32,
    pub mate: i32,
    pub score: i32,
}

/// Encode a verdict as `depth,best,mate,score` in signed lowercase hex.
pub fn encode_eval(eval: &Eval) -> String {
    format!(
        "{},{},{},{}",
        SignedHex(i64::from(eval.depth)),
        SignedHex(i64::from(eval.best)),
        SignedHex(i64::from(eval.mate)),
        SignedHex(i64::from(eval.score)),
    )
}

/// Invert [`encode_eval`].
pub fn decode_eval(text: &str) -> Result<Eval, CodecError> {
    let malformed = || CodecError::MalformedEval(text.to_string());
    let mut fields = text.split(',');
    let mut next = || -> Result<i64, CodecError> {
        parse_signed_hex(fields.next().ok_or_else(malformed)?).ok_or_else(malformed)
    };
    let depth = next()?;
    let best = next()?;
    let mate = next()?;
    let score = next()?;
    if fields.next().is_some() {
        return Err(malformed());
    }
    let eval = Eval {
        depth: u32::try_from(depth).map_err(|_| malformed())?,
        best: u32::try_from(best).map_err(|_| malformed())?,
        mate: i32::try_from(mate).map_err(|_| malformed())?,
        score: i32::try_from(score).map_err(|_| malformed())?,
    };
    Ok(eval)
}

struct SignedHex(i64);

impl fmt::Display for SignedHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{:x}", -self.0)
        } else {
            write!(f, "{:x}", self.0)
        }
    }
}

fn parse_signed_hex(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('-') {
        i64::from_str_radix(rest, 16).ok().map(|v| -v)
    } else {
        i64::from_str_radix(text, 16).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shakmaty::san::San;

    fn play(pos: &mut Chess, san: &str) -> Move {
        let m = san.parse::<San>().unwrap().to_move(pos).unwrap();
        pos.play_unchecked(&m);
        m
    }

    #[test]
    fn encodes_simple_pawn_push() {
        let mut pos = Chess::default();
        let m = play(&mut pos, "a3");
        assert_eq!(encode_ply(&m), 816);
        let decoded = decode_ply(816).unwrap();
        assert_eq!(decoded.from, Square::A2);
        assert_eq!(decoded.to, Square::A3);
        assert_eq!(decoded.promotion, None);
    }

    #[test]
    fn encodes_promotion() {
        let decoded = decode_ply(5_000_816).unwrap();
        assert_eq!(decoded.from, Square::A2);
        assert_eq!(decoded.to, Square::A3);
        assert_eq!(decoded.promotion, Some(Role::Queen));
    }

    #[test]
    fn castling_uses_king_squares() {
        let mut pos = Chess::default();
        for san in ["e4", "e5", "Nf3", "Nc6", "Bc4", "Bc5"] {
            play(&mut pos, san);
        }
        let m = play(&mut pos, "O-O");
        // e1 = 4, g1 = 6.
        assert_eq!(encode_ply(&m), 406);
    }

    #[test]
    fn round_trips_all_legal_opening_moves() {
        let pos = Chess::default();
        for m in pos.legal_moves() {
            let encoded = encode_ply(&m);
            let decoded = decode_ply(encoded).unwrap();
            assert_eq!(decoded.from as u32, encoded / 100 % 100);
            let found = find_encoded_move(&pos, encoded).unwrap();
            assert_eq!(found, m);
        }
    }

    #[test]
    fn rejects_bad_encodings() {
        assert_eq!(
            decode_ply(1_000_816),
            Err(CodecError::InvalidPromotion(1))
        );
        assert_eq!(
            decode_ply(6_000_816),
            Err(CodecError::InvalidPromotion(6))
        );
        assert!(matches!(
            decode_ply(9_964),
            Err(CodecError::InvalidSquares { from: 99, to: 64 })
        ));
    }

    #[test]
    fn uci_strings_encode_like_moves() {
        assert_eq!(encode_uci_str("a2a3").unwrap(), 816);
        assert_eq!(encode_uci_str("e2e4").unwrap(), 1228);
        assert_eq!(encode_uci_str("a7a8q").unwrap(), 5_004_856);
        assert!(encode_uci_str("a2a9").is_err());
        assert!(encode_uci_str("a2a3k").is_err());
        assert!(encode_uci_str("0000").is_err());
    }

    #[test]
    fn eval_round_trip() {
        let eval = Eval {
            depth: 4,
            best: 816,
            mate: -1,
            score: 79,
        };
        assert_eq!(encode_eval(&eval), "4,330,-1,4f");
        assert_eq!(decode_eval("4,330,-1,4f").unwrap(), eval);

        let negative = Eval {
            depth: 20,
            best: 5_000_816,
            mate: 0,
            score: -310,
        };
        assert_eq!(decode_eval(&encode_eval(&negative)).unwrap(), negative);
    }

    #[test]
    fn eval_rejects_malformed_text() {
        assert!(decode_eval("").is_err());
        assert!(decode_eval("4,330,-1").is_err());
        assert!(decode_eval("4,330,-1,4f,9").is_err());
        assert!(decode_eval("4,zz,-1,4f").is_err());
        assert!(decode_eval("-4,330,-1,4f").is_err());
    }
}
