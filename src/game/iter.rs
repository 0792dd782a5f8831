//! Walking a parsed game ply by ply.

use std::collections::HashMap;

use pgn_reader::SanPlus;
use shakmaty::{CastlingMode, Chess, EnPassantMode, FromSetup, Position};

use crate::codec::encode_ply;
use crate::error::GameError;
use crate::flags::{ExtraFlags, PositionFlags};
use crate::game::{ParsedGame, STANDARD_CHESS_FEN};
use crate::zobrist::{PositionHash, ZobristHasher, ROOT_POSITION_HASH};

/// Everything the graph needs to know about one half-move.
#[derive(Debug, Clone)]
pub struct PlyRecord {
    /// 1-based ply counter.
    pub index: usize,
    pub san: String,
    /// The move in ply encoding.
    pub ply: u32,
    pub prev: PositionHash,
    pub cur: PositionHash,
    pub flags: PositionFlags,
    pub extras: ExtraFlags,
}

/// Iterator over the plies of a parsed game.
///
/// Checks run in a fixed order: parser errors first, then the shape of the
/// starting position, then per move legality and board validity, then game
/// endings. The first failure fuses the iterator.
pub struct GameIter<'a> {
    sans: std::slice::Iter<'a, SanPlus>,
    pos: Chess,
    hasher: ZobristHasher,
    index: usize,
    prev_hash: PositionHash,
    prev_flags: PositionFlags,
    prev_extras: ExtraFlags,
    // Occurrence count per position, the cheap stand-in for the expensive
    // repetition queries: looked up exactly once per ply.
    seen: HashMap<PositionHash, u32>,
    failed: bool,
}

impl<'a> GameIter<'a> {
    pub fn new(game: &'a ParsedGame) -> Result<GameIter<'a>, GameError> {
        if !game.errors.is_empty() {
            return Err(GameError::Library(game.errors.join(" ; ")));
        }
        if let Some(variant) = &game.variant {
            return Err(GameError::NonStandard(format!("variant {variant:?}")));
        }
        if let Some(fen) = &game.fen {
            if fen.trim() != STANDARD_CHESS_FEN {
                return Err(GameError::NonStandard(format!(
                    "custom starting position {fen:?}"
                )));
            }
        }
        let pos = Chess::default();
        let mut seen = HashMap::new();
        seen.insert(ROOT_POSITION_HASH, 1);
        Ok(GameIter {
            sans: game.sans.iter(),
            prev_flags: PositionFlags::of(&pos),
            prev_extras: ExtraFlags::empty(),
            pos,
            hasher: ZobristHasher::new(),
            index: 0,
            prev_hash: ROOT_POSITION_HASH,
            seen,
            failed: false,
        })
    }

    fn fail(&mut self, err: GameError) -> Option<Result<PlyRecord, GameError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl Iterator for GameIter<'_> {
    type Item = Result<PlyRecord, GameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let san_plus = self.sans.next()?;
        self.index += 1;
        let san = san_plus.to_string();

        if self.prev_flags.contains(PositionFlags::CHECKMATE) {
            return self.fail(GameError::Ending(format!(
                "game continued after checkmate at {}/{san}",
                self.index
            )));
        }

        let m = match san_plus.san.to_move(&self.pos) {
            Ok(m) => m,
            Err(err) => {
                return self.fail(GameError::InvalidMove {
                    san,
                    detail: err.to_string(),
                })
            }
        };
        self.pos.play_unchecked(&m);
        let setup = self.pos.clone().into_setup(EnPassantMode::Always);
        if let Err(err) = Chess::from_setup(setup, CastlingMode::Standard) {
            return self.fail(GameError::InvalidPosition {
                san,
                detail: err.to_string(),
            });
        }

        let cur = self.hasher.hash(&self.pos);
        let repetitions = {
            let count = self.seen.entry(cur).or_insert(0);
            *count += 1;
            *count
        };
        let continued = self.prev_flags.is_mandatory_draw()
            || self.prev_extras.forces_draw()
            || self
                .prev_extras
                .contains(ExtraFlags::CONTINUED_AFTER_MANDATORY_DRAW);
        let flags = PositionFlags::of(&self.pos);
        let extras = ExtraFlags::of(&self.pos, repetitions, continued);
        if flags.contains(PositionFlags::CHECKMATE)
            && (flags.is_mandatory_draw() || extras.forces_draw())
        {
            return self.fail(GameError::Ending(format!(
                "position is both a win and a draw at {}/{san}",
                self.index
            )));
        }

        let record = PlyRecord {
            index: self.index,
            san,
            ply: encode_ply(&m),
            prev: self.prev_hash,
            cur,
            flags,
            extras,
        };
        self.prev_hash = cur;
        self.prev_flags = flags;
        self.prev_extras = extras;
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::parse_game_text;

    fn walk(text: &str) -> Result<Vec<PlyRecord>, GameError> {
        let game = parse_game_text(text).unwrap();
        GameIter::new(&game)?.collect()
    }

    #[test]
    fn single_move_game() {
        let records = walk("1. a3 *").unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.index, 1);
        assert_eq!(r.san, "a3");
        assert_eq!(r.ply, 816);
        assert_eq!(r.prev, ROOT_POSITION_HASH);
        assert_eq!(r.cur.to_string(), "09e41bd5282ebaaf9f7a3e7c866e5382");
        assert!(r.flags.contains(PositionFlags::BLACK_TO_MOVE));
        assert_eq!(r.extras, ExtraFlags::empty());
    }

    #[test]
    fn hashes_chain_through_the_game() {
        let records = walk("1. e4 e6 2. d4 d5 *").unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0].cur.to_string(),
            "26fa396cc6f30847ac0eb2f3ba3997ce"
        );
        assert_eq!(records[0].ply, 1228);
        assert_eq!(records[1].prev, records[0].cur);
        assert_eq!(
            records[1].cur.to_string(),
            "41632add6b250700df39e622411109ec"
        );
        assert_eq!(records[1].ply, 5244);
    }

    #[test]
    fn parser_errors_take_precedence() {
        let mut game = parse_game_text("1. e4 *").unwrap();
        game.errors.push("bad token".to_string());
        assert!(matches!(
            GameIter::new(&game),
            Err(GameError::Library(_))
        ));
    }

    #[test]
    fn non_standard_start_is_rejected() {
        let err = walk("[FEN \"8/8/4k3/8/8/3K4/8/8 w - - 0 1\"]\n\n1. Kd4 *").unwrap_err();
        assert!(matches!(err, GameError::NonStandard(_)));
        let err = walk("[Variant \"Chess960\"]\n\n1. e4 *").unwrap_err();
        assert!(matches!(err, GameError::NonStandard(_)));
    }

    #[test]
    fn a_standard_fen_header_is_fine() {
        let text = format!("[FEN \"{STANDARD_CHESS_FEN}\"]\n\n1. e4 *");
        assert_eq!(walk(&text).unwrap().len(), 1);
    }

    #[test]
    fn illegal_moves_are_classified() {
        let err = walk("1. e5 *").unwrap_err();
        assert!(matches!(err, GameError::InvalidMove { .. }));
    }

    #[test]
    fn mate_flags_on_the_last_ply() {
        let records = walk("1. f3 e5 2. g4 Qh4# 0-1").unwrap();
        let last = records.last().unwrap();
        assert!(last.flags.contains(PositionFlags::CHECKMATE));
        assert!(last.flags.contains(PositionFlags::WHITE_TO_MOVE));
    }

    #[test]
    fn continuing_after_mate_is_an_ending_error() {
        let err = walk("1. f3 e5 2. g4 Qh4# 3. Kf2 *").unwrap_err();
        assert!(matches!(err, GameError::Ending(_)));
    }

    #[test]
    fn repetition_extras_accumulate_and_propagate() {
        let shuffle = "1. Nf3 Nf6 2. Ng1 Ng8 3. Nf3 Nf6 4. Ng1 Ng8 5. Nf3 Nf6 6. Ng1 Ng8 \
                       7. Nf3 Nf6 8. Ng1 Ng8 9. e4 *";
        let records = walk(shuffle).unwrap();
        assert_eq!(records.len(), 17);
        // Second return to the start placement: three occurrences.
        assert!(records[7].extras.contains(ExtraFlags::THREEFOLD));
        assert!(!records[7].extras.contains(ExtraFlags::FIVEFOLD));
        // Fourth return: five occurrences, the game is over by rule.
        assert!(records[15].extras.contains(ExtraFlags::FIVEFOLD));
        // Playing on afterwards marks the continuation.
        assert!(records[16]
            .extras
            .contains(ExtraFlags::CONTINUED_AFTER_MANDATORY_DRAW));
        assert!(!records[15]
            .extras
            .contains(ExtraFlags::CONTINUED_AFTER_MANDATORY_DRAW));
    }
}
