//! Error taxonomy for game ingestion.
//!
//! Every way a game can be rejected collapses into [`GameError`], and each
//! variant maps onto one bit of [`ErrorCategory`]. The category bitset is
//! what gets persisted with an error game, so the bit values are part of the
//! database schema and must not be reordered.

use std::fmt;

use thiserror::Error;

/// Bitset of reasons a game was rejected. Zero means the game is ok.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCategory(u32);

impl ErrorCategory {
    /// No moves after parsing.
    pub const EMPTY_GAME: ErrorCategory = ErrorCategory(1);
    /// Initial position is not classical chess, or a variant flag was set.
    pub const NON_STANDARD: ErrorCategory = ErrorCategory(1 << 1);
    /// The upstream parser reported errors.
    pub const LIBRARY: ErrorCategory = ErrorCategory(1 << 2);
    /// A post-move board failed the rules engine's validity check.
    pub const INVALID_POSITION: ErrorCategory = ErrorCategory(1 << 3);
    /// A recorded move is illegal.
    pub const INVALID_MOVE: ErrorCategory = ErrorCategory(1 << 4);
    /// Game continues past mate or mandatory draw, or no result can be
    /// inferred.
    pub const ENDING: ErrorCategory = ErrorCategory(1 << 5);

    pub const fn empty() -> ErrorCategory {
        ErrorCategory(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> ErrorCategory {
        ErrorCategory(bits)
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ErrorCategory) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: ErrorCategory) -> ErrorCategory {
        ErrorCategory(self.0 | other.0)
    }

    /// High-volume, expected categories that are recorded without logging.
    pub fn is_silent(self) -> bool {
        self.contains(ErrorCategory::EMPTY_GAME) || self.contains(ErrorCategory::NON_STANDARD)
    }
}

impl fmt::Debug for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ErrorCategory, &str); 6] = [
            (ErrorCategory::EMPTY_GAME, "empty-game"),
            (ErrorCategory::NON_STANDARD, "non-standard-chess"),
            (ErrorCategory::LIBRARY, "library-error"),
            (ErrorCategory::INVALID_POSITION, "invalid-position"),
            (ErrorCategory::INVALID_MOVE, "invalid-move"),
            (ErrorCategory::ENDING, "ending-error"),
        ];
        if self.is_ok() {
            return write!(f, "ok");
        }
        let mut first = true;
        for (cat, name) in NAMES {
            if self.contains(cat) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A game that cannot be loaded into the graph.
///
/// These abort the active ingest transaction; the game is then recorded in
/// the game relation with its category bits, original text and message.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("game has no moves")]
    Empty,
    #[error("non-standard chess game: {0}")]
    NonStandard(String),
    #[error("parser reported errors: {0}")]
    Library(String),
    #[error("invalid position after {san}: {detail}")]
    InvalidPosition { san: String, detail: String },
    #[error("illegal move {san}: {detail}")]
    InvalidMove { san: String, detail: String },
    #[error("{0}")]
    Ending(String),
}

impl GameError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GameError::Empty => ErrorCategory::EMPTY_GAME,
            GameError::NonStandard(_) => ErrorCategory::NON_STANDARD,
            GameError::Library(_) => ErrorCategory::LIBRARY,
            GameError::InvalidPosition { .. } => ErrorCategory::INVALID_POSITION,
            GameError::InvalidMove { .. } => ErrorCategory::INVALID_MOVE,
            GameError::Ending(_) => ErrorCategory::ENDING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_bits_are_stable() {
        assert_eq!(ErrorCategory::EMPTY_GAME.bits(), 1);
        assert_eq!(ErrorCategory::NON_STANDARD.bits(), 2);
        assert_eq!(ErrorCategory::LIBRARY.bits(), 4);
        assert_eq!(ErrorCategory::INVALID_POSITION.bits(), 8);
        assert_eq!(ErrorCategory::INVALID_MOVE.bits(), 16);
        assert_eq!(ErrorCategory::ENDING.bits(), 32);
    }

    #[test]
    fn silent_categories() {
        assert!(ErrorCategory::EMPTY_GAME.is_silent());
        assert!(ErrorCategory::NON_STANDARD.is_silent());
        assert!(!ErrorCategory::ENDING.is_silent());
        assert!(!ErrorCategory::empty().is_silent());
    }

    #[test]
    fn debug_renders_names() {
        let cat = ErrorCategory::ENDING.union(ErrorCategory::INVALID_MOVE);
        assert_eq!(format!("{cat:?}"), "invalid-move|ending-error");
        assert_eq!(format!("{:?}", ErrorCategory::empty()), "ok");
    }

    #[test]
    fn game_error_maps_to_category() {
        assert_eq!(GameError::Empty.category(), ErrorCategory::EMPTY_GAME);
        assert_eq!(
            GameError::Ending("x".into()).category(),
            ErrorCategory::ENDING
        );
    }
}
