//! Per-vertex status bits.
//!
//! [`PositionFlags`] depend only on the board and are immutable once a vertex
//! exists: the store rejects a second insert with different flags.
//! [`ExtraFlags`] depend on the history that reached the board (repetition
//! and halfmove counters), so a vertex keeps a *set* of them, one per
//! distinct kind of history observed.
//!
//! Both bit layouts are persisted verbatim and must never be reordered.

use std::fmt;

use shakmaty::{Chess, Color, Position};

/// Board-only predicates of a position. Exactly one of the to-move bits is
/// set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PositionFlags(u32);

impl PositionFlags {
    pub const WHITE_TO_MOVE: PositionFlags = PositionFlags(1);
    pub const BLACK_TO_MOVE: PositionFlags = PositionFlags(1 << 1);
    pub const CHECK: PositionFlags = PositionFlags(1 << 2);
    pub const CHECKMATE: PositionFlags = PositionFlags(1 << 3);
    pub const STALEMATE: PositionFlags = PositionFlags(1 << 4);
    pub const WHITE_INSUFFICIENT: PositionFlags = PositionFlags(1 << 5);
    pub const BLACK_INSUFFICIENT: PositionFlags = PositionFlags(1 << 6);

    pub const fn empty() -> PositionFlags {
        PositionFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> PositionFlags {
        PositionFlags(bits)
    }

    pub const fn contains(self, other: PositionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PositionFlags) {
        self.0 |= other.0;
    }

    /// Evaluate the board-only predicates of `pos`.
    pub fn of(pos: &Chess) -> PositionFlags {
        let mut flags = if pos.turn().is_white() {
            PositionFlags::WHITE_TO_MOVE
        } else {
            PositionFlags::BLACK_TO_MOVE
        };
        if pos.is_check() {
            flags.insert(PositionFlags::CHECK);
        }
        if pos.is_checkmate() {
            flags.insert(PositionFlags::CHECKMATE);
        }
        if pos.is_stalemate() {
            flags.insert(PositionFlags::STALEMATE);
        }
        if pos.has_insufficient_material(Color::White) {
            flags.insert(PositionFlags::WHITE_INSUFFICIENT);
        }
        if pos.has_insufficient_material(Color::Black) {
            flags.insert(PositionFlags::BLACK_INSUFFICIENT);
        }
        flags
    }

    /// The side that delivered mate, if this position is checkmate.
    pub fn winner(self) -> Option<Color> {
        if !self.contains(PositionFlags::CHECKMATE) {
            return None;
        }
        if self.contains(PositionFlags::BLACK_TO_MOVE) {
            Some(Color::White)
        } else {
            Some(Color::Black)
        }
    }

    /// Rule-forced draw visible from the board alone: stalemate, or neither
    /// side retains mating material.
    pub fn is_mandatory_draw(self) -> bool {
        self.contains(PositionFlags::STALEMATE)
            || (self.contains(PositionFlags::WHITE_INSUFFICIENT)
                && self.contains(PositionFlags::BLACK_INSUFFICIENT))
    }
}

impl fmt::Debug for PositionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PositionFlags, &str); 7] = [
            (PositionFlags::WHITE_TO_MOVE, "white-to-move"),
            (PositionFlags::BLACK_TO_MOVE, "black-to-move"),
            (PositionFlags::CHECK, "check"),
            (PositionFlags::CHECKMATE, "checkmate"),
            (PositionFlags::STALEMATE, "stalemate"),
            (PositionFlags::WHITE_INSUFFICIENT, "white-insufficient"),
            (PositionFlags::BLACK_INSUFFICIENT, "black-insufficient"),
        ];
        write_named_bits(f, self.0, &NAMES.map(|(flag, name)| (flag.0, name)))
    }
}

/// History-dependent predicates of a position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ExtraFlags(u32);

impl ExtraFlags {
    /// The position occurred at least three times; a side may claim a draw.
    pub const THREEFOLD: ExtraFlags = ExtraFlags(1);
    /// The position occurred at least five times; the game is drawn.
    pub const FIVEFOLD: ExtraFlags = ExtraFlags(1 << 1);
    /// Fifty moves without pawn move or capture; a side may claim a draw.
    pub const FIFTY_MOVES: ExtraFlags = ExtraFlags(1 << 2);
    /// Seventy-five moves without pawn move or capture; the game is drawn.
    pub const SEVENTY_FIVE_MOVES: ExtraFlags = ExtraFlags(1 << 3);
    /// The game kept going after a rule-forced draw condition.
    pub const CONTINUED_AFTER_MANDATORY_DRAW: ExtraFlags = ExtraFlags(1 << 4);

    pub const fn empty() -> ExtraFlags {
        ExtraFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> ExtraFlags {
        ExtraFlags(bits)
    }

    pub const fn contains(self, other: ExtraFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ExtraFlags) {
        self.0 |= other.0;
    }

    /// Evaluate the history predicates of `pos`.
    ///
    /// `repetitions` is the number of times this position has occurred in
    /// the game, the current occurrence included. `continued` carries the
    /// continued-after-mandatory-draw bit forward from earlier plies.
    pub fn of(pos: &Chess, repetitions: u32, continued: bool) -> ExtraFlags {
        let mut extras = ExtraFlags::empty();
        if repetitions >= 3 {
            extras.insert(ExtraFlags::THREEFOLD);
        }
        if repetitions >= 5 {
            extras.insert(ExtraFlags::FIVEFOLD);
        }
        let halfmoves = pos.halfmoves();
        if halfmoves >= 100 {
            extras.insert(ExtraFlags::FIFTY_MOVES);
        }
        if halfmoves >= 150 {
            extras.insert(ExtraFlags::SEVENTY_FIVE_MOVES);
        }
        if continued {
            extras.insert(ExtraFlags::CONTINUED_AFTER_MANDATORY_DRAW);
        }
        extras
    }

    /// Rule-forced draw visible from the history counters alone.
    pub fn forces_draw(self) -> bool {
        self.contains(ExtraFlags::FIVEFOLD) || self.contains(ExtraFlags::SEVENTY_FIVE_MOVES)
    }
}

impl fmt::Debug for ExtraFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ExtraFlags, &str); 5] = [
            (ExtraFlags::THREEFOLD, "threefold"),
            (ExtraFlags::FIVEFOLD, "fivefold"),
            (ExtraFlags::FIFTY_MOVES, "50-moves"),
            (ExtraFlags::SEVENTY_FIVE_MOVES, "75-moves"),
            (
                ExtraFlags::CONTINUED_AFTER_MANDATORY_DRAW,
                "continued-after-mandatory-draw",
            ),
        ];
        write_named_bits(f, self.0, &NAMES.map(|(flag, name)| (flag.0, name)))
    }
}

fn write_named_bits(f: &mut fmt::Formatter<'_>, bits: u32, names: &[(u32, &str)]) -> fmt::Result {
    if bits == 0 {
        return write!(f, "(none)");
    }
    let mut first = true;
    for (bit, name) in names {
        if bits & bit == *bit {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
    }
    Ok(())
}
