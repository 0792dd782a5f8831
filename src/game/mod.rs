//! Parsed game texts and the walk that turns them into graph rows.

mod headers;
mod iter;

pub use headers::{fix_result, normalize_headers, HeaderMap};
pub use iter::{GameIter, PlyRecord};

use std::io::Cursor;

use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};

use crate::error::GameError;

/// FEN of the classical starting position.
pub const STANDARD_CHESS_FEN: &str =
    "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// One game as delivered by the PGN parser: raw headers in input order, the
/// mainline moves, and whatever the parser complained about.
#[derive(Debug, Default, Clone)]
pub struct ParsedGame {
    pub headers: Vec<(String, String)>,
    pub sans: Vec<SanPlus>,
    /// Value of a `FEN` header, if any.
    pub fen: Option<String>,
    /// Value of a `Variant` header naming a non-standard variant, if any.
    pub variant: Option<String>,
    /// Non-empty when parsing failed.
    pub errors: Vec<String>,
}

/// Parse a single game from its text.
///
/// The text must hold exactly one game; a chunk parsing to more than one is
/// refused. Reader-level failures are not fatal here: they land in
/// [`ParsedGame::errors`] and classify the game as a library error later.
pub fn parse_game_text(text: &str) -> Result<ParsedGame, GameError> {
    let mut reader = BufferedReader::new(Cursor::new(text.as_bytes()));
    let mut collector = GameCollector::default();
    let game = match reader.read_game(&mut collector) {
        Ok(Some(game)) => game,
        Ok(None) => ParsedGame::default(),
        Err(err) => {
            let mut game = collector.game;
            game.errors.push(err.to_string());
            return Ok(game);
        }
    };
    match reader.read_game(&mut GameCounter) {
        Ok(None) => Ok(game),
        Ok(Some(())) => Err(GameError::Library(
            "text contains more than one game".to_string(),
        )),
        Err(err) => Err(GameError::Library(err.to_string())),
    }
}

/// Number of games a text parses to. Used by the splitter to stay strict.
pub fn count_games(text: &str) -> usize {
    let mut reader = BufferedReader::new(Cursor::new(text.as_bytes()));
    let mut count = 0;
    while let Ok(Some(())) = reader.read_game(&mut GameCounter) {
        count += 1;
    }
    count
}

#[derive(Default)]
struct GameCollector {
    game: ParsedGame,
}

impl Visitor for GameCollector {
    type Result = ParsedGame;

    fn begin_game(&mut self) {
        self.game = ParsedGame::default();
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        let key = String::from_utf8_lossy(key).into_owned();
        let value = value.decode_utf8_lossy().into_owned();
        match key.as_str() {
            "FEN" => self.game.fen = Some(value.clone()),
            "Variant" => {
                let v = value.trim();
                if !v.is_empty() && !v.eq_ignore_ascii_case("standard") {
                    self.game.variant = Some(v.to_string());
                }
            }
            _ => {}
        }
        self.game.headers.push((key, value));
    }

    fn end_headers(&mut self) -> Skip {
        Skip(false)
    }

    fn san(&mut self, san_plus: SanPlus) {
        self.game.sans.push(san_plus);
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_game(&mut self) -> Self::Result {
        std::mem::take(&mut self.game)
    }
}

/// Visitor that skips everything; only game boundaries matter.
struct GameCounter;

impl Visitor for GameCounter {
    type Result = ();

    fn end_headers(&mut self) -> Skip {
        Skip(true)
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_game(&mut self) -> Self::Result {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "[Event \"test\"]\n[Result \"1-0\"]\n\n1. e4 e6 1-0\n";

    #[test]
    fn parses_headers_and_moves() {
        let game = parse_game_text(SIMPLE).unwrap();
        assert_eq!(game.sans.len(), 2);
        assert_eq!(game.sans[0].to_string(), "e4");
        assert!(game
            .headers
            .iter()
            .any(|(k, v)| k == "Event" && v == "test"));
        assert!(game.fen.is_none());
        assert!(game.variant.is_none());
        assert!(game.errors.is_empty());
    }

    #[test]
    fn captures_fen_and_variant_headers() {
        let text = "[Variant \"Chess960\"]\n[FEN \"8/8/4k3/8/8/3K4/8/8 w - - 0 1\"]\n\n1. Kd4 *\n";
        let game = parse_game_text(text).unwrap();
        assert_eq!(game.variant.as_deref(), Some("Chess960"));
        assert_eq!(game.fen.as_deref(), Some("8/8/4k3/8/8/3K4/8/8 w - - 0 1"));
    }

    #[test]
    fn standard_variant_header_is_not_flagged() {
        let text = "[Variant \"Standard\"]\n\n1. e4 *\n";
        let game = parse_game_text(text).unwrap();
        assert!(game.variant.is_none());
    }

    #[test]
    fn empty_text_yields_empty_game() {
        let game = parse_game_text("").unwrap();
        assert!(game.sans.is_empty());
        assert!(game.headers.is_empty());
    }

    #[test]
    fn refuses_two_games_in_one_text() {
        let text = "[Event \"a\"]\n\n1. e4 *\n\n[Event \"b\"]\n\n1. d4 *\n";
        assert!(matches!(
            parse_game_text(text),
            Err(GameError::Library(_))
        ));
        assert_eq!(count_games(text), 2);
    }

    #[test]
    fn counts_games() {
        assert_eq!(count_games(SIMPLE), 1);
        assert_eq!(count_games(""), 0);
    }
}
