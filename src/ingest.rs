//! Loading games into the graph.
//!
//! One game is one transaction: every position and edge of the game commits
//! together with the game row itself, so a reader can never observe a game
//! whose end vertex is missing its back-link. Games that fail any check are
//! recorded afterwards, in a fresh transaction, with their category bits and
//! original text.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::GameError;
use crate::game::{fix_result, normalize_headers, GameIter, HeaderMap, ParsedGame};
use crate::intake::split_games;
use crate::store::{
    game_known_in, insert_edge_in, insert_game_ok_in, insert_position_in, GameHash, GraphStore,
    StoreError, StoreResult,
};

/// What one call to [`ingest_game_text`] did.
///
/// `plies == 0 && new_positions == 0` means the game was already known, or
/// was recorded as an error game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub game: GameHash,
    pub plies: usize,
    pub new_positions: usize,
}

impl IngestOutcome {
    fn skipped(game: GameHash) -> IngestOutcome {
        IngestOutcome {
            game,
            plies: 0,
            new_positions: 0,
        }
    }
}

/// Totals over a whole stream of games.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub games: usize,
    pub plies: usize,
    pub new_positions: usize,
}

impl IngestSummary {
    pub fn absorb(&mut self, outcome: &IngestOutcome) {
        self.games += 1;
        self.plies += outcome.plies;
        self.new_positions += outcome.new_positions;
    }
}

// Either axis of failure inside the loading transaction: game errors are
// recorded, store errors propagate.
enum LoadFail {
    Game(GameError),
    Store(StoreError),
}

impl From<GameError> for LoadFail {
    fn from(err: GameError) -> LoadFail {
        LoadFail::Game(err)
    }
}

impl From<StoreError> for LoadFail {
    fn from(err: StoreError) -> LoadFail {
        LoadFail::Store(err)
    }
}

/// Ingest a single game text into the store.
pub async fn ingest_game_text(store: &GraphStore, raw_text: &str) -> StoreResult<IngestOutcome> {
    if store.is_read_only() {
        return Err(StoreError::ReadOnly);
    }
    let id = GameHash::of_text(raw_text);
    if store.known_game(id).await? {
        return Ok(IngestOutcome::skipped(id));
    }
    let (parsed, mut headers) = match crate::game::parse_game_text(raw_text) {
        Ok(parsed) => {
            let headers = normalize_headers(&parsed.headers);
            (parsed, headers)
        }
        Err(err) => {
            return record_error(store, id, raw_text, HeaderMap::new(), err).await;
        }
    };
    match load_game(store, id, &parsed, &mut headers, raw_text).await {
        Ok(outcome) => {
            store.remember_game(id).await;
            Ok(outcome)
        }
        Err(LoadFail::Game(err)) => record_error(store, id, raw_text, headers, err).await,
        Err(LoadFail::Store(err)) => Err(err),
    }
}

async fn load_game(
    store: &GraphStore,
    id: GameHash,
    parsed: &ParsedGame,
    headers: &mut HeaderMap,
    raw_text: &str,
) -> Result<IngestOutcome, LoadFail> {
    let mut tx = store.begin().await?;
    // The id cache is loaded once per store handle; re-check against the
    // live rows so two loaders of the same text cannot both insert.
    if game_known_in(&mut tx, id).await? {
        return Ok(IngestOutcome::skipped(id));
    }

    let mut plies = Vec::new();
    let mut new_positions = 0usize;
    let mut terminal = None;
    for step in GameIter::new(parsed)? {
        let step = step?;
        if insert_position_in(&mut tx, step.cur, step.flags, step.extras, None).await? {
            new_positions += 1;
        }
        insert_edge_in(&mut tx, step.prev, step.ply, step.cur).await?;
        plies.push(step.ply);
        terminal = Some((step.cur, step.flags, step.extras));
    }
    let Some((end, flags, extras)) = terminal else {
        return Err(GameError::Empty.into());
    };

    fix_result(headers, flags, extras, raw_text)?;

    // Re-insert the terminal vertex with the game attached, then the game
    // row itself: both commit in the same transaction.
    insert_position_in(&mut tx, end, flags, extras, Some(id)).await?;
    insert_game_ok_in(&mut tx, id, end, &plies, headers).await?;
    tx.commit().await.map_err(StoreError::from)?;

    tracing::debug!(
        game = %id,
        plies = plies.len(),
        new_positions,
        "game loaded"
    );
    Ok(IngestOutcome {
        game: id,
        plies: plies.len(),
        new_positions,
    })
}

async fn record_error(
    store: &GraphStore,
    id: GameHash,
    raw_text: &str,
    headers: HeaderMap,
    err: GameError,
) -> StoreResult<IngestOutcome> {
    let category = err.category();
    if !category.is_silent() {
        tracing::warn!(game = %id, category = ?category, "rejected game: {err}");
    }
    store
        .insert_game_error(id, &headers, category, raw_text, &err.to_string())
        .await?;
    Ok(IngestOutcome::skipped(id))
}

/// Ingest every game of a plain-text games file.
pub async fn ingest_games_file(store: &GraphStore, path: &Path) -> StoreResult<IngestSummary> {
    let mut text = String::new();
    tokio::fs::File::open(path)
        .await
        .map_err(|err| StoreError::InvalidArgument(format!("cannot open {path:?}: {err}")))?
        .read_to_string(&mut text)
        .await
        .map_err(|err| StoreError::InvalidArgument(format!("cannot read {path:?}: {err}")))?;
    ingest_games_text(store, &text).await
}

/// Split a text holding many games and ingest each of them.
pub async fn ingest_games_text(store: &GraphStore, text: &str) -> StoreResult<IngestSummary> {
    let mut summary = IngestSummary::default();
    for chunk in split_games(text.as_bytes()) {
        let chunk =
            chunk.map_err(|err| StoreError::InvalidArgument(format!("bad game chunk: {err}")))?;
        let outcome = ingest_game_text(store, &chunk).await?;
        summary.absorb(&outcome);
        if summary.games % 10_000 == 0 {
            tracing::info!(
                games = summary.games,
                positions = summary.new_positions,
                "ingest progress"
            );
        }
    }
    Ok(summary)
}
