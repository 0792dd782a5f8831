//! Duplicate detection over ingested games, end to end.

use chessgraph::store::GraphStore;
use chessgraph::{deduplicate_games, ingest_game_text};

const MOVES: &str = "1. e4 e6 2. d4 d5";

fn pgn(event: &str, white: &str, black: &str, date: &str, result: &str) -> String {
    format!(
        "[Event \"{event}\"]\n[White \"{white}\"]\n[Black \"{black}\"]\n\
         [Date \"{date}\"]\n[Result \"{result}\"]\n\n{MOVES} {result}\n"
    )
}

#[tokio::test]
async fn equal_games_collapse_to_the_smallest_id() {
    let store = GraphStore::open_in_memory().await.unwrap();
    let a = ingest_game_text(
        &store,
        &pgn("Fujitsu Siemens Giants", "Kasparov, Garry", "Leko, Peter", "2000.06.24", "0-1"),
    )
    .await
    .unwrap();
    let b = ingest_game_text(
        &store,
        &pgn("Fujitsu Siemens Giants - copy", "another", "other", "2021.06.24", "1-0"),
    )
    .await
    .unwrap();

    // Both games are 4 plies long; with hard = 4 the ply sequence decides.
    let actions = deduplicate_games(&store, 2, 4).await.unwrap();
    assert_eq!(actions.len(), 1);

    let primary = a.game.min(b.game);
    let duplicate = a.game.max(b.game);
    let action = &actions[0];
    assert_eq!(action.primary, primary);
    assert_eq!(action.duplicate, duplicate);
    // The deduplicator never links a game to itself.
    assert_ne!(action.primary, action.duplicate);

    // The duplicate moved relations: its game row is gone, the duplicate
    // row resolves back to the primary.
    assert!(store.get_game(duplicate).await.unwrap().is_none());
    assert!(store.get_game(primary).await.unwrap().is_some());
    assert_eq!(store.find_top_primary(duplicate).await.unwrap(), primary);

    // The terminal vertex still remembers both games.
    let end = store
        .get_game(primary)
        .await
        .unwrap()
        .unwrap()
        .end_position
        .unwrap();
    let record = store.get_position(end).await.unwrap().unwrap();
    assert_eq!(record.games.len(), 2);
}

#[tokio::test]
async fn merged_headers_join_disagreements() {
    let store = GraphStore::open_in_memory().await.unwrap();
    let a = ingest_game_text(
        &store,
        &pgn("Fujitsu Siemens Giants", "Kasparov, Garry", "Leko, Peter", "2000.06.24", "0-1"),
    )
    .await
    .unwrap();
    let b = ingest_game_text(
        &store,
        &pgn("Fujitsu Siemens Giants - copy", "another", "other", "2021.06.24", "1-0"),
    )
    .await
    .unwrap();
    deduplicate_games(&store, 2, 4).await.unwrap();

    let primary = a.game.min(b.game);
    let merged = store.merged_headers(primary).await.unwrap();

    // Conflicting values are joined, a conflicting result collapses to
    // unknown, and every conflict is recorded as an issue.
    let event = merged.headers.get("event").unwrap();
    assert!(event.contains(" | "));
    assert!(event.contains("Fujitsu Siemens Giants"));
    assert_eq!(merged.headers.get("result").unwrap(), "*");
    let white = merged.headers.get("white").unwrap();
    assert!(white.contains("Kasparov, Garry") && white.contains("another"));

    assert_eq!(merged.issues.len(), 5);
    assert!(merged
        .issues
        .iter()
        .any(|issue| issue.starts_with("result: ")));
    assert!(merged
        .issues
        .iter()
        .any(|issue| issue.starts_with("white: ")));
}

#[tokio::test]
async fn already_linked_games_are_left_alone() {
    let store = GraphStore::open_in_memory().await.unwrap();
    ingest_game_text(
        &store,
        &pgn("x", "Aaa", "Bbb", "2010.06.23", "1/2-1/2"),
    )
    .await
    .unwrap();
    ingest_game_text(
        &store,
        &pgn("y", "aaa", "bbb", "2010.06.23", "1/2-1/2"),
    )
    .await
    .unwrap();

    assert_eq!(deduplicate_games(&store, 2, 4).await.unwrap().len(), 1);
    assert!(deduplicate_games(&store, 2, 4).await.unwrap().is_empty());
    assert_eq!(store.all_duplicate_ids().await.unwrap().len(), 1);
}
