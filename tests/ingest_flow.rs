//! End-to-end ingest scenarios against an in-memory store.

use chessgraph::store::GraphStore;
use chessgraph::zobrist::{PositionHash, ROOT_POSITION_HASH};
use chessgraph::{ingest_game_text, ErrorCategory};

fn hash(text: &str) -> PositionHash {
    text.parse().unwrap()
}

async fn store() -> GraphStore {
    GraphStore::open_in_memory().await.unwrap()
}

#[tokio::test]
async fn a_single_a3_game_grows_the_graph_by_one_vertex() {
    let store = store().await;
    let outcome = ingest_game_text(&store, "[Result \"1-0\"]\n\n1. a3 1-0\n")
        .await
        .unwrap();
    assert_eq!(outcome.plies, 1);
    assert_eq!(outcome.new_positions, 1);

    let terminal = hash("09e41bd5282ebaaf9f7a3e7c866e5382");
    assert_eq!(
        store.edges_from(ROOT_POSITION_HASH).await.unwrap(),
        vec![(816, terminal)]
    );

    // The game is attached to its terminal vertex, not to the root.
    let root = store.get_position(ROOT_POSITION_HASH).await.unwrap().unwrap();
    assert!(root.games.is_empty());
    let end = store.get_position(terminal).await.unwrap().unwrap();
    assert_eq!(end.games.len(), 1);
    assert!(end.games.contains(&outcome.game));

    let game = store.get_game(outcome.game).await.unwrap().unwrap();
    assert_eq!(game.plies.as_deref(), Some(&[816][..]));
    assert_eq!(game.end_position, Some(terminal));
}

#[tokio::test]
async fn extending_a_known_line_adds_only_the_new_tail() {
    let store = store().await;
    let first = ingest_game_text(&store, "[Result \"1/2-1/2\"]\n\n1. e4 e6 1/2-1/2\n")
        .await
        .unwrap();
    assert_eq!((first.plies, first.new_positions), (2, 2));

    let second = ingest_game_text(
        &store,
        "[Result \"1/2-1/2\"]\n\n1. e4 e6 2. d4 d5 1/2-1/2\n",
    )
    .await
    .unwrap();
    assert_eq!((second.plies, second.new_positions), (4, 2));

    let after_e4 = hash("26fa396cc6f30847ac0eb2f3ba3997ce");
    let after_e6 = hash("41632add6b250700df39e622411109ec");
    assert!(store.get_position(after_e4).await.unwrap().is_some());
    assert!(store.get_position(after_e6).await.unwrap().is_some());
    assert_eq!(
        store.edges_from(ROOT_POSITION_HASH).await.unwrap(),
        vec![(1228, after_e4)]
    );
    assert_eq!(
        store.edges_from(after_e4).await.unwrap(),
        vec![(5244, after_e6)]
    );

    // Sharing a prefix is not duplication.
    assert!(store.all_duplicate_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn the_same_text_twice_reports_zero_work() {
    let store = store().await;
    let text = "[Result \"0-1\"]\n\n1. f3 e5 2. g4 Qh4# 0-1\n";
    let first = ingest_game_text(&store, text).await.unwrap();
    assert_eq!(first.plies, 4);

    let second = ingest_game_text(&store, text).await.unwrap();
    assert_eq!(second.game, first.game);
    assert_eq!((second.plies, second.new_positions), (0, 0));
}

#[tokio::test]
async fn a_claimed_draw_ending_in_mate_is_rewritten_to_the_winner() {
    let store = store().await;
    let outcome = ingest_game_text(
        &store,
        "[Result \"1/2-1/2\"]\n\n1. f3 e5 2. g4 Qh4# 1/2-1/2\n",
    )
    .await
    .unwrap();
    let game = store.get_game(outcome.game).await.unwrap().unwrap();
    assert!(game.is_ok());
    assert_eq!(game.headers.get("result").unwrap(), "0-1");
}

#[tokio::test]
async fn a_stalemate_without_result_becomes_a_draw() {
    let store = store().await;
    let outcome = ingest_game_text(
        &store,
        "[Event \"miniature\"]\n\n1. e3 a5 2. Qh5 Ra6 3. Qxa5 h5 4. Qxc7 Rah6 5. h4 f6 \
         6. Qxd7+ Kf7 7. Qxb7 Qd3 8. Qxb8 Qh7 9. Qxc8 Kg6 10. Qe6 *\n",
    )
    .await
    .unwrap();
    assert_eq!(outcome.plies, 19);
    let game = store.get_game(outcome.game).await.unwrap().unwrap();
    assert!(game.is_ok());
    assert_eq!(game.headers.get("result").unwrap(), "1/2-1/2");
}

#[tokio::test]
async fn error_games_keep_their_category_and_text() {
    let store = store().await;
    let text = "[Result \"1-0\"]\n\n1. f3 e5 2. g4 Qh4# 3. Kf2 1-0\n";
    let outcome = ingest_game_text(&store, text).await.unwrap();
    assert_eq!((outcome.plies, outcome.new_positions), (0, 0));

    let game = store.get_game(outcome.game).await.unwrap().unwrap();
    assert_eq!(game.category, ErrorCategory::ENDING);
    assert_eq!(game.error_text.as_deref(), Some(text));
    assert!(game.error_message.is_some());
    assert!(game.plies.is_none());

    let (ok, errors) = store.partition_games().await.unwrap();
    assert!(ok.is_empty());
    assert_eq!(errors.len(), 1);
}
