//! Maintenance paths: integrity check, reconstruction, verdict updates.

use chessgraph::codec::{decode_ply, encode_uci_str, Eval};
use chessgraph::store::GraphStore;
use chessgraph::zobrist::{hash_position, ROOT_POSITION_HASH};
use chessgraph::{ingest_games_text, reconstruct_position, run_database_check};
use shakmaty::{Chess, Position};

const GAMES: &str = "\
[Event \"one\"]\n[Result \"1-0\"]\n\n1. a3 1-0\n\n\
[Event \"two\"]\n[Result \"0-1\"]\n\n1. e4 e6 2. d4 d5 0-1\n\n\
[Event \"broken\"]\n[Result \"1-0\"]\n\n1. e4 e4 1-0\n";

#[tokio::test]
async fn check_reports_the_shape_of_the_database() {
    let store = GraphStore::open_in_memory().await.unwrap();
    let summary = ingest_games_text(&store, GAMES).await.unwrap();
    assert_eq!(summary.games, 3);

    let mut lines = Vec::new();
    run_database_check(&store, |line| lines.push(line))
        .await
        .unwrap();

    assert!(lines.contains(&"2 ok games and 1 error games in database".to_string()));
    assert!(lines.contains(&"0 duplicate games".to_string()));
    // Root, a3, e4, e6, d4, d5 vertices; games end on a3 and d5.
    assert!(lines.contains(
        &"6 total positions, 2 with game endings, 4 pass-through (no game ended here)".to_string()
    ));
    assert!(lines.contains(&"no problems found".to_string()));
}

#[tokio::test]
async fn every_stored_game_replays_to_its_end_vertex() {
    let store = GraphStore::open_in_memory().await.unwrap();
    ingest_games_text(&store, GAMES).await.unwrap();

    let (ok, _) = store.partition_games().await.unwrap();
    for id in ok {
        let game = store.get_game(id).await.unwrap().unwrap();
        let end = game.end_position.unwrap();
        let plies = game.plies.unwrap();

        // Replay the stored plies from the root; each must be legal and the
        // final board must hash to the stored end vertex.
        let mut pos = Chess::default();
        for encoded in plies {
            let decoded = decode_ply(encoded).unwrap();
            let m = pos
                .legal_moves()
                .into_iter()
                .find(|m| chessgraph::codec::encode_ply(m) == encoded)
                .unwrap_or_else(|| panic!("ply {encoded} ({decoded:?}) must be legal"));
            pos.play_unchecked(&m);
        }
        assert_eq!(hash_position(&pos), end);

        // The reconstructor agrees.
        let rebuilt = reconstruct_position(&store, end).await.unwrap();
        assert_eq!(hash_position(&rebuilt.position), end);
        assert!(!rebuilt.fen.is_empty());
    }
}

#[tokio::test]
async fn root_reconstruction_needs_no_edges() {
    let store = GraphStore::open_in_memory().await.unwrap();
    let rebuilt = reconstruct_position(&store, ROOT_POSITION_HASH).await.unwrap();
    assert_eq!(hash_position(&rebuilt.position), ROOT_POSITION_HASH);
    assert!(rebuilt.plies.is_empty());
}

#[tokio::test]
async fn updated_verdicts_read_back_exactly() {
    let store = GraphStore::open_in_memory().await.unwrap();
    ingest_games_text(&store, GAMES).await.unwrap();

    let eval = Eval {
        depth: 20,
        best: encode_uci_str("e2e4").unwrap(),
        mate: 0,
        score: 33,
    };
    store
        .update_evaluation(ROOT_POSITION_HASH, &eval)
        .await
        .unwrap();
    let record = store
        .get_position(ROOT_POSITION_HASH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.engine, Some(eval));

    let mated = Eval {
        depth: 12,
        best: encode_uci_str("d8h4").unwrap(),
        mate: 1,
        score: 0,
    };
    store.update_evaluation(ROOT_POSITION_HASH, &mated).await.unwrap();
    let record = store
        .get_position(ROOT_POSITION_HASH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.engine, Some(mated));
}
