//! Read-only database diagnostics.

use std::collections::{HashMap, HashSet, VecDeque};

use futures::StreamExt;

use crate::store::{GraphStore, StoreResult};
use crate::zobrist::{PositionHash, ROOT_POSITION_HASH};

/// Walk the whole database and report its shape, line by line through
/// `emit`: game and duplicate counts, vertices with and without games,
/// vertices unreachable from the root, and leaves no game ends in.
pub async fn run_database_check(
    store: &GraphStore,
    mut emit: impl FnMut(String),
) -> StoreResult<()> {
    emit("reading all games...".to_string());
    let (ok_games, error_games) = store.partition_games().await?;
    emit(format!(
        "{} ok games and {} error games in database",
        ok_games.len(),
        error_games.len()
    ));
    emit(String::new());

    emit("reading all duplicate games...".to_string());
    let duplicates = store.all_duplicate_ids().await?;
    emit(format!("{} duplicate games", duplicates.len()));
    for id in &duplicates {
        if ok_games.contains(id) || error_games.contains(id) {
            emit(format!(
                "PROBLEM: {id} is in both the game and the duplicate relations"
            ));
        }
    }
    emit(String::new());

    emit("reading all positions...".to_string());
    let mut with_games: HashSet<PositionHash> = HashSet::new();
    let mut all_positions: HashSet<PositionHash> = HashSet::new();
    for has_eval in [false, true] {
        for has_game in [false, true] {
            let mut positions = store.stream_positions(has_eval, has_game, None);
            while let Some(row) = positions.next().await {
                let (hash, record) = row?;
                all_positions.insert(hash);
                if !record.games.is_empty() {
                    with_games.insert(hash);
                }
            }
        }
    }
    emit(format!(
        "{} total positions, {} with game endings, {} pass-through (no game ended here)",
        all_positions.len(),
        with_games.len(),
        all_positions.len() - with_games.len()
    ));
    emit(String::new());

    emit("visiting all positions...".to_string());
    let mut outgoing: HashMap<PositionHash, Vec<PositionHash>> = HashMap::new();
    for (from, _, to) in store.all_edges().await? {
        outgoing.entry(from).or_default().push(to);
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([ROOT_POSITION_HASH]);
    visited.insert(ROOT_POSITION_HASH);
    while let Some(hash) = queue.pop_front() {
        for to in outgoing.get(&hash).into_iter().flatten() {
            if visited.insert(*to) {
                queue.push_back(*to);
            }
        }
    }
    let mut unreachable: Vec<_> = all_positions.difference(&visited).collect();
    unreachable.sort();
    for hash in &unreachable {
        emit(format!("PROBLEM: {hash} is not reachable from the root"));
    }
    let mut stray_leaves: Vec<_> = all_positions
        .iter()
        .filter(|hash| {
            **hash != ROOT_POSITION_HASH
                && !outgoing.contains_key(hash)
                && !with_games.contains(hash)
        })
        .collect();
    stray_leaves.sort();
    for hash in &stray_leaves {
        emit(format!("PROBLEM: leaf {hash} has no game ending in it"));
    }
    if unreachable.is_empty() && stray_leaves.is_empty() {
        emit("no problems found".to_string());
    }
    emit(String::new());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ExtraFlags, PositionFlags};
    use crate::ingest::ingest_game_text;

    async fn check_lines(store: &GraphStore) -> Vec<String> {
        let mut lines = Vec::new();
        run_database_check(store, |line| lines.push(line)).await.unwrap();
        lines
    }

    #[tokio::test]
    async fn clean_database_reports_no_problems() {
        let store = GraphStore::open_in_memory().await.unwrap();
        ingest_game_text(&store, "[Result \"1-0\"]\n\n1. a3 1-0\n")
            .await
            .unwrap();
        ingest_game_text(&store, "[Event \"x\"]\n\n*\n").await.unwrap();

        let lines = check_lines(&store).await;
        assert!(lines.contains(&"1 ok games and 1 error games in database".to_string()));
        assert!(lines.contains(&"0 duplicate games".to_string()));
        assert!(lines
            .contains(&"2 total positions, 1 with game endings, 1 pass-through (no game ended here)".to_string()));
        assert!(lines.contains(&"no problems found".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("PROBLEM")));
    }

    #[tokio::test]
    async fn disconnected_vertices_are_flagged() {
        let store = GraphStore::open_in_memory().await.unwrap();
        let orphan = crate::zobrist::PositionHash(0xabcdef);
        store
            .insert_position(orphan, PositionFlags::WHITE_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();

        let lines = check_lines(&store).await;
        assert!(lines
            .iter()
            .any(|l| l.starts_with("PROBLEM") && l.contains("not reachable")));
        // The orphan is also a leaf without a game.
        assert!(lines
            .iter()
            .any(|l| l.starts_with("PROBLEM") && l.contains("no game ending")));
    }
}
