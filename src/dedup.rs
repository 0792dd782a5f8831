//! Duplicate game detection.
//!
//! Candidates are games sharing an end vertex. Two candidates are the same
//! game when their ply sequences are identical and, depending on how long
//! the game is, when enough metadata agrees: very long games need nothing
//! more, long games need matching players, and short games additionally need
//! an identical non-empty date. Short-game matching is a heuristic and can
//! produce false positives; the date requirement is what keeps it tolerable.

use std::collections::{BTreeSet, HashMap};

use crate::game::HeaderMap;
use crate::store::{insert_duplicate_in, GameHash, GameRecord, GraphStore, StoreError, StoreResult};

use futures::StreamExt;

/// One game moved into the duplicate relation, with the headers it had at
/// that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupAction {
    pub duplicate: GameHash,
    pub primary: GameHash,
    pub headers: HeaderMap,
}

/// Find and link duplicate games.
///
/// `soft` and `hard` are ply thresholds with `soft < hard`: at `hard` plies
/// identical move sequences alone prove duplication, at `soft` plies the
/// players must match too, and below that the date as well. Every linked
/// group commits in one transaction. Returns the performed actions.
pub async fn deduplicate_games(
    store: &GraphStore,
    soft: usize,
    hard: usize,
) -> StoreResult<Vec<DedupAction>> {
    if soft >= hard {
        return Err(StoreError::InvalidArgument(format!(
            "soft ply limit {soft} must be below hard ply limit {hard}"
        )));
    }
    if store.is_read_only() {
        return Err(StoreError::ReadOnly);
    }

    // Materialize the candidate vertices first: the scan must not hold a
    // connection while the per-game lookups run.
    let mut candidates = Vec::new();
    {
        let mut positions = store.stream_positions(false, true, None);
        while let Some(row) = positions.next().await {
            let (hash, record) = row?;
            if record.games.len() >= 2 {
                candidates.push((hash, record.games));
            }
        }
        let mut positions = store.stream_positions(true, true, None);
        while let Some(row) = positions.next().await {
            let (hash, record) = row?;
            if record.games.len() >= 2 {
                candidates.push((hash, record.games));
            }
        }
    }

    let mut already_linked = store.all_duplicate_ids().await?;
    let mut actions = Vec::new();

    for (vertex, game_ids) in candidates {
        let mut games: Vec<(GameHash, GameRecord)> = Vec::new();
        for id in game_ids {
            if already_linked.contains(&id) {
                continue;
            }
            // The vertex keeps ids of games that were deduplicated long ago;
            // only live, ok games take part.
            let Some(record) = store.get_game(id).await? else {
                continue;
            };
            if !record.is_ok() || record.plies.is_none() {
                continue;
            }
            games.push((id, record));
        }
        if games.len() < 2 {
            continue;
        }

        for group in equivalence_groups(&games, soft, hard) {
            let primary = store.find_top_primary(group[0]).await?;
            let mut tx = store.begin().await?;
            let mut grouped = Vec::new();
            for &duplicate in &group[1..] {
                if duplicate == primary {
                    continue;
                }
                let headers = games
                    .iter()
                    .find(|(id, _)| *id == duplicate)
                    .map(|(_, record)| record.headers.clone())
                    .unwrap_or_default();
                insert_duplicate_in(&mut tx, duplicate, primary, &headers).await?;
                grouped.push(DedupAction {
                    duplicate,
                    primary,
                    headers,
                });
            }
            tx.commit().await?;
            for action in &grouped {
                already_linked.insert(action.duplicate);
            }
            tracing::info!(
                vertex = %vertex,
                primary = %primary,
                duplicates = grouped.len(),
                "linked duplicate games"
            );
            actions.extend(grouped);
        }
    }
    Ok(actions)
}

// Partition the games of one vertex into groups of equivalents. Each group
// comes back sorted, so the first element is the stable primary choice.
fn equivalence_groups(
    games: &[(GameHash, GameRecord)],
    soft: usize,
    hard: usize,
) -> Vec<Vec<GameHash>> {
    let mut parent: HashMap<GameHash, GameHash> =
        games.iter().map(|(id, _)| (*id, *id)).collect();

    fn find(parent: &mut HashMap<GameHash, GameHash>, id: GameHash) -> GameHash {
        let mut root = id;
        while parent[&root] != root {
            root = parent[&root];
        }
        let mut cursor = id;
        while parent[&cursor] != root {
            let next = parent[&cursor];
            parent.insert(cursor, root);
            cursor = next;
        }
        root
    }

    for (i, (id_a, a)) in games.iter().enumerate() {
        for (id_b, b) in &games[i + 1..] {
            if are_duplicates(a, b, soft, hard) {
                let root_a = find(&mut parent, *id_a);
                let root_b = find(&mut parent, *id_b);
                if root_a != root_b {
                    parent.insert(root_a.max(root_b), root_a.min(root_b));
                }
            }
        }
    }

    let mut groups: HashMap<GameHash, BTreeSet<GameHash>> = HashMap::new();
    for (id, _) in games {
        let root = find(&mut parent, *id);
        groups.entry(root).or_default().insert(*id);
    }
    let mut result: Vec<Vec<GameHash>> = groups
        .into_values()
        .filter(|group| group.len() >= 2)
        .map(|group| group.into_iter().collect())
        .collect();
    result.sort();
    result
}

fn are_duplicates(a: &GameRecord, b: &GameRecord, soft: usize, hard: usize) -> bool {
    let (Some(plies_a), Some(plies_b)) = (&a.plies, &b.plies) else {
        return false;
    };
    if plies_a != plies_b {
        return false;
    }
    let length = plies_a.len();
    if length >= hard {
        return true;
    }
    let players = players_match(&a.headers, &b.headers);
    if length >= soft {
        return players;
    }
    players && dates_match(&a.headers, &b.headers)
}

fn players_match(a: &HeaderMap, b: &HeaderMap) -> bool {
    for key in ["white", "black"] {
        let a_name = normalize_player(a.get(key).map(String::as_str).unwrap_or_default());
        let b_name = normalize_player(b.get(key).map(String::as_str).unwrap_or_default());
        if a_name != b_name {
            return false;
        }
    }
    true
}

fn dates_match(a: &HeaderMap, b: &HeaderMap) -> bool {
    match (a.get("date"), b.get("date")) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

/// Normalize a player name: lowercase, drop dots and commas, and turn
/// `last, first` into `first last`.
fn normalize_player(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let reordered = match lowered.split_once(',') {
        Some((last, first)) => format!("{} {}", first.trim(), last.trim()),
        None => lowered,
    };
    reordered
        .chars()
        .filter(|c| *c != '.' && *c != ',')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
