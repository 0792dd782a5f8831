//! Rebuilding a board from the graph alone.
//!
//! A vertex stores no FEN: to get one, walk incoming edges back to the root,
//! then replay the collected plies forward and verify the hash. Any cycle or
//! dead end in the backward walk means the graph is corrupt, because every
//! stored edge was created by walking a game forward from the root.

use std::collections::HashSet;

use shakmaty::fen::Fen;
use shakmaty::{Chess, EnPassantMode, Position};

use crate::codec::find_encoded_move;
use crate::game::STANDARD_CHESS_FEN;
use crate::store::{GraphStore, StoreError, StoreResult};
use crate::zobrist::{hash_position, PositionHash, ROOT_POSITION_HASH};

/// A reconstructed position: its FEN, the board itself, and one encoded ply
/// path from the root that reaches it. The path is deterministic given the
/// stored rows but otherwise arbitrary; callers only rely on it being legal.
#[derive(Debug, Clone)]
pub struct ReconstructedPosition {
    pub fen: String,
    pub position: Chess,
    pub plies: Vec<u32>,
}

/// Reconstruct the board for `target` by backward traversal.
pub async fn reconstruct_position(
    store: &GraphStore,
    target: PositionHash,
) -> StoreResult<ReconstructedPosition> {
    if target == ROOT_POSITION_HASH {
        return Ok(ReconstructedPosition {
            fen: STANDARD_CHESS_FEN.to_string(),
            position: Chess::default(),
            plies: Vec::new(),
        });
    }

    let mut plies = Vec::new();
    let mut current = target;
    let mut visited = HashSet::new();
    while current != ROOT_POSITION_HASH {
        if !visited.insert(current) {
            return Err(StoreError::Corrupt(format!(
                "backward walk from {target} revisits {current}"
            )));
        }
        let Some((parent, ply)) = store.parent_edge(current).await? else {
            return Err(StoreError::Corrupt(format!(
                "no path from {target} back to the root: {current} has no parent"
            )));
        };
        plies.push(ply);
        current = parent;
    }
    plies.reverse();

    let mut position = Chess::default();
    for &encoded in &plies {
        let m = find_encoded_move(&position, encoded).map_err(|err| {
            StoreError::Corrupt(format!(
                "stored ply {encoded} cannot be replayed towards {target}: {err}"
            ))
        })?;
        position.play_unchecked(&m);
    }
    let replayed = hash_position(&position);
    if replayed != target {
        return Err(StoreError::Corrupt(format!(
            "replaying towards {target} produced {replayed}"
        )));
    }

    let fen = Fen::from_position(position.clone(), EnPassantMode::Legal).to_string();
    Ok(ReconstructedPosition {
        fen,
        position,
        plies,
    })
}
