//! chessgraph: a content-addressed graph database for historical chess
//! games.
//!
//! Games are normalized and stored as a directed graph: vertices are
//! distinct board positions (keyed by a 128-bit content hash), edges are
//! single half-moves, and a game relation keeps the ordered ply sequence
//! that produced each game together with its metadata. On top of the graph
//! sit duplicate detection, position reconstruction by backward traversal,
//! an integrity check, and a worker pool that attaches engine verdicts to
//! vertices.
//!
//! The chess rules themselves come from `shakmaty`/`pgn-reader`; the
//! analysis engine is an external UCI process driven by the
//! `chessgraph-uci` crate.

pub mod check;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fen;
pub mod flags;
pub mod game;
pub mod ingest;
pub mod intake;
pub mod store;
pub mod workers;
pub mod zobrist;

pub use check::run_database_check;
pub use codec::{decode_eval, decode_ply, encode_eval, encode_ply, Eval};
pub use config::DataDirs;
pub use dedup::{deduplicate_games, DedupAction};
pub use error::{ErrorCategory, GameError};
pub use fen::{reconstruct_position, ReconstructedPosition};
pub use flags::{ExtraFlags, PositionFlags};
pub use ingest::{ingest_game_text, ingest_games_file, ingest_games_text, IngestOutcome};
pub use store::{GameHash, GraphStore, PositionRecord, StoreError};
pub use workers::{evaluate_positions, EvalPoolConfig};
pub use zobrist::{hash_position, PositionHash, ROOT_POSITION_HASH};
