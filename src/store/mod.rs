//! The graph store: four SQLite relations behind transactional operations.
//!
//! `positions` are the vertices (keyed by the 32-hex position hash), `moves`
//! the edges (keyed by from-position and encoded ply), `games` the ordered
//! ply lists that produced them (keyed by the 64-hex content hash of the
//! input text) and `duplicate_games` the detected duplicates. Referential
//! integrity is enforced by SQLite itself: foreign keys are switched on for
//! every connection, and hash widths are checked at the storage layer.
//!
//! The store owns all persisted state. Everything composite happens inside a
//! single transaction through the `*_in` operations; the inherent methods
//! wrap one operation each.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::codec::{decode_eval, encode_eval, Eval};
use crate::error::ErrorCategory;
use crate::flags::{ExtraFlags, PositionFlags};
use crate::game::HeaderMap;
use crate::zobrist::{hash_position, PositionHash, ROOT_POSITION_HASH};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS positions (
         position_hash TEXT PRIMARY KEY NOT NULL
             CHECK (length(position_hash) = 32),
         flags INTEGER NOT NULL,
         extras TEXT NOT NULL,
         engine TEXT,
         game_hashes TEXT NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS games (
         game_hash TEXT PRIMARY KEY NOT NULL
             CHECK (length(game_hash) = 64),
         end_position TEXT REFERENCES positions (position_hash)
             CHECK (end_position IS NULL OR length(end_position) = 32),
         plies TEXT,
         headers TEXT NOT NULL,
         error_category INTEGER NOT NULL DEFAULT 0,
         error_pgn TEXT,
         error_message TEXT
     )",
    "CREATE INDEX IF NOT EXISTS games_end_position ON games (end_position)",
    "CREATE TABLE IF NOT EXISTS duplicate_games (
         game_hash TEXT PRIMARY KEY NOT NULL
             CHECK (length(game_hash) = 64),
         duplicate_of TEXT NOT NULL
             CHECK (length(duplicate_of) = 64),
         headers TEXT NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS moves (
         from_position TEXT NOT NULL REFERENCES positions (position_hash)
             CHECK (length(from_position) = 32),
         ply INTEGER NOT NULL,
         to_position TEXT NOT NULL REFERENCES positions (position_hash)
             CHECK (length(to_position) = 32),
         PRIMARY KEY (from_position, ply)
     )",
    "CREATE INDEX IF NOT EXISTS moves_to_position ON moves (to_position)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("flags mismatch at {hash}: stored {stored:?}, inserting {new:?}")]
    FlagsMismatch {
        hash: PositionHash,
        stored: PositionFlags,
        new: PositionFlags,
    },
    #[error("store is read-only")]
    ReadOnly,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity of a game: SHA-256 of the exact input text, 64 lowercase hex
/// characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GameHash([u8; 32]);

impl GameHash {
    pub fn of_text(text: &str) -> GameHash {
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        GameHash(bytes)
    }
}

impl fmt::Display for GameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GameHash(\"{self}\")")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid game hash {0:?}: expected 64 lowercase hex characters")]
pub struct ParseGameHashError(String);

impl FromStr for GameHash {
    type Err = ParseGameHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseGameHashError(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseGameHashError(s.to_string()))?;
            bytes[i] =
                u8::from_str_radix(hex, 16).map_err(|_| ParseGameHashError(s.to_string()))?;
        }
        Ok(GameHash(bytes))
    }
}

/// A vertex as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRecord {
    pub flags: PositionFlags,
    /// One entry per distinct kind of history that reached this board.
    pub extras: BTreeSet<ExtraFlags>,
    pub engine: Option<Eval>,
    /// Games whose play ends in this position.
    pub games: BTreeSet<GameHash>,
}

/// A game row. `plies` is `None` for error games (the sentinel), and
/// `error_text`/`error_message` are only kept for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRecord {
    pub end_position: Option<PositionHash>,
    pub plies: Option<Vec<u32>>,
    pub headers: HeaderMap,
    pub category: ErrorCategory,
    pub error_text: Option<String>,
    pub error_message: Option<String>,
}

impl GameRecord {
    pub fn is_ok(&self) -> bool {
        self.category.is_ok()
    }
}

/// Headers of a primary game merged with those of all its duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedHeaders {
    pub headers: HeaderMap,
    /// One record per conflicting key, as `key: 'kept'/'other'`.
    pub issues: BTreeSet<String>,
}

/// The graph database handle.
pub struct GraphStore {
    pool: SqlitePool,
    read_only: bool,
    // Lazily loaded ids of every known game (ok, error and duplicate),
    // kept for the lifetime of this handle.
    known_games: Mutex<Option<HashSet<GameHash>>>,
}

impl GraphStore {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<GraphStore> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        GraphStore::init(pool, false).await
    }

    /// Open an existing database without write access. Mutating operations
    /// either fail or, where documented, silently do nothing.
    pub async fn open_read_only(path: &Path) -> StoreResult<GraphStore> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        GraphStore::init(pool, true).await
    }

    /// Open a fresh in-memory database. Intended for tests.
    pub async fn open_in_memory() -> StoreResult<GraphStore> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        // A single long-lived connection: each SQLite connection gets its
        // own private in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        GraphStore::init(pool, false).await
    }

    async fn init(pool: SqlitePool, read_only: bool) -> StoreResult<GraphStore> {
        // Startup guard: the position hasher must still produce the pinned
        // root hash, otherwise every key in this database is wrong.
        let computed = hash_position(&shakmaty::Chess::default());
        if computed != ROOT_POSITION_HASH {
            return Err(StoreError::Corrupt(format!(
                "position hasher produced {computed} for the root position, expected {ROOT_POSITION_HASH}"
            )));
        }
        let store = GraphStore {
            pool,
            read_only,
            known_games: Mutex::new(None),
        };
        if !read_only {
            for statement in SCHEMA {
                sqlx::query(statement).execute(&store.pool).await?;
            }
            let mut tx = store.pool.begin().await?;
            ensure_root_in(&mut tx).await?;
            tx.commit().await?;
        }
        Ok(store)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Start a transaction for a composite operation.
    pub async fn begin(&self) -> StoreResult<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a vertex, or fold new observations into an existing one.
    /// Returns whether a row was created.
    pub async fn insert_position(
        &self,
        hash: PositionHash,
        flags: PositionFlags,
        extra: ExtraFlags,
        game: Option<GameHash>,
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let created = insert_position_in(&mut tx, hash, flags, extra, game).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_position(&self, hash: PositionHash) -> StoreResult<Option<PositionRecord>> {
        let row = sqlx::query(
            "SELECT flags, extras, engine, game_hashes FROM positions WHERE position_hash = ?",
        )
        .bind(hash.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_position_row(&row)).transpose()
    }

    /// Lazy scan over positions filtered by evaluation and game presence.
    /// Ordering is unspecified; `limit` of `None` means all rows.
    pub fn stream_positions(
        &self,
        has_eval: bool,
        has_game: bool,
        limit: Option<i64>,
    ) -> BoxStream<'_, StoreResult<(PositionHash, PositionRecord)>> {
        sqlx::query(
            "SELECT position_hash, flags, extras, engine, game_hashes FROM positions
             WHERE (engine IS NOT NULL) = ? AND (json_array_length(game_hashes) > 0) = ?
             LIMIT ?",
        )
        .bind(has_eval)
        .bind(has_game)
        .bind(limit.unwrap_or(-1))
        .fetch(&self.pool)
        .map(|row| {
            let row = row?;
            let hash = parse_position_hash(&row.try_get::<String, _>("position_hash")?)?;
            Ok((hash, decode_position_row(&row)?))
        })
        .boxed()
    }

    /// Attach an engine verdict to an existing vertex. Does nothing in
    /// read-only mode.
    pub async fn update_evaluation(&self, hash: PositionHash, eval: &Eval) -> StoreResult<()> {
        if self.read_only {
            tracing::debug!(position = %hash, "read-only store, dropping evaluation");
            return Ok(());
        }
        let result = sqlx::query("UPDATE positions SET engine = ? WHERE position_hash = ?")
            .bind(encode_eval(eval))
            .bind(hash.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!(
                "evaluation update for unknown position {hash}"
            )));
        }
        Ok(())
    }

    pub async fn get_game(&self, id: GameHash) -> StoreResult<Option<GameRecord>> {
        let row = sqlx::query(
            "SELECT end_position, plies, headers, error_category, error_pgn, error_message
             FROM games WHERE game_hash = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_game_row(&row)).transpose()
    }

    /// Record a game that failed ingestion, in its own transaction.
    pub async fn insert_game_error(
        &self,
        id: GameHash,
        headers: &HeaderMap,
        category: ErrorCategory,
        original_text: &str,
        message: &str,
    ) -> StoreResult<()> {
        // OR IGNORE: two racing loaders of the same text keep the first row.
        sqlx::query(
            "INSERT OR IGNORE INTO games
                 (game_hash, end_position, plies, headers, error_category, error_pgn, error_message)
             VALUES (?, NULL, NULL, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(serde_json::to_string(headers)?)
        .bind(i64::from(category.bits()))
        .bind(original_text)
        .bind(message)
        .execute(&self.pool)
        .await?;
        self.remember_game(id).await;
        Ok(())
    }

    pub fn stream_games(&self) -> BoxStream<'_, StoreResult<(GameHash, GameRecord)>> {
        sqlx::query(
            "SELECT game_hash, end_position, plies, headers, error_category, error_pgn,
                    error_message
             FROM games",
        )
        .fetch(&self.pool)
        .map(|row| {
            let row = row?;
            let id = parse_game_hash(&row.try_get::<String, _>("game_hash")?)?;
            Ok((id, decode_game_row(&row)?))
        })
        .boxed()
    }

    /// Ids of every row in the game relation (ok and error games alike).
    pub async fn all_game_ids(&self) -> StoreResult<BTreeSet<GameHash>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT game_hash FROM games")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|(id,)| parse_game_hash(&id)).collect()
    }

    /// Split the game relation into ok and error ids.
    pub async fn partition_games(&self) -> StoreResult<(BTreeSet<GameHash>, BTreeSet<GameHash>)> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT game_hash, error_category FROM games")
            .fetch_all(&self.pool)
            .await?;
        let mut ok = BTreeSet::new();
        let mut errors = BTreeSet::new();
        for (id, category) in rows {
            let id = parse_game_hash(&id)?;
            if category == 0 {
                ok.insert(id);
            } else {
                errors.insert(id);
            }
        }
        Ok((ok, errors))
    }

    /// Mark `duplicate` as a duplicate of `primary` in a single transaction.
    pub async fn insert_duplicate(
        &self,
        duplicate: GameHash,
        primary: GameHash,
        headers: &HeaderMap,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        insert_duplicate_in(&mut tx, duplicate, primary, headers).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_duplicate(
        &self,
        id: GameHash,
    ) -> StoreResult<Option<(GameHash, HeaderMap)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT duplicate_of, headers FROM duplicate_games WHERE game_hash = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(primary, headers)| {
            Ok((parse_game_hash(&primary)?, serde_json::from_str(&headers)?))
        })
        .transpose()
    }

    pub async fn all_duplicate_ids(&self) -> StoreResult<BTreeSet<GameHash>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT game_hash FROM duplicate_games")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|(id,)| parse_game_hash(&id)).collect()
    }

    /// Follow the duplicate chain from `id` until it lands on a game row.
    pub async fn find_top_primary(&self, id: GameHash) -> StoreResult<GameHash> {
        let mut current = id;
        let mut visited = HashSet::new();
        while let Some((primary, _)) = self.get_duplicate(current).await? {
            if !visited.insert(current) {
                return Err(StoreError::Corrupt(format!(
                    "duplicate chain starting at {id} loops at {current}"
                )));
            }
            current = primary;
        }
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM games WHERE game_hash = ?")
            .bind(current.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::Corrupt(format!(
                "duplicate chain starting at {id} ends at {current}, which is not a game"
            )));
        }
        Ok(current)
    }

    /// Every game marked, directly or through a chain, as a duplicate of
    /// `primary`.
    pub async fn duplicates_of(&self, primary: GameHash) -> StoreResult<BTreeSet<GameHash>> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![primary];
        while let Some(parent) = frontier.pop() {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT game_hash FROM duplicate_games WHERE duplicate_of = ?")
                    .bind(parent.to_string())
                    .fetch_all(&self.pool)
                    .await?;
            for (id,) in rows {
                let id = parse_game_hash(&id)?;
                if found.insert(id) {
                    frontier.push(id);
                }
            }
        }
        Ok(found)
    }

    /// Merge the headers of a primary game with those of all its duplicates.
    ///
    /// Keys present on one side only are taken as-is. Conflicting values are
    /// joined with ` | ` (except `result`, which collapses to `*`), and each
    /// conflict is recorded in the issues set.
    pub async fn merged_headers(&self, primary: GameHash) -> StoreResult<MergedHeaders> {
        let game = self.get_game(primary).await?.ok_or_else(|| {
            StoreError::Corrupt(format!("merged headers requested for unknown game {primary}"))
        })?;
        let mut merged = MergedHeaders {
            headers: game.headers,
            issues: BTreeSet::new(),
        };
        for duplicate in self.duplicates_of(primary).await? {
            let Some((_, headers)) = self.get_duplicate(duplicate).await? else {
                continue;
            };
            merge_headers_into(&mut merged, &headers);
        }
        Ok(merged)
    }

    /// Record an edge in its own transaction.
    pub async fn insert_edge(
        &self,
        from: PositionHash,
        ply: u32,
        to: PositionHash,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        insert_edge_in(&mut tx, from, ply, to).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Outgoing edges of a vertex, ordered by encoded ply.
    pub async fn edges_from(&self, hash: PositionHash) -> StoreResult<Vec<(u32, PositionHash)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT ply, to_position FROM moves WHERE from_position = ? ORDER BY ply")
                .bind(hash.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(ply, to)| Ok((decode_stored_ply(ply)?, parse_position_hash(&to)?)))
            .collect()
    }

    /// The first incoming edge of a vertex, deterministic given the stored
    /// rows. Used by the backward walk of the FEN reconstructor.
    pub async fn parent_edge(
        &self,
        to: PositionHash,
    ) -> StoreResult<Option<(PositionHash, u32)>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT from_position, ply FROM moves WHERE to_position = ?
             ORDER BY from_position, ply LIMIT 1",
        )
        .bind(to.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(from, ply)| Ok((parse_position_hash(&from)?, decode_stored_ply(ply)?)))
            .transpose()
    }

    /// Every edge in the graph. Used by maintenance traversals.
    pub async fn all_edges(&self) -> StoreResult<Vec<(PositionHash, u32, PositionHash)>> {
        let rows: Vec<(String, i64, String)> =
            sqlx::query_as("SELECT from_position, ply, to_position FROM moves")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(from, ply, to)| {
                Ok((
                    parse_position_hash(&from)?,
                    decode_stored_ply(ply)?,
                    parse_position_hash(&to)?,
                ))
            })
            .collect()
    }

    /// Positions with at least two outgoing edges, grouped by out-degree.
    /// With `skip_evaluated`, positions that already carry a verdict are
    /// left out.
    pub async fn branching_positions(
        &self,
        skip_evaluated: bool,
    ) -> StoreResult<BTreeMap<usize, BTreeMap<PositionHash, BTreeMap<u32, PositionHash>>>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT m.from_position, m.ply, m.to_position
             FROM moves m JOIN positions p ON p.position_hash = m.from_position
             WHERE ? = 0 OR p.engine IS NULL
             ORDER BY m.from_position, m.ply",
        )
        .bind(i64::from(skip_evaluated))
        .fetch_all(&self.pool)
        .await?;
        let mut per_position: BTreeMap<PositionHash, BTreeMap<u32, PositionHash>> = BTreeMap::new();
        for (from, ply, to) in rows {
            per_position
                .entry(parse_position_hash(&from)?)
                .or_default()
                .insert(decode_stored_ply(ply)?, parse_position_hash(&to)?);
        }
        let mut grouped: BTreeMap<usize, BTreeMap<PositionHash, BTreeMap<u32, PositionHash>>> =
            BTreeMap::new();
        for (from, edges) in per_position {
            if edges.len() >= 2 {
                grouped.entry(edges.len()).or_default().insert(from, edges);
            }
        }
        Ok(grouped)
    }

    /// Destructive reset: empty all four relations and re-seed the root
    /// vertex. Refused on read-only handles.
    pub async fn wipe_data(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut tx = self.begin().await?;
        for table in ["moves", "duplicate_games", "games", "positions"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        ensure_root_in(&mut tx).await?;
        tx.commit().await?;
        // Shrink the underlying file; VACUUM cannot run inside the
        // transaction above.
        sqlx::query("VACUUM").execute(&self.pool).await?;
        *self.known_games.lock().await = None;
        Ok(())
    }

    /// Whether a game id is already recorded, as a game or a duplicate.
    /// Backed by a cache loaded on first use; callers still re-check inside
    /// their transaction to close the race.
    pub async fn known_game(&self, id: GameHash) -> StoreResult<bool> {
        let mut guard = self.known_games.lock().await;
        if guard.is_none() {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT game_hash FROM games UNION SELECT game_hash FROM duplicate_games",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut set = HashSet::with_capacity(rows.len());
            for (id,) in rows {
                set.insert(parse_game_hash(&id)?);
            }
            tracing::debug!(games = set.len(), "loaded known game ids");
            *guard = Some(set);
        }
        Ok(guard.as_ref().is_some_and(|set| set.contains(&id)))
    }

    pub(crate) async fn remember_game(&self, id: GameHash) {
        if let Some(set) = self.known_games.lock().await.as_mut() {
            set.insert(id);
        }
    }
}

/// Insert or fold a vertex inside an open transaction. Flags must match any
/// stored row exactly; extras and game links grow set-union style.
pub async fn insert_position_in(
    tx: &mut Transaction<'_, Sqlite>,
    hash: PositionHash,
    flags: PositionFlags,
    extra: ExtraFlags,
    game: Option<GameHash>,
) -> StoreResult<bool> {
    let conn: &mut SqliteConnection = tx;
    let row: Option<(i64, String, String)> = sqlx::query_as(
        "SELECT flags, extras, game_hashes FROM positions WHERE position_hash = ?",
    )
    .bind(hash.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        None => {
            let extras = vec![extra.bits()];
            let games: Vec<String> = game.iter().map(GameHash::to_string).collect();
            sqlx::query(
                "INSERT INTO positions (position_hash, flags, extras, engine, game_hashes)
                 VALUES (?, ?, ?, NULL, ?)",
            )
            .bind(hash.to_string())
            .bind(i64::from(flags.bits()))
            .bind(serde_json::to_string(&extras)?)
            .bind(serde_json::to_string(&games)?)
            .execute(&mut *conn)
            .await?;
            Ok(true)
        }
        Some((stored_flags, extras_json, games_json)) => {
            let stored = PositionFlags::from_bits(stored_flags as u32);
            if stored != flags {
                return Err(StoreError::FlagsMismatch {
                    hash,
                    stored,
                    new: flags,
                });
            }
            let mut extras: BTreeSet<u32> = serde_json::from_str(&extras_json)?;
            let mut games: BTreeSet<String> = serde_json::from_str(&games_json)?;
            let grew_extras = extras.insert(extra.bits());
            let grew_games = match game {
                Some(game) => games.insert(game.to_string()),
                None => false,
            };
            if grew_extras || grew_games {
                sqlx::query(
                    "UPDATE positions SET extras = ?, game_hashes = ? WHERE position_hash = ?",
                )
                .bind(serde_json::to_string(&extras)?)
                .bind(serde_json::to_string(&games)?)
                .bind(hash.to_string())
                .execute(&mut *conn)
                .await?;
            }
            Ok(false)
        }
    }
}

/// Record an edge inside an open transaction. A second insert with the same
/// key must agree on the destination; the chess rules guarantee it does.
pub async fn insert_edge_in(
    tx: &mut Transaction<'_, Sqlite>,
    from: PositionHash,
    ply: u32,
    to: PositionHash,
) -> StoreResult<()> {
    let conn: &mut SqliteConnection = tx;
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT to_position FROM moves WHERE from_position = ? AND ply = ?")
            .bind(from.to_string())
            .bind(i64::from(ply))
            .fetch_optional(&mut *conn)
            .await?;
    match existing {
        Some((stored,)) => {
            if parse_position_hash(&stored)? != to {
                return Err(StoreError::Corrupt(format!(
                    "edge ({from}, {ply}) already points at {stored}, not {to}"
                )));
            }
            Ok(())
        }
        None => {
            sqlx::query("INSERT INTO moves (from_position, ply, to_position) VALUES (?, ?, ?)")
                .bind(from.to_string())
                .bind(i64::from(ply))
                .bind(to.to_string())
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
    }
}

/// Insert an ok game row inside an open transaction.
pub async fn insert_game_ok_in(
    tx: &mut Transaction<'_, Sqlite>,
    id: GameHash,
    end_position: PositionHash,
    plies: &[u32],
    headers: &HeaderMap,
) -> StoreResult<()> {
    let conn: &mut SqliteConnection = tx;
    sqlx::query(
        "INSERT INTO games (game_hash, end_position, plies, headers, error_category)
         VALUES (?, ?, ?, ?, 0)",
    )
    .bind(id.to_string())
    .bind(end_position.to_string())
    .bind(serde_json::to_string(plies)?)
    .bind(serde_json::to_string(headers)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Mark a duplicate inside an open transaction: inserts the duplicate row
/// and removes the game row in the same unit.
pub async fn insert_duplicate_in(
    tx: &mut Transaction<'_, Sqlite>,
    duplicate: GameHash,
    primary: GameHash,
    headers: &HeaderMap,
) -> StoreResult<()> {
    let conn: &mut SqliteConnection = tx;
    sqlx::query("INSERT INTO duplicate_games (game_hash, duplicate_of, headers) VALUES (?, ?, ?)")
        .bind(duplicate.to_string())
        .bind(primary.to_string())
        .bind(serde_json::to_string(headers)?)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM games WHERE game_hash = ?")
        .bind(duplicate.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Whether a game id exists in the game or duplicate relation, read inside
/// the open transaction.
pub async fn game_known_in(
    tx: &mut Transaction<'_, Sqlite>,
    id: GameHash,
) -> StoreResult<bool> {
    let conn: &mut SqliteConnection = tx;
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM games WHERE game_hash = ?1
         UNION SELECT 1 FROM duplicate_games WHERE game_hash = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.is_some())
}

async fn ensure_root_in(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<()> {
    let flags = PositionFlags::of(&shakmaty::Chess::default());
    insert_position_in(tx, ROOT_POSITION_HASH, flags, ExtraFlags::empty(), None).await?;
    Ok(())
}

fn merge_headers_into(merged: &mut MergedHeaders, other: &HeaderMap) {
    for (key, value) in other {
        match merged.headers.get(key) {
            None => {
                merged.headers.insert(key.clone(), value.clone());
            }
            Some(existing) if existing.eq_ignore_ascii_case(value) => {}
            Some(existing) => {
                merged
                    .issues
                    .insert(format!("{key}: '{existing}'/'{value}'"));
                let replacement = if key == "result" {
                    "*".to_string()
                } else {
                    format!("{existing} | {value}")
                };
                merged.headers.insert(key.clone(), replacement);
            }
        }
    }
}

fn parse_position_hash(text: &str) -> StoreResult<PositionHash> {
    text.parse()
        .map_err(|err: crate::zobrist::ParsePositionHashError| StoreError::Corrupt(err.to_string()))
}

fn parse_game_hash(text: &str) -> StoreResult<GameHash> {
    text.parse()
        .map_err(|err: ParseGameHashError| StoreError::Corrupt(err.to_string()))
}

fn decode_stored_ply(ply: i64) -> StoreResult<u32> {
    u32::try_from(ply).map_err(|_| StoreError::Corrupt(format!("stored ply {ply} out of range")))
}

fn decode_position_row(row: &SqliteRow) -> StoreResult<PositionRecord> {
    let flags = PositionFlags::from_bits(row.try_get::<i64, _>("flags")? as u32);
    let extras: BTreeSet<u32> = serde_json::from_str(&row.try_get::<String, _>("extras")?)?;
    let engine = row
        .try_get::<Option<String>, _>("engine")?
        .map(|text| decode_eval(&text).map_err(|err| StoreError::Corrupt(err.to_string())))
        .transpose()?;
    let games: BTreeSet<String> = serde_json::from_str(&row.try_get::<String, _>("game_hashes")?)?;
    Ok(PositionRecord {
        flags,
        extras: extras.into_iter().map(ExtraFlags::from_bits).collect(),
        engine,
        games: games
            .iter()
            .map(|id| parse_game_hash(id))
            .collect::<StoreResult<_>>()?,
    })
}

fn decode_game_row(row: &SqliteRow) -> StoreResult<GameRecord> {
    let end_position = row
        .try_get::<Option<String>, _>("end_position")?
        .map(|hash| parse_position_hash(&hash))
        .transpose()?;
    let plies = row
        .try_get::<Option<String>, _>("plies")?
        .map(|json| serde_json::from_str::<Vec<u32>>(&json))
        .transpose()?;
    let headers: HeaderMap = serde_json::from_str(&row.try_get::<String, _>("headers")?)?;
    Ok(GameRecord {
        end_position,
        plies,
        headers,
        category: ErrorCategory::from_bits(row.try_get::<i64, _>("error_category")? as u32),
        error_text: row.try_get("error_pgn")?,
        error_message: row.try_get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_id(tag: &str) -> GameHash {
        GameHash::of_text(tag)
    }

    fn position_hash(n: u128) -> PositionHash {
        PositionHash(n)
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn store() -> GraphStore {
        GraphStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn root_position_is_seeded() {
        let store = store().await;
        let root = store.get_position(ROOT_POSITION_HASH).await.unwrap().unwrap();
        assert_eq!(root.flags, PositionFlags::WHITE_TO_MOVE);
        assert_eq!(root.extras, BTreeSet::from([ExtraFlags::empty()]));
        assert!(root.engine.is_none());
        assert!(root.games.is_empty());
    }

    #[tokio::test]
    async fn insert_position_folds_observations() {
        let store = store().await;
        let hash = position_hash(0xabc);
        let flags = PositionFlags::BLACK_TO_MOVE;

        let created = store
            .insert_position(hash, flags, ExtraFlags::empty(), None)
            .await
            .unwrap();
        assert!(created);

        let mut extra = ExtraFlags::empty();
        extra.insert(ExtraFlags::THREEFOLD);
        let game = game_id("g1");
        let created = store
            .insert_position(hash, flags, extra, Some(game))
            .await
            .unwrap();
        assert!(!created);

        let record = store.get_position(hash).await.unwrap().unwrap();
        assert_eq!(record.flags, flags);
        assert_eq!(
            record.extras,
            BTreeSet::from([ExtraFlags::empty(), ExtraFlags::THREEFOLD])
        );
        assert_eq!(record.games, BTreeSet::from([game]));
    }

    #[tokio::test]
    async fn insert_position_rejects_flag_drift() {
        let store = store().await;
        let hash = position_hash(0xabc);
        store
            .insert_position(hash, PositionFlags::WHITE_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();
        let err = store
            .insert_position(hash, PositionFlags::BLACK_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FlagsMismatch { .. }));
    }

    #[tokio::test]
    async fn edges_are_immutable_and_deterministic() {
        let store = store().await;
        let a = position_hash(1);
        let b = position_hash(2);
        let c = position_hash(3);
        for hash in [a, b, c] {
            store
                .insert_position(hash, PositionFlags::WHITE_TO_MOVE, ExtraFlags::empty(), None)
                .await
                .unwrap();
        }
        store.insert_edge(a, 100, b).await.unwrap();
        store.insert_edge(a, 100, b).await.unwrap();
        store.insert_edge(a, 200, c).await.unwrap();

        let err = store.insert_edge(a, 100, c).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));

        assert_eq!(store.edges_from(a).await.unwrap(), vec![(100, b), (200, c)]);
        assert_eq!(store.parent_edge(b).await.unwrap(), Some((a, 100)));
        assert_eq!(store.parent_edge(a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn edges_require_existing_positions() {
        let store = store().await;
        let err = store
            .insert_edge(position_hash(0x111), 100, position_hash(0x222))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn evaluation_updates_round_trip() {
        let store = store().await;
        let eval = Eval {
            depth: 20,
            best: 1228,
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

        let err = store
            .update_evaluation(position_hash(0xdead), &eval)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn game_rows_partition_by_category() {
        let store = store().await;
        let end = position_hash(0x10);
        store
            .insert_position(end, PositionFlags::BLACK_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();

        let ok_id = game_id("ok");
        let mut tx = store.begin().await.unwrap();
        insert_game_ok_in(&mut tx, ok_id, end, &[816], &headers(&[("result", "1-0")]))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err_id = game_id("broken");
        store
            .insert_game_error(
                err_id,
                &headers(&[]),
                ErrorCategory::INVALID_MOVE,
                "1. zz9",
                "illegal move zz9",
            )
            .await
            .unwrap();

        let game = store.get_game(ok_id).await.unwrap().unwrap();
        assert!(game.is_ok());
        assert_eq!(game.end_position, Some(end));
        assert_eq!(game.plies, Some(vec![816]));

        let game = store.get_game(err_id).await.unwrap().unwrap();
        assert!(!game.is_ok());
        assert_eq!(game.category, ErrorCategory::INVALID_MOVE);
        assert_eq!(game.plies, None);
        assert_eq!(game.error_text.as_deref(), Some("1. zz9"));

        let (ok, errors) = store.partition_games().await.unwrap();
        assert_eq!(ok, BTreeSet::from([ok_id]));
        assert_eq!(errors, BTreeSet::from([err_id]));
        assert_eq!(store.all_game_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn known_game_cache_tracks_inserts() {
        let store = store().await;
        let id = game_id("cached");
        assert!(!store.known_game(id).await.unwrap());
        store
            .insert_game_error(id, &headers(&[]), ErrorCategory::EMPTY_GAME, "", "no moves")
            .await
            .unwrap();
        assert!(store.known_game(id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicates_move_games_and_chains_resolve() {
        let store = store().await;
        let end = position_hash(0x20);
        store
            .insert_position(end, PositionFlags::WHITE_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();
        let a = game_id("a");
        let b = game_id("b");
        let c = game_id("c");
        for id in [a, b, c] {
            let mut tx = store.begin().await.unwrap();
            insert_game_ok_in(&mut tx, id, end, &[816], &headers(&[("event", "x")]))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        store
            .insert_duplicate(b, a, &headers(&[("event", "x")]))
            .await
            .unwrap();
        store
            .insert_duplicate(c, b, &headers(&[("event", "x")]))
            .await
            .unwrap();

        assert!(store.get_game(b).await.unwrap().is_none());
        assert!(store.get_game(c).await.unwrap().is_none());
        assert_eq!(store.get_duplicate(b).await.unwrap().unwrap().0, a);
        assert_eq!(store.find_top_primary(c).await.unwrap(), a);
        assert_eq!(store.find_top_primary(a).await.unwrap(), a);
        assert_eq!(
            store.duplicates_of(a).await.unwrap(),
            BTreeSet::from([b, c])
        );
        assert_eq!(
            store.all_duplicate_ids().await.unwrap(),
            BTreeSet::from([b, c])
        );
    }

    #[tokio::test]
    async fn merged_headers_follow_the_conflict_policy() {
        let store = store().await;
        let end = position_hash(0x30);
        store
            .insert_position(end, PositionFlags::WHITE_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();
        let primary = game_id("primary");
        let duplicate = game_id("duplicate");
        for (id, white, result) in [(primary, "Kasparov, Garry", "0-1"), (duplicate, "another", "1-0")]
        {
            let mut tx = store.begin().await.unwrap();
            insert_game_ok_in(
                &mut tx,
                id,
                end,
                &[816],
                &headers(&[
                    ("white", white),
                    ("result", result),
                    ("site", "Frankfurt"),
                    ("round", "7"),
                ]),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        let dup_headers = store.get_game(duplicate).await.unwrap().unwrap().headers;
        store
            .insert_duplicate(duplicate, primary, &dup_headers)
            .await
            .unwrap();

        let merged = store.merged_headers(primary).await.unwrap();
        assert_eq!(
            merged.headers.get("white").unwrap(),
            "Kasparov, Garry | another"
        );
        assert_eq!(merged.headers.get("result").unwrap(), "*");
        assert_eq!(merged.headers.get("site").unwrap(), "Frankfurt");
        assert!(merged
            .issues
            .contains("white: 'Kasparov, Garry'/'another'"));
        assert!(merged.issues.contains("result: '0-1'/'1-0'"));
        assert_eq!(merged.issues.len(), 2);
    }

    #[tokio::test]
    async fn branching_positions_group_by_out_degree() {
        let store = store().await;
        let b = position_hash(2);
        let c = position_hash(3);
        for hash in [b, c] {
            store
                .insert_position(hash, PositionFlags::BLACK_TO_MOVE, ExtraFlags::empty(), None)
                .await
                .unwrap();
        }
        store.insert_edge(ROOT_POSITION_HASH, 816, b).await.unwrap();
        store.insert_edge(ROOT_POSITION_HASH, 1228, c).await.unwrap();
        store.insert_edge(b, 5244, c).await.unwrap();

        let grouped = store.branching_positions(false).await.unwrap();
        assert_eq!(grouped.len(), 1);
        let two_way = grouped.get(&2).unwrap();
        assert_eq!(
            two_way.get(&ROOT_POSITION_HASH).unwrap(),
            &BTreeMap::from([(816, b), (1228, c)])
        );

        // Once evaluated, the root drops out of the filtered view.
        store
            .update_evaluation(
                ROOT_POSITION_HASH,
                &Eval {
                    depth: 4,
                    best: 1228,
                    mate: 0,
                    score: 33,
                },
            )
            .await
            .unwrap();
        assert!(store.branching_positions(true).await.unwrap().is_empty());
        assert_eq!(store.branching_positions(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_positions_filters() {
        let store = store().await;
        let with_game = position_hash(0x40);
        store
            .insert_position(
                with_game,
                PositionFlags::BLACK_TO_MOVE,
                ExtraFlags::empty(),
                Some(game_id("g")),
            )
            .await
            .unwrap();

        let rows: Vec<_> = store
            .stream_positions(false, true, None)
            .collect::<Vec<_>>()
            .await;
        let rows: Vec<_> = rows.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, with_game);

        let rows: Vec<_> = store
            .stream_positions(false, false, Some(1))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(rows.len(), 1);

        let rows: Vec<_> = store
            .stream_positions(true, false, None)
            .collect::<Vec<_>>()
            .await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn wipe_data_resets_to_the_seeded_state() {
        let store = store().await;
        let b = position_hash(2);
        store
            .insert_position(b, PositionFlags::BLACK_TO_MOVE, ExtraFlags::empty(), None)
            .await
            .unwrap();
        store.insert_edge(ROOT_POSITION_HASH, 816, b).await.unwrap();
        store.wipe_data().await.unwrap();

        assert!(store.get_position(b).await.unwrap().is_none());
        assert!(store
            .get_position(ROOT_POSITION_HASH)
            .await
            .unwrap()
            .is_some());
        assert!(store.all_edges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_store_drops_evaluations_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.db");
        {
            let rw = GraphStore::open(&path).await.unwrap();
            rw.insert_position(
                position_hash(7),
                PositionFlags::WHITE_TO_MOVE,
                ExtraFlags::empty(),
                None,
            )
            .await
            .unwrap();
        }
        let ro = GraphStore::open_read_only(&path).await.unwrap();
        assert!(ro.is_read_only());
        let eval = Eval {
            depth: 4,
            best: 816,
            mate: 0,
            score: 10,
        };
        ro.update_evaluation(position_hash(7), &eval).await.unwrap();
        let record = ro.get_position(position_hash(7)).await.unwrap().unwrap();
        assert!(record.engine.is_none());
        assert!(matches!(ro.wipe_data().await, Err(StoreError::ReadOnly)));
    }

    #[test]
    fn game_hash_parses_and_orders() {
        let id = GameHash::of_text("1. a3 *");
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<GameHash>().unwrap(), id);
        assert!("abc".parse::<GameHash>().is_err());

        let a: GameHash =
            "0000000000000000000000000000000000000000000000000000000000000001".parse().unwrap();
        let b: GameHash =
            "ff00000000000000000000000000000000000000000000000000000000000000".parse().unwrap();
        assert!(a < b);
    }
}
