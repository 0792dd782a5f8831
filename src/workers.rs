//! The engine evaluation pool.
//!
//! A fixed set of workers, each owning one engine subprocess and one store
//! handle, drains a shared queue of position-hash batches. Workers fail fast
//! on engine or I/O trouble; the pool keeps going and reports how much got
//! done. One sentinel per worker marks shutdown, and every queue take and
//! every join is bounded by the configured timeout.
//!
//! With a single worker the loop runs inline on the caller, which keeps the
//! whole path deterministic under test.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chessgraph_uci::UciEngine;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::codec::{encode_eval, encode_uci_str, CodecError, Eval};
use crate::fen::reconstruct_position;
use crate::store::{GraphStore, StoreError};
use crate::zobrist::PositionHash;

/// Engines below this depth return noise.
pub const MIN_EVAL_DEPTH: u32 = 3;
pub const MAX_WORKERS: usize = 32;

// Cap on hashes per queue item, so the queue stays short even for very
// large job lists.
const BATCH_DIVISOR: usize = 10_000;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] chessgraph_uci::EngineError),
    #[error("bad engine reply: {0}")]
    Codec(#[from] CodecError),
}

/// Pool parameters.
#[derive(Debug, Clone)]
pub struct EvalPoolConfig {
    /// Parallel workers, 1..=32. One means inline execution.
    pub workers: usize,
    /// Search depth in plies, at least [`MIN_EVAL_DEPTH`].
    pub depth: u32,
    /// Engine binary to spawn, e.g. `stockfish`.
    pub engine_command: String,
    /// Bound on queue takes and on joining a worker.
    pub task_timeout: Duration,
    /// Directory for the per-worker log files.
    pub log_dir: PathBuf,
}

impl EvalPoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(PoolError::InvalidConfig(format!(
                "worker count {} not in 1..={MAX_WORKERS}",
                self.workers
            )));
        }
        if self.depth < MIN_EVAL_DEPTH {
            return Err(PoolError::InvalidConfig(format!(
                "depth {} below minimum {MIN_EVAL_DEPTH}",
                self.depth
            )));
        }
        if self.engine_command.trim().is_empty() {
            return Err(PoolError::InvalidConfig("empty engine command".to_string()));
        }
        Ok(())
    }
}

enum QueueItem {
    Batch(Vec<PositionHash>),
    Sentinel,
}

/// Evaluate `jobs` and attach the verdicts to their vertices. Returns the
/// number of positions processed.
pub async fn evaluate_positions(
    store: Arc<GraphStore>,
    jobs: Vec<PositionHash>,
    config: &EvalPoolConfig,
) -> Result<u64, PoolError> {
    config.validate()?;
    if jobs.is_empty() {
        return Ok(0);
    }
    tokio::fs::create_dir_all(&config.log_dir).await?;

    let batch_size = jobs.len() / BATCH_DIVISOR + 1;
    let batches = jobs.len().div_ceil(batch_size);
    // Everything is enqueued up front; capacity covers batches + sentinels
    // (one per worker, plus the retries posted while joining).
    let (queue_tx, queue_rx) = mpsc::channel(batches + 2 * config.workers);
    for chunk in jobs.chunks(batch_size) {
        queue_tx
            .send(QueueItem::Batch(chunk.to_vec()))
            .await
            .expect("queue capacity covers all batches");
    }
    for _ in 0..config.workers {
        queue_tx
            .send(QueueItem::Sentinel)
            .await
            .expect("queue capacity covers all sentinels");
    }
    let queue = Arc::new(Mutex::new(queue_rx));
    let done = Arc::new(AtomicU64::new(0));

    tracing::info!(
        jobs = jobs.len(),
        batches,
        workers = config.workers,
        depth = config.depth,
        "starting evaluation workers"
    );

    if config.workers == 1 {
        worker_loop(0, store, queue, done.clone(), config.clone()).await?;
        return Ok(done.load(Ordering::Acquire));
    }

    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let store = store.clone();
        let queue = queue.clone();
        let done = done.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, store, queue, done, config).await
        }));
    }

    for (worker_id, mut handle) in handles.into_iter().enumerate() {
        let mut joined = timeout(config.task_timeout, &mut handle).await;
        if joined.is_err() {
            // A worker stuck on the queue missed its sentinel; post another
            // and give it one more timeout.
            let _ = queue_tx.try_send(QueueItem::Sentinel);
            joined = timeout(config.task_timeout, &mut handle).await;
        }
        match joined {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                tracing::error!(worker_id, "worker failed: {err}");
            }
            Ok(Err(join_err)) => {
                tracing::error!(worker_id, "worker panicked: {join_err}");
            }
            Err(_) => {
                tracing::error!(worker_id, "worker did not stop, aborting it");
                handle.abort();
            }
        }
    }
    drop(queue_tx);

    Ok(done.load(Ordering::Acquire))
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<GraphStore>,
    queue: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    done: Arc<AtomicU64>,
    config: EvalPoolConfig,
) -> Result<(), PoolError> {
    let mut log = WorkerLog::open(&config.log_dir.join(format!("worker-{worker_id:02}.log")))
        .await?;
    log.line(&format!(
        "starting worker #{worker_id} @ {}",
        chrono::Utc::now().format("%Y/%b/%d-%H:%M:%S-UTC")
    ))
    .await?;

    let mut engine = UciEngine::spawn(&config.engine_command).await?;
    tracing::info!(worker_id, engine = engine.name.as_deref(), "worker started");

    loop {
        let item = {
            let mut rx = queue.lock().await;
            match timeout(config.task_timeout, rx.recv()).await {
                Err(_) => {
                    log.line(&format!("worker #{worker_id} queue take timed out, exiting"))
                        .await?;
                    break;
                }
                Ok(None) => break,
                Ok(Some(item)) => item,
            }
        };
        let batch = match item {
            QueueItem::Sentinel => {
                log.line(&format!("worker #{worker_id} received sentinel, exiting"))
                    .await?;
                break;
            }
            QueueItem::Batch(batch) => batch,
        };
        for hash in batch {
            let started = Instant::now();
            let rebuilt = reconstruct_position(&store, hash).await?;
            let rebuilt_secs = started.elapsed().as_secs();
            match engine.analyse(&rebuilt.fen, config.depth).await? {
                Some(analysis) => {
                    let eval = Eval {
                        depth: analysis.depth,
                        best: encode_uci_str(&analysis.best_uci)?,
                        mate: analysis.mate,
                        score: analysis.score,
                    };
                    store.update_evaluation(hash, &eval).await?;
                    log.line(&format!(
                        "{hash} ({} @{rebuilt_secs}s) => {} @{}s",
                        rebuilt.fen,
                        encode_eval(&eval),
                        started.elapsed().as_secs()
                    ))
                    .await?;
                }
                None => {
                    // Terminal position: nothing to store.
                    log.line(&format!("{hash} ({} @{rebuilt_secs}s) => none", rebuilt.fen))
                        .await?;
                }
            }
            done.fetch_add(1, Ordering::AcqRel);
        }
    }

    engine.quit().await.ok();
    Ok(())
}

// Append-only, line-buffered worker log.
struct WorkerLog {
    file: tokio::fs::File,
}

impl WorkerLog {
    async fn open(path: &Path) -> Result<WorkerLog, PoolError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(WorkerLog { file })
    }

    async fn line(&mut self, text: &str) -> Result<(), PoolError> {
        self.file.write_all(text.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// Hashes of final positions (a game ends there) still lacking a verdict.
pub async fn final_position_jobs(
    store: &GraphStore,
    limit: Option<i64>,
) -> Result<Vec<PositionHash>, StoreError> {
    let mut jobs = Vec::new();
    let mut positions = store.stream_positions(false, true, limit);
    while let Some(row) = positions.next().await {
        jobs.push(row?.0);
    }
    Ok(jobs)
}

/// Hashes of positions with two or more continuations and no verdict yet.
pub async fn branching_position_jobs(
    store: &GraphStore,
) -> Result<Vec<PositionHash>, StoreError> {
    let grouped = store.branching_positions(true).await?;
    let mut jobs = Vec::new();
    for (_, per_position) in grouped.iter().rev() {
        jobs.extend(per_position.keys().copied());
    }
    Ok(jobs)
}
