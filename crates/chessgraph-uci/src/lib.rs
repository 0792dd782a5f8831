//! Minimal async client for UCI chess engines.
//!
//! Spawns the engine binary as a child process and speaks just enough of the
//! protocol for batch analysis: handshake, `position fen`, `go depth`, and
//! the `info`/`bestmove` replies. One client owns one engine process; the
//! process is killed when the client is dropped.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine closed its output stream")]
    Terminated,
    #[error("engine protocol error: {0}")]
    Protocol(String),
}

/// The engine's answer for one position.
///
/// `mate` is signed and relative to the side to move; `score` is centipawns
/// and only meaningful when `mate` is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub depth: u32,
    pub best_uci: String,
    pub mate: i32,
    pub score: i32,
}

/// A running engine process.
pub struct UciEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    pub name: Option<String>,
}

impl UciEngine {
    /// Spawn `command` and run the UCI handshake.
    pub async fn spawn(command: &str) -> Result<UciEngine, EngineError> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("no stdout pipe".to_string()))?;
        let mut engine = UciEngine {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            name: None,
        };

        engine.send("uci").await?;
        loop {
            let line = engine.read_line().await?;
            if let Some(name) = line.strip_prefix("id name ") {
                engine.name = Some(name.trim().to_string());
            }
            if line.trim() == "uciok" {
                break;
            }
        }
        engine.send("setoption name MultiPV value 1").await?;
        engine.send("isready").await?;
        loop {
            if engine.read_line().await?.trim() == "readyok" {
                break;
            }
        }
        tracing::debug!(name = engine.name.as_deref(), "engine ready");
        Ok(engine)
    }

    /// Analyse a position to `depth`.
    ///
    /// Returns `None` for terminal positions, where the engine has no move
    /// to suggest (`bestmove (none)`).
    pub async fn analyse(
        &mut self,
        fen: &str,
        depth: u32,
    ) -> Result<Option<Analysis>, EngineError> {
        self.send(&format!("position fen {fen}")).await?;
        self.send(&format!("go depth {depth}")).await?;

        let mut last_depth = 0u32;
        let mut mate = 0i32;
        let mut score = 0i32;
        loop {
            let line = self.read_line().await?;
            let line = line.trim();
            if line.starts_with("info ") {
                if let Some(info) = parse_info_line(line) {
                    last_depth = info.depth;
                    match info.score {
                        InfoScore::Centipawns(cp) => {
                            mate = 0;
                            score = cp;
                        }
                        InfoScore::Mate(m) => {
                            mate = m;
                            score = 0;
                        }
                    }
                }
            } else if let Some(rest) = line.strip_prefix("bestmove") {
                let best = rest.split_whitespace().next().unwrap_or_default();
                if best.is_empty() || best == "(none)" {
                    return Ok(None);
                }
                return Ok(Some(Analysis {
                    depth: last_depth,
                    best_uci: best.to_string(),
                    mate,
                    score,
                }));
            }
        }
    }

    /// Ask the engine to quit and wait for the process to end.
    pub async fn quit(mut self) -> Result<(), EngineError> {
        self.send("quit").await.ok();
        self.child.wait().await?;
        Ok(())
    }

    async fn send(&mut self, line: &str) -> Result<(), EngineError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, EngineError> {
        self.stdout
            .next_line()
            .await?
            .ok_or(EngineError::Terminated)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum InfoScore {
    Centipawns(i32),
    Mate(i32),
}

#[derive(Debug, PartialEq, Eq)]
struct InfoLine {
    depth: u32,
    score: InfoScore,
}

// Pull depth and score out of an `info` line; lines without a score (e.g.
// currmove reports) are ignored.
fn parse_info_line(line: &str) -> Option<InfoLine> {
    let mut tokens = line.split_whitespace().peekable();
    let mut depth = None;
    let mut score = None;
    while let Some(token) = tokens.next() {
        match token {
            "depth" => {
                depth = tokens.next().and_then(|t| t.parse().ok());
            }
            "score" => match tokens.next() {
                Some("cp") => {
                    score = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .map(InfoScore::Centipawns);
                }
                Some("mate") => {
                    score = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .map(InfoScore::Mate);
                }
                _ => {}
            },
            _ => {}
        }
    }
    Some(InfoLine {
        depth: depth?,
        score: score?,
    })
}
