//! Getting game texts out of archives.
//!
//! An archive (local file or downloaded URL) wraps a single plain-text games
//! file. Extraction tries the zip container first and falls back to 7z when
//! the file is not a zip. The splitter then cuts the text into one chunk per
//! game: a block of `[...]` headers followed by move text. It is strict: a
//! chunk that parses to more than one game is refused rather than loaded
//! half-wrong.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::game::count_games;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("cache index is unreadable: {0}")]
    CacheIndex(#[from] bincode::Error),
    #[error("archive has {0} inner files, expected exactly one")]
    NotASingleFile(usize),
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("game chunk parses to {games} games: {preview:?}")]
    MultiGameChunk { games: usize, preview: String },
}

/// Split a games file into per-game text chunks.
pub fn split_games<R: Read>(reader: R) -> GameSplitter<BufReader<R>> {
    GameSplitter {
        lines: BufReader::new(reader),
        pending: None,
        chunk: String::new(),
        saw_moves: false,
        finished: false,
    }
}

/// Iterator yielding one game text per item.
pub struct GameSplitter<R: BufRead> {
    lines: R,
    pending: Option<String>,
    chunk: String,
    saw_moves: bool,
    finished: bool,
}

impl<R: BufRead> GameSplitter<R> {
    fn take_chunk(&mut self) -> Option<Result<String, IntakeError>> {
        let chunk = std::mem::take(&mut self.chunk);
        self.saw_moves = false;
        if chunk.trim().is_empty() {
            return None;
        }
        let games = count_games(&chunk);
        if games > 1 {
            let preview: String = chunk.chars().take(120).collect();
            return Some(Err(IntakeError::MultiGameChunk { games, preview }));
        }
        Some(Ok(chunk))
    }
}

impl<R: BufRead> Iterator for GameSplitter<R> {
    type Item = Result<String, IntakeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.pending.take() {
                Some(line) => line,
                None => {
                    let mut line = String::new();
                    match self.lines.read_line(&mut line) {
                        Err(err) => {
                            self.finished = true;
                            return Some(Err(err.into()));
                        }
                        Ok(0) => {
                            self.finished = true;
                            return self.take_chunk();
                        }
                        Ok(_) => line,
                    }
                }
            };
            let trimmed = line.trim();
            let is_header = trimmed.starts_with('[') && trimmed.ends_with(']');
            if is_header && self.saw_moves {
                // A new game begins; emit what we have and keep the line.
                self.pending = Some(line);
                if let Some(chunk) = self.take_chunk() {
                    return Some(chunk);
                }
                continue;
            }
            if !trimmed.is_empty() && !is_header {
                self.saw_moves = true;
            }
            self.chunk.push_str(&line);
        }
    }
}

/// Extract the single inner file of `archive` into `work_dir` and return its
/// path. Zip is tried first; the "not a zip" failure falls through to 7z.
pub fn extract_games_file(archive: &Path, work_dir: &Path) -> Result<PathBuf, IntakeError> {
    std::fs::create_dir_all(work_dir)?;
    let file = std::fs::File::open(archive)?;
    match zip::ZipArchive::new(file) {
        Ok(mut zip) => {
            if zip.len() != 1 {
                return Err(IntakeError::NotASingleFile(zip.len()));
            }
            let mut inner = zip.by_index(0)?;
            let target = work_dir.join("games.pgn");
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut inner, &mut out)?;
            tracing::info!(archive = %archive.display(), "extracted zip archive");
            Ok(target)
        }
        Err(zip::result::ZipError::InvalidArchive(_)) => extract_sevenz(archive, work_dir),
        Err(err) => Err(IntakeError::UnsupportedArchive(err.to_string())),
    }
}

fn extract_sevenz(archive: &Path, work_dir: &Path) -> Result<PathBuf, IntakeError> {
    let dest = work_dir.join("sevenz");
    std::fs::create_dir_all(&dest)?;
    sevenz_rust::decompress_file(archive, &dest)
        .map_err(|err| IntakeError::UnsupportedArchive(err.to_string()))?;
    let mut files = Vec::new();
    collect_files(&dest, &mut files)?;
    if files.len() != 1 {
        return Err(IntakeError::NotASingleFile(files.len()));
    }
    tracing::info!(archive = %archive.display(), "extracted 7z archive");
    Ok(files.remove(0))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), IntakeError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

impl From<zip::result::ZipError> for IntakeError {
    fn from(err: zip::result::ZipError) -> IntakeError {
        IntakeError::UnsupportedArchive(err.to_string())
    }
}

/// On-disk cache of downloaded archives: a lowercased-URL to path map backed
/// by a small binary index, with the payloads stored under their SHA-256.
pub struct DownloadCache {
    dir: PathBuf,
    files: HashMap<String, PathBuf>,
}

impl DownloadCache {
    const INDEX_FILE: &'static str = "cache.bin";

    pub fn open(dir: &Path) -> Result<DownloadCache, IntakeError> {
        std::fs::create_dir_all(dir)?;
        let index = dir.join(Self::INDEX_FILE);
        let files = if index.exists() {
            bincode::deserialize(&std::fs::read(&index)?)?
        } else {
            HashMap::new()
        };
        tracing::debug!(dir = %dir.display(), entries = files.len(), "download cache open");
        Ok(DownloadCache {
            dir: dir.to_path_buf(),
            files,
        })
    }

    /// Path of a cached download, if the URL was fetched before.
    pub fn cached(&self, url: &str) -> Option<&Path> {
        self.files.get(&url.to_lowercase()).map(PathBuf::as_path)
    }

    /// Store a downloaded payload and persist the index.
    pub fn store(&mut self, url: &str, payload: &[u8]) -> Result<PathBuf, IntakeError> {
        let digest = Sha256::digest(payload);
        let mut name = String::with_capacity(68);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".pgn");
        let path = self.dir.join(name);
        std::fs::write(&path, payload)?;
        self.files.insert(url.to_lowercase(), path.clone());
        std::fs::write(
            self.dir.join(Self::INDEX_FILE),
            bincode::serialize(&self.files)?,
        )?;
        tracing::info!(url, path = %path.display(), "cached download");
        Ok(path)
    }
}

/// Fetch `url`, honoring (and feeding) the cache when one is given.
pub async fn fetch_archive(
    url: &str,
    cache: Option<&mut DownloadCache>,
) -> Result<PathBuf, IntakeError> {
    if let Some(cache) = &cache {
        if let Some(path) = cache.cached(url) {
            tracing::info!(url, path = %path.display(), "cache hit");
            return Ok(path.to_path_buf());
        }
    }
    tracing::info!(url, "downloading archive");
    let payload = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    match cache {
        Some(cache) => cache.store(url, &payload),
        None => {
            let dir = std::env::temp_dir();
            let mut cache = DownloadCache::open(&dir.join("chessgraph-downloads"))?;
            cache.store(url, &payload)
        }
    }
}
