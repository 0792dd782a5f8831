//! Where the database, logs and download cache live.

use std::path::{Path, PathBuf};

/// Resolved data locations: a data directory holding the database file and
/// a `logs/` subdirectory, and a cache directory for downloaded archives.
///
/// `CHESSGRAPH_DATA_DIR` and `CHESSGRAPH_CACHE_DIR` override the defaults,
/// which live under the platform data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl DataDirs {
    pub fn resolve() -> DataDirs {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = std::env::var_os("CHESSGRAPH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("chessgraph"));
        let cache_dir = std::env::var_os("CHESSGRAPH_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("chessgraph").join("cache"));
        DataDirs {
            data_dir,
            cache_dir,
        }
    }

    /// Rooted at an explicit directory, for tools that manage their own
    /// layout.
    pub fn at(root: &Path) -> DataDirs {
        DataDirs {
            data_dir: root.to_path_buf(),
            cache_dir: root.join("cache"),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chessgraph.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Create all directories this layout refers to.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_root_shapes_the_layout() {
        let dirs = DataDirs::at(Path::new("/tmp/chessgraph-test"));
        assert_eq!(dirs.db_path(), Path::new("/tmp/chessgraph-test/chessgraph.db"));
        assert_eq!(dirs.logs_dir(), Path::new("/tmp/chessgraph-test/logs"));
        assert_eq!(dirs.cache_dir, Path::new("/tmp/chessgraph-test/cache"));
    }

    #[test]
    fn ensure_creates_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::at(&tmp.path().join("nested"));
        dirs.ensure().unwrap();
        assert!(dirs.logs_dir().is_dir());
        assert!(dirs.cache_dir.is_dir());
    }
}
