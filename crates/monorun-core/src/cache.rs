//! Persisted pointer to the last commit whose full run succeeded.
//!
//! The cache is a one-field YAML document:
//!
//! ```yaml
//! last_successful_commit: 3f2a9c...
//! ```
//!
//! A missing file or an empty field both mean "no prior successful run",
//! which callers treat as a full rebuild.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors reading or writing the cache document.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache at {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to write cache at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_successful_commit: Option<String>,
}

/// In-memory view of the cache document, bound to its location on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCache {
    path: PathBuf,
    last_successful_commit: Option<String>,
}

impl CommitCache {
    /// An empty cache that will be written to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_successful_commit: None,
        }
    }

    /// Load the cache at `path`.
    ///
    /// A missing file is not an error and yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Cache file not found, building all projects");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(CacheError::Read { path, source }),
        };

        let document: CacheDocument = if raw.trim().is_empty() {
            CacheDocument::default()
        } else {
            serde_yaml::from_str(&raw).map_err(|source| CacheError::Parse {
                path: path.clone(),
                source,
            })?
        };

        let last_successful_commit = document
            .last_successful_commit
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        Ok(Self {
            path,
            last_successful_commit,
        })
    }

    /// Load the cache, degrading any read failure to an empty cache.
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(&path) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(error = %e, "Cache unreadable, building all projects");
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commit of the last fully successful run, if any.
    pub fn last_successful_commit(&self) -> Option<&str> {
        self.last_successful_commit.as_deref()
    }

    /// Point the cache at `commit` and write it to disk.
    ///
    /// Call only after every project of the run succeeded. On write failure
    /// the in-memory value is left unchanged.
    pub fn record_success(&mut self, commit: impl Into<String>) -> Result<()> {
        let commit = commit.into();
        self.write(&CacheDocument {
            last_successful_commit: Some(commit.clone()),
        })?;
        tracing::info!(commit = %commit, path = %self.path.display(), "Cache updated");
        self.last_successful_commit = Some(commit);
        Ok(())
    }

    fn write(&self, document: &CacheDocument) -> Result<()> {
        let data = serde_yaml::to_string(document)?;
        let write_err = |source: std::io::Error| CacheError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;

        // Write to a sibling temp file and rename over the target.
        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(data.as_bytes()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}
