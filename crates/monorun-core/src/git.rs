//! Git access for change detection.
//!
//! [`Repository`] is the narrow read-only view the change detector needs.
//! [`GitCli`] implements it by running the `git` executable.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

/// Failures talking to the repository.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to open repository at {dir}: {reason}")]
    Open { dir: PathBuf, reason: String },

    #[error("failed to resolve HEAD: {0}")]
    Head(String),

    #[error("failed to walk history from {start}: {reason}")]
    History { start: String, reason: String },

    #[error("failed to diff {older}..{newer}: {reason}")]
    Diff {
        older: String,
        newer: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Read-only repository operations used by change detection.
pub trait Repository {
    /// Hash of the commit HEAD points at.
    fn head(&self) -> Result<String>;

    /// Commits from `start` back to `stop`, children before parents, `start`
    /// first and `stop` last.
    ///
    /// `None` when `stop` is not reachable from `start`. The walk ends at
    /// `stop`; older history is never read.
    fn history_until(&self, start: &str, stop: &str) -> Result<Option<Vec<String>>>;

    /// Paths touched between two commits.
    ///
    /// Renames and copies report the destination path, deletions the
    /// deleted path.
    fn changed_paths(&self, older: &str, newer: &str) -> Result<Vec<String>>;
}

/// [`Repository`] backed by the `git` command-line tool.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    /// Open the repository containing `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let open_err = |reason: String| GitError::Open {
            dir: dir.to_path_buf(),
            reason,
        };

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(dir)
            .output()
            .map_err(|e| open_err(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(open_err(stderr.trim().to_string()));
        }

        Ok(Self {
            root: dir.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git and return stdout, or stderr as the error text.
    fn run(&self, args: &[&str]) -> std::result::Result<Vec<u8>, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| format!("failed to run git: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("git {} failed: {}", args.join(" "), stderr.trim()));
        }

        Ok(output.stdout)
    }
}

impl Repository for GitCli {
    fn head(&self) -> Result<String> {
        let stdout = self
            .run(&["rev-parse", "--verify", "HEAD^{commit}"])
            .map_err(GitError::Head)?;

        let sha = String::from_utf8_lossy(&stdout).trim().to_string();
        if sha.is_empty() {
            return Err(GitError::Head(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(sha)
    }

    fn history_until(&self, start: &str, stop: &str) -> Result<Option<Vec<String>>> {
        let history_err = |reason: String| GitError::History {
            start: start.to_string(),
            reason,
        };

        let mut child = Command::new("git")
            .args(["rev-list", "--topo-order", start])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| history_err(format!("failed to run git: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| history_err("git stdout was not captured".to_string()))?;

        let mut commits = Vec::new();
        let mut found = false;
        let mut read_error = None;
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    read_error = Some(format!("failed to read git output: {e}"));
                    break;
                }
            };
            let commit = line.trim();
            if commit.is_empty() {
                continue;
            }
            commits.push(commit.to_string());
            if commit == stop {
                found = true;
                break;
            }
        }

        if found {
            // Stop git from walking the rest of history.
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Some(commits));
        }

        let output = child
            .wait_with_output()
            .map_err(|e| history_err(format!("failed waiting for git: {e}")))?;
        if let Some(reason) = read_error {
            return Err(history_err(reason));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(history_err(format!(
                "git rev-list {start} failed: {}",
                stderr.trim()
            )));
        }

        tracing::debug!(start = %start, stop = %stop, walked = commits.len(), "Commit not found in history");
        Ok(None)
    }

    fn changed_paths(&self, older: &str, newer: &str) -> Result<Vec<String>> {
        let stdout = self
            .run(&[
                "diff",
                "--no-ext-diff",
                "--name-status",
                "-M",
                "-z",
                older,
                newer,
            ])
            .map_err(|reason| GitError::Diff {
                older: older.to_string(),
                newer: newer.to_string(),
                reason,
            })?;

        parse_name_status(&String::from_utf8_lossy(&stdout)).map_err(|reason| GitError::Diff {
            older: older.to_string(),
            newer: newer.to_string(),
            reason,
        })
    }
}

/// Parse `git diff --name-status -z` output into touched paths.
fn parse_name_status(raw: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = raw.split('\0').filter(|f| !f.is_empty());
    let mut paths = Vec::new();

    while let Some(status) = fields.next() {
        let first = fields
            .next()
            .ok_or_else(|| format!("missing path for status {status}"))?;

        // R<score>/C<score> carry source then destination.
        if status.starts_with('R') || status.starts_with('C') {
            let dest = fields
                .next()
                .ok_or_else(|| format!("missing destination for {status} {first}"))?;
            paths.push(dest.to_string());
        } else {
            paths.push(first.to_string());
        }
    }

    Ok(paths)
}
