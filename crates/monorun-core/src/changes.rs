//! Change detection: commit range → affected projects.
//!
//! Given the commit of the last successful run, walk history from HEAD back
//! to that commit, union the files touched by every step of the range, and
//! keep the projects whose path prefixes one of those files.
//!
//! Policy decisions:
//! - No cached commit means a full rebuild; the repository is not touched.
//! - A cached commit that is not an ancestor of HEAD (rebased or rewritten
//!   history) also means a full rebuild, with a warning.
//! - Repository and diff failures abort detection. There is no partial result.

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::{GitCli, GitError, Repository};
use crate::project::Project;

/// Change detection failures.
#[derive(Debug, Error)]
pub enum ChangeError {
    /// Repository could not be opened or HEAD could not be resolved.
    #[error("repository error: {0}")]
    Repository(#[source] GitError),

    /// History walk or diff computation failed.
    #[error("diff error: {0}")]
    Diff(#[source] GitError),
}

impl From<GitError> for ChangeError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Open { .. } | GitError::Head(_) => ChangeError::Repository(err),
            GitError::History { .. } | GitError::Diff { .. } => ChangeError::Diff(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChangeError>;

/// Projects affected since `since_commit`, opening the git repository at
/// `repo_root` only when a commit is given.
pub fn detect_affected(
    projects: &[Project],
    repo_root: &Path,
    since_commit: Option<&str>,
) -> Result<Vec<Project>> {
    let Some(since) = since_commit else {
        info!("No successful run recorded, selecting all projects");
        return Ok(projects.to_vec());
    };

    let repo = GitCli::open(repo_root)?;
    detect_affected_in(projects, &repo, Some(since))
}

/// Same as [`detect_affected`], against any [`Repository`].
pub fn detect_affected_in<R: Repository + ?Sized>(
    projects: &[Project],
    repo: &R,
    since_commit: Option<&str>,
) -> Result<Vec<Project>> {
    let Some(since) = since_commit else {
        info!("No successful run recorded, selecting all projects");
        return Ok(projects.to_vec());
    };
    let head = repo.head()?;
    detect_affected_at(projects, repo, &head, Some(since))
}

/// Projects affected between `since_commit` and an already resolved `head`.
///
/// Commits after `head` are not considered, even if they exist by now.
pub fn detect_affected_at<R: Repository + ?Sized>(
    projects: &[Project],
    repo: &R,
    head: &str,
    since_commit: Option<&str>,
) -> Result<Vec<Project>> {
    let Some(since) = since_commit else {
        info!("No successful run recorded, selecting all projects");
        return Ok(projects.to_vec());
    };

    let Some(changed) = changed_files_since(repo, head, since)? else {
        warn!(
            commit = %since,
            "Last successful commit is not in HEAD's history, selecting all projects"
        );
        return Ok(projects.to_vec());
    };

    let affected = affected_projects(projects, &changed);
    info!(
        commit = %since,
        head = %head,
        changed_files = changed.len(),
        affected = affected.len(),
        "Detected affected projects"
    );
    Ok(affected)
}

/// Files touched between `since` and `head`.
///
/// `None` when `since` is not reachable from `head`.
pub fn changed_files_since<R: Repository + ?Sized>(
    repo: &R,
    head: &str,
    since: &str,
) -> Result<Option<BTreeSet<String>>> {
    // Newest first; `since` is the last element.
    let Some(range) = repo.history_until(head, since)? else {
        return Ok(None);
    };
    debug!(head = %head, commits = range.len(), "Collected commit range");

    let mut changed = BTreeSet::new();
    for pair in range.windows(2).rev() {
        let (newer, older) = (&pair[0], &pair[1]);
        changed.extend(repo.changed_paths(older, newer)?);
    }

    Ok(Some(changed))
}

/// Projects owning at least one of `changed`, in the order of `projects`.
pub fn affected_projects<'a, I>(projects: &[Project], changed: I) -> Vec<Project>
where
    I: IntoIterator<Item = &'a String> + Copy,
{
    projects
        .iter()
        .filter(|p| changed.into_iter().any(|f| p.owns(f)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// In-memory linear history with canned diffs.
    #[derive(Default)]
    struct FakeRepo {
        /// Newest first.
        history: Vec<String>,
        diffs: HashMap<(String, String), Vec<String>>,
        fail_head: bool,
        fail_diff: bool,
        calls: Cell<usize>,
    }

    impl FakeRepo {
        /// Linear history from `commits`, given oldest first.
        fn linear(commits: &[&str]) -> Self {
            FakeRepo {
                history: commits.iter().rev().map(|c| c.to_string()).collect(),
                ..FakeRepo::default()
            }
        }

        /// Record the files `commit` touched relative to its parent.
        fn touch(mut self, commit: &str, files: &[&str]) -> Self {
            let idx = self
                .history
                .iter()
                .position(|c| c == commit)
                .expect("commit in history");
            let parent = self.history[idx + 1].clone();
            self.diffs.insert(
                (parent, commit.to_string()),
                files.iter().map(|f| f.to_string()).collect(),
            );
            self
        }
    }

    impl Repository for FakeRepo {
        fn head(&self) -> crate::git::Result<String> {
            self.calls.set(self.calls.get() + 1);
            if self.fail_head {
                return Err(GitError::Head("unborn".to_string()));
            }
            Ok(self.history[0].clone())
        }

        fn history_until(&self, start: &str, stop: &str) -> crate::git::Result<Option<Vec<String>>> {
            self.calls.set(self.calls.get() + 1);
            let Some(from) = self.history.iter().position(|c| c == start) else {
                return Err(GitError::History {
                    start: start.to_string(),
                    reason: "unknown revision".to_string(),
                });
            };
            let walk = &self.history[from..];
            Ok(walk
                .iter()
                .position(|c| c == stop)
                .map(|end| walk[..=end].to_vec()))
        }

        fn changed_paths(&self, older: &str, newer: &str) -> crate::git::Result<Vec<String>> {
            self.calls.set(self.calls.get() + 1);
            if self.fail_diff {
                return Err(GitError::Diff {
                    older: older.to_string(),
                    newer: newer.to_string(),
                    reason: "boom".to_string(),
                });
            }
            Ok(self
                .diffs
                .get(&(older.to_string(), newer.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn projects() -> Vec<Project> {
        vec![
            Project::new("a", "a"),
            Project::new("deep", "a/b/c"),
            Project::new("web", "./apps/web"),
            Project::new("api", "services/api"),
        ]
    }

    fn names(projects: &[Project]) -> Vec<&str> {
        projects.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn no_cached_commit_returns_everything_without_touching_repo() {
        let repo = FakeRepo::linear(&["c1"]);
        let affected = detect_affected_in(&projects(), &repo, None).unwrap();
        assert_eq!(affected, projects());
        assert_eq!(repo.calls.get(), 0);
    }

    #[test]
    fn no_cached_commit_skips_opening_repository() {
        let dir = tempfile::tempdir().unwrap();
        // Not a git repository; must not matter.
        let affected = detect_affected(&projects(), dir.path(), None).unwrap();
        assert_eq!(affected.len(), projects().len());
    }

    #[test]
    fn prefix_mapping_selects_owner_only() {
        let repo = FakeRepo::linear(&["c1", "c2"]).touch("c2", &["a/b.txt"]);
        let affected = detect_affected_in(&projects(), &repo, Some("c1")).unwrap();
        assert_eq!(names(&affected), vec!["a"]);
    }

    #[test]
    fn union_across_range_in_config_order() {
        let repo = FakeRepo::linear(&["c1", "c2", "c3", "c4"])
            .touch("c2", &["services/api/main.go"])
            .touch("c3", &["README.md"])
            .touch("c4", &["apps/web/index.ts", "services/api/handler.go"]);
        let affected = detect_affected_in(&projects(), &repo, Some("c1")).unwrap();
        assert_eq!(names(&affected), vec!["web", "api"]);
    }

    #[test]
    fn commits_before_cached_commit_are_ignored() {
        let repo = FakeRepo::linear(&["c1", "c2", "c3"])
            .touch("c2", &["a/old.txt"])
            .touch("c3", &["services/api/x"]);
        let affected = detect_affected_in(&projects(), &repo, Some("c2")).unwrap();
        assert_eq!(names(&affected), vec!["api"]);
    }

    #[test]
    fn head_equal_to_cache_is_empty_and_idempotent() {
        let repo = FakeRepo::linear(&["c1", "c2"]).touch("c2", &["a/x"]);
        for _ in 0..2 {
            let affected = detect_affected_in(&projects(), &repo, Some("c2")).unwrap();
            assert!(affected.is_empty());
        }
    }

    #[test]
    fn unknown_cached_commit_falls_back_to_full_rebuild() {
        let repo = FakeRepo::linear(&["c1", "c2"]).touch("c2", &["a/x"]);
        let affected = detect_affected_in(&projects(), &repo, Some("rewritten")).unwrap();
        assert_eq!(affected, projects());
    }

    #[test]
    fn head_failure_is_repository_error() {
        let mut repo = FakeRepo::linear(&["c1"]);
        repo.fail_head = true;
        let err = detect_affected_in(&projects(), &repo, Some("c1")).unwrap_err();
        assert!(matches!(err, ChangeError::Repository(_)));
    }

    #[test]
    fn diff_failure_aborts_detection() {
        let mut repo = FakeRepo::linear(&["c1", "c2"]).touch("c2", &["a/x"]);
        repo.fail_diff = true;
        let err = detect_affected_in(&projects(), &repo, Some("c1")).unwrap_err();
        assert!(matches!(err, ChangeError::Diff(_)));
    }

    #[test]
    fn detection_at_fixed_head_ignores_newer_commits() {
        let repo = FakeRepo::linear(&["c1", "c2", "c3"])
            .touch("c2", &["a/x"])
            .touch("c3", &["services/api/y"]);
        let affected = detect_affected_at(&projects(), &repo, "c2", Some("c1")).unwrap();
        assert_eq!(names(&affected), vec!["a"]);
    }

    #[test]
    fn affected_projects_has_no_duplicates() {
        let changed: BTreeSet<String> = ["a/1", "a/2", "a/3"].iter().map(|s| s.to_string()).collect();
        let affected = affected_projects(&projects(), &changed);
        assert_eq!(names(&affected), vec!["a"]);
    }

    #[test]
    fn sibling_with_shared_prefix_also_matches() {
        let projects = vec![Project::new("foo", "foo")];
        let changed: BTreeSet<String> = ["foobar/x".to_string()].into_iter().collect();
        assert_eq!(affected_projects(&projects, &changed).len(), 1);
    }
}
