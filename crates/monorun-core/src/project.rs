//! Project and command-set definitions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Named command stages a project can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    BeforeBuild,
    Build,
    AfterBuild,
    Test,
    Deploy,
}

impl StageKind {
    /// Every stage, in declaration order.
    pub const ALL: [StageKind; 5] = [
        StageKind::BeforeBuild,
        StageKind::Build,
        StageKind::AfterBuild,
        StageKind::Test,
        StageKind::Deploy,
    ];

    /// Stage label as written in the configuration file.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::BeforeBuild => "beforeBuild",
            StageKind::Build => "build",
            StageKind::AfterBuild => "afterBuild",
            StageKind::Test => "test",
            StageKind::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An ordered list of shell command lines for one stage.
///
/// An empty set is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSet {
    stage: StageKind,
    commands: Vec<String>,
}

impl CmdSet {
    pub fn new(stage: StageKind, commands: Vec<String>) -> Self {
        Self { stage, commands }
    }

    pub fn empty(stage: StageKind) -> Self {
        Self::new(stage, Vec::new())
    }

    /// Stage label, used for logging and failure reports.
    pub fn name(&self) -> &'static str {
        self.stage.name()
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// A buildable unit of the monorepo: a directory plus its command stages.
///
/// Built once from configuration and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    name: String,
    path: String,
    before_build: CmdSet,
    build: CmdSet,
    after_build: CmdSet,
    test: CmdSet,
    deploy: CmdSet,
}

impl Project {
    /// Create a project with all stages empty.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            before_build: CmdSet::empty(StageKind::BeforeBuild),
            build: CmdSet::empty(StageKind::Build),
            after_build: CmdSet::empty(StageKind::AfterBuild),
            test: CmdSet::empty(StageKind::Test),
            deploy: CmdSet::empty(StageKind::Deploy),
        }
    }

    /// Replace the commands of one stage.
    pub fn with_stage<I, S>(mut self, stage: StageKind, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = CmdSet::new(stage, commands.into_iter().map(Into::into).collect());
        match stage {
            StageKind::BeforeBuild => self.before_build = set,
            StageKind::Build => self.build = set,
            StageKind::AfterBuild => self.after_build = set,
            StageKind::Test => self.test = set,
            StageKind::Deploy => self.deploy = set,
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path as configured (repository-relative or absolute).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stage(&self, stage: StageKind) -> &CmdSet {
        match stage {
            StageKind::BeforeBuild => &self.before_build,
            StageKind::Build => &self.build,
            StageKind::AfterBuild => &self.after_build,
            StageKind::Test => &self.test,
            StageKind::Deploy => &self.deploy,
        }
    }

    /// Prefix used to match changed files against this project.
    ///
    /// A leading `./` is dropped and `.` means the repository root.
    pub fn match_prefix(&self) -> &str {
        let trimmed = self.path.strip_prefix("./").unwrap_or(&self.path);
        if trimmed == "." {
            ""
        } else {
            trimmed
        }
    }

    /// Whether a repository-relative file path falls under this project.
    ///
    /// Plain string prefix: a project at `foo` also owns `foobar/x`.
    pub fn owns(&self, file: &str) -> bool {
        file.starts_with(self.match_prefix())
    }

    /// Directory the project's commands run in.
    pub fn working_dir(&self, root: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_project_has_empty_stages() {
        let project = Project::new("api", "services/api");
        for stage in StageKind::ALL {
            assert!(project.stage(stage).is_empty());
            assert_eq!(project.stage(stage).stage(), stage);
        }
    }

    #[test]
    fn test_with_stage_sets_only_that_stage() {
        let project = Project::new("api", "services/api")
            .with_stage(StageKind::Build, ["make build", "make package"]);

        assert_eq!(project.stage(StageKind::Build).len(), 2);
        assert_eq!(project.stage(StageKind::Build).name(), "build");
        assert!(project.stage(StageKind::Test).is_empty());
    }

    #[test]
    fn test_stage_names_match_config_keys() {
        assert_eq!(StageKind::BeforeBuild.name(), "beforeBuild");
        assert_eq!(StageKind::AfterBuild.to_string(), "afterBuild");
        assert_eq!(StageKind::Deploy.name(), "deploy");
    }

    #[test]
    fn test_owns_is_plain_string_prefix() {
        let project = Project::new("foo", "foo");
        assert!(project.owns("foo/main.rs"));
        assert!(project.owns("foobar/x"));
        assert!(!project.owns("bar/foo/main.rs"));
    }

    #[test]
    fn test_match_prefix_strips_dot_slash() {
        assert_eq!(Project::new("a", "./lib/a").match_prefix(), "lib/a");
        assert_eq!(Project::new("root", ".").match_prefix(), "");
        assert!(Project::new("root", ".").owns("anything/at/all"));
    }

    #[test]
    fn test_working_dir_relative_and_absolute() {
        let root = Path::new("/repo");
        assert_eq!(
            Project::new("a", "lib/a").working_dir(root),
            PathBuf::from("/repo/lib/a")
        );
        assert_eq!(
            Project::new("b", "/opt/b").working_dir(root),
            PathBuf::from("/opt/b")
        );
    }
}
