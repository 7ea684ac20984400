//! Actions and the stage sequences they run.

use monorun_core::{Project, StageKind};

/// What the user asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// beforeBuild, build, afterBuild
    Build,

    /// test
    Test,

    /// deploy
    Deploy,
}

impl Action {
    /// Action name as used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Build => "build",
            Action::Test => "test",
            Action::Deploy => "deploy",
        }
    }

    /// Stages run for every project, in order.
    pub fn stages(&self) -> &'static [StageKind] {
        match self {
            Action::Build => &[StageKind::BeforeBuild, StageKind::Build, StageKind::AfterBuild],
            Action::Test => &[StageKind::Test],
            Action::Deploy => &[StageKind::Deploy],
        }
    }

    /// Whether a project gets a worker at all for this action.
    ///
    /// Build always runs. Test and deploy skip projects whose stage is empty.
    pub fn is_eligible(&self, project: &Project) -> bool {
        match self {
            Action::Build => true,
            Action::Test | Action::Deploy => self
                .stages()
                .iter()
                .any(|stage| !project.stage(*stage).is_empty()),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(Action::Build.name(), "build");
        assert_eq!(Action::Test.name(), "test");
        assert_eq!(Action::Deploy.to_string(), "deploy");
    }

    #[test]
    fn test_build_runs_three_stages_in_order() {
        assert_eq!(
            Action::Build.stages(),
            &[StageKind::BeforeBuild, StageKind::Build, StageKind::AfterBuild]
        );
        assert_eq!(Action::Test.stages(), &[StageKind::Test]);
        assert_eq!(Action::Deploy.stages(), &[StageKind::Deploy]);
    }

    #[test]
    fn test_empty_stage_makes_project_ineligible() {
        let bare = Project::new("bare", "bare");
        let tested = Project::new("tested", "tested").with_stage(StageKind::Test, ["cargo test"]);

        assert!(Action::Build.is_eligible(&bare));
        assert!(!Action::Test.is_eligible(&bare));
        assert!(!Action::Deploy.is_eligible(&bare));
        assert!(Action::Test.is_eligible(&tested));
        assert!(!Action::Deploy.is_eligible(&tested));
    }
}
