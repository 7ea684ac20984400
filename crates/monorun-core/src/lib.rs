//! monorun core library
//!
//! Everything the orchestrator needs before it starts running commands:
//! - the project model and its configuration file
//! - the commit cache recording the last fully green run
//! - change detection mapping a commit range to affected projects

pub mod cache;
pub mod changes;
pub mod config;
pub mod git;
pub mod project;
pub mod telemetry;

pub use cache::{CacheError, CommitCache};
pub use changes::{
    affected_projects, changed_files_since, detect_affected, detect_affected_at, detect_affected_in,
    ChangeError,
};
pub use config::{Config, ConfigError, DEFAULT_CONFIG_FILE};
pub use git::{GitCli, GitError, Repository};
pub use project::{CmdSet, Project, StageKind};
pub use telemetry::init_tracing;

/// monorun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
