//! monorun runner
//!
//! Runs an action (build, test, deploy) for a set of projects:
//! - one concurrent worker per project, stages in order inside each worker
//! - the first failing command cancels the rest of the run
//! - dry-run prints commands without executing them

pub mod coordinator;
pub mod runner;
pub mod stage;

// Re-export key types
pub use coordinator::{Coordinator, CoordinatorOptions, ExecutionError, RunSummary};
pub use runner::{
    CommandError, CommandExecutor, CommandOutput, FailureCause, FailureReport, Invocation, RunStats,
    ShellExecutor, StageRunner, StageStatus,
};
pub use stage::Action;
