//! Fail-fast fan-out of project pipelines.
//!
//! Every eligible project gets its own tokio task. Inside a task stages and
//! commands run strictly in order; across tasks nothing is ordered. The first
//! failing command claims the run's failure slot and cancels the shared token.
//! Other tasks notice at their next command boundary and stop. The coordinator
//! returns as soon as either every task finished or the token fired; in the
//! latter case tasks still running are detached, not killed.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use monorun_core::Project;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::runner::{CommandExecutor, FailureReport, RunStats, ShellExecutor, StageRunner, StageStatus};
use crate::stage::Action;

/// Why a coordinator run did not succeed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A command failed; the first failure of the run.
    #[error("command failed: {0}")]
    CommandFailed(Box<FailureReport>),

    /// A worker task panicked or was aborted.
    #[error("worker for project {project} stopped unexpectedly: {reason}")]
    WorkerLost { project: String, reason: String },
}

impl ExecutionError {
    /// The failing command, when the run failed because of one.
    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            ExecutionError::CommandFailed(report) => Some(report),
            ExecutionError::WorkerLost { .. } => None,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub action: Action,

    /// Projects that got a worker, in input order.
    pub launched: Vec<String>,

    /// Projects skipped because their stage for this action is empty.
    pub skipped: Vec<String>,

    /// Commands handed to the executor.
    pub commands_executed: usize,

    /// Commands printed instead of run (dry-run).
    pub commands_printed: usize,

    pub duration: Duration,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Directory relative project paths are resolved against.
    pub root_dir: PathBuf,

    /// Print commands instead of running them.
    pub dry_run: bool,
}

/// State shared by the workers of one run.
struct RunState {
    cancel: CancellationToken,
    failure: OnceLock<FailureReport>,
    stats: Arc<RunStats>,
}

impl RunState {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            failure: OnceLock::new(),
            stats: Arc::new(RunStats::default()),
        }
    }

    /// Record `report` if no failure was recorded yet, then cancel the run.
    fn fail(&self, report: FailureReport) {
        match self.failure.set(report) {
            Ok(()) => {
                if let Some(report) = self.failure.get() {
                    error!(
                        project = %report.project,
                        stage = %report.stage,
                        command = %report.command,
                        "Command failed: {}",
                        report.cause
                    );
                }
            }
            Err(later) => {
                warn!(
                    project = %later.project,
                    stage = %later.stage,
                    "Additional failure after cancellation: {}",
                    later.cause
                );
            }
        }
        self.cancel.cancel();
    }
}

/// Runs an action across projects concurrently, failing fast.
pub struct Coordinator {
    executor: Arc<dyn CommandExecutor>,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(executor: Arc<dyn CommandExecutor>, options: CoordinatorOptions) -> Self {
        Self { executor, options }
    }

    /// Coordinator running commands through `bash -c`.
    pub fn with_shell(options: CoordinatorOptions, timeout: Option<Duration>) -> Self {
        Self::new(
            Arc::new(ShellExecutor::new().with_timeout(timeout)),
            options,
        )
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Run `action` for every eligible project.
    ///
    /// Each call uses a fresh cancellation token and failure slot.
    pub async fn run(&self, projects: &[Project], action: Action) -> Result<RunSummary, ExecutionError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id, action = %action);
        self.run_inner(run_id, projects, action).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        projects: &[Project],
        action: Action,
    ) -> Result<RunSummary, ExecutionError> {
        let start = Instant::now();
        let state = Arc::new(RunState::new());

        if self.options.dry_run {
            info!("Dry run, commands will only be printed");
        }

        let (eligible, skipped): (Vec<&Project>, Vec<&Project>) =
            projects.iter().partition(|p| action.is_eligible(p));
        for project in &skipped {
            debug!(project = %project.name(), "No {} commands, skipping", action);
        }

        let runner = StageRunner::new(
            Arc::clone(&self.executor),
            state.cancel.clone(),
            self.options.root_dir.clone(),
            self.options.dry_run,
        )
        .with_stats(Arc::clone(&state.stats));

        let mut workers = FuturesUnordered::new();
        for project in &eligible {
            let project = (*project).clone();
            let runner = runner.clone();
            let state = Arc::clone(&state);
            let name = project.name().to_string();

            let handle = tokio::spawn(
                async move {
                    if let Err(report) = run_project(&runner, &project, action).await {
                        state.fail(report);
                    }
                }
                .in_current_span(),
            );
            workers.push(async move { (name, handle.await) });
        }

        let wait_all = async {
            while let Some((project, joined)) = workers.next().await {
                if let Err(e) = joined {
                    return Err(ExecutionError::WorkerLost {
                        project,
                        reason: e.to_string(),
                    });
                }
            }
            Ok(())
        };

        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {}
            finished = wait_all => {
                if let Err(e) = finished {
                    state.cancel.cancel();
                    error!("{e}");
                    return Err(e);
                }
            }
        }

        if let Some(report) = state.failure.get() {
            info!(duration_ms = start.elapsed().as_millis() as u64, "Run failed");
            return Err(ExecutionError::CommandFailed(Box::new(report.clone())));
        }

        let summary = RunSummary {
            run_id,
            action,
            launched: eligible.iter().map(|p| p.name().to_string()).collect(),
            skipped: skipped.iter().map(|p| p.name().to_string()).collect(),
            commands_executed: state.stats.executed(),
            commands_printed: state.stats.printed(),
            duration: start.elapsed(),
        };
        info!(
            projects = summary.launched.len(),
            commands = summary.commands_executed,
            duration_ms = summary.duration.as_millis() as u64,
            "Run completed successfully"
        );
        Ok(summary)
    }
}

/// One project's stages, in order, stopping at failure or cancellation.
async fn run_project(runner: &StageRunner, project: &Project, action: Action) -> Result<(), FailureReport> {
    match action {
        Action::Build => info!(project = %project.name(), "Building project at {}", project.path()),
        Action::Test | Action::Deploy => info!(project = %project.name(), "Running {} commands", action),
    }

    for stage in action.stages() {
        if runner.run(project, project.stage(*stage)).await? == StageStatus::Cancelled {
            break;
        }
    }
    Ok(())
}
