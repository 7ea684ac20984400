//! Command execution for a single stage of a single project.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use monorun_core::{CmdSet, Project, StageKind};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One command about to be executed.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub project: &'a str,
    pub stage: StageKind,
    pub command: &'a str,
    pub working_dir: &'a Path,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,

    /// Combined stdout and stderr, interleaved.
    pub output: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A command that never produced an exit status.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Runs command lines. Implemented by [`ShellExecutor`] and by test doubles.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation<'_>) -> Result<CommandOutput, CommandError>;
}

/// Executes command lines with `bash -c` in the project's directory.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Option<Duration>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
            timeout: None,
        }
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, invocation: &Invocation<'_>) -> Result<CommandOutput, CommandError> {
        let start = Instant::now();

        // Redirect stderr into stdout inside the shell so both streams
        // interleave in one pipe.
        let script = format!("exec 2>&1\n{}", invocation.command);

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .current_dir(invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.timeout.is_some() {
            command.kill_on_drop(true);
        }

        let child = command.spawn().map_err(CommandError::Spawn)?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::TimedOut(limit))?
                .map_err(CommandError::Wait)?,
            None => child.wait_with_output().await.map_err(CommandError::Wait)?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code(),
            output: combined,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Why a command counted as failed.
#[derive(Debug, Clone, Error)]
pub enum FailureCause {
    #[error("exited with {}", exit_label(.exit_code))]
    Exit {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("{0}")]
    Execution(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

/// The failure a run reports: which project, stage and command, and why.
#[derive(Debug, Clone, Error)]
#[error("project {project}, stage {stage}, command `{command}`: {cause}")]
pub struct FailureReport {
    pub project: String,
    pub stage: StageKind,
    pub command: String,
    pub cause: FailureCause,
}

impl FailureReport {
    /// Captured output of the failing command, if it ran to completion.
    pub fn output(&self) -> Option<&str> {
        match &self.cause {
            FailureCause::Exit { output, .. } => Some(output),
            FailureCause::Execution(_) => None,
        }
    }
}

/// How far a stage got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Every command ran and succeeded (or was printed, in dry-run).
    Completed,

    /// The run was cancelled before the stage finished.
    Cancelled,
}

/// Command counters shared by all workers of one run.
#[derive(Debug, Default)]
pub struct RunStats {
    executed: AtomicUsize,
    printed: AtomicUsize,
    skipped: AtomicUsize,
}

impl RunStats {
    /// Commands handed to the executor.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Commands only printed because of dry-run.
    pub fn printed(&self) -> usize {
        self.printed.load(Ordering::Relaxed)
    }

    /// Commands not run because the run was cancelled.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Runs the command sets of one project, one command at a time.
#[derive(Clone)]
pub struct StageRunner {
    executor: Arc<dyn CommandExecutor>,
    cancel: CancellationToken,
    stats: Arc<RunStats>,
    root_dir: PathBuf,
    dry_run: bool,
}

impl StageRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        cancel: CancellationToken,
        root_dir: impl Into<PathBuf>,
        dry_run: bool,
    ) -> Self {
        Self {
            executor,
            cancel,
            stats: Arc::new(RunStats::default()),
            root_dir: root_dir.into(),
            dry_run,
        }
    }

    /// Share counters with other runners of the same run.
    pub fn with_stats(mut self, stats: Arc<RunStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Run `set` for `project`.
    ///
    /// Stops at the first failing command. The cancellation token is checked
    /// before every command; commands already running are never interrupted.
    pub async fn run(&self, project: &Project, set: &CmdSet) -> Result<StageStatus, FailureReport> {
        if set.is_empty() {
            return Ok(StageStatus::Completed);
        }

        info!(project = %project.name(), "Running {} commands", set.name());
        let working_dir = project.working_dir(&self.root_dir);

        for (idx, command) in set.commands().iter().enumerate() {
            if self.cancel.is_cancelled() {
                let remaining = set.len() - idx;
                self.stats.skipped.fetch_add(remaining, Ordering::Relaxed);
                debug!(
                    project = %project.name(),
                    stage = %set.name(),
                    skipped = remaining,
                    "Run cancelled, skipping remaining commands"
                );
                return Ok(StageStatus::Cancelled);
            }

            info!(project = %project.name(), stage = %set.name(), "$ {command}");

            if self.dry_run {
                self.stats.printed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let invocation = Invocation {
                project: project.name(),
                stage: set.stage(),
                command,
                working_dir: &working_dir,
            };

            self.stats.executed.fetch_add(1, Ordering::Relaxed);
            let failure = |cause: FailureCause| FailureReport {
                project: project.name().to_string(),
                stage: set.stage(),
                command: command.clone(),
                cause,
            };

            let output = self
                .executor
                .execute(&invocation)
                .await
                .map_err(|e| failure(FailureCause::Execution(e.to_string())))?;

            log_output(project.name(), set.name(), &output);

            if !output.success() {
                return Err(failure(FailureCause::Exit {
                    exit_code: output.exit_code,
                    output: output.output,
                }));
            }
        }

        Ok(StageStatus::Completed)
    }
}

/// Emit captured output right away, whatever the outcome.
fn log_output(project: &str, stage: &str, output: &CommandOutput) {
    for line in output.output.lines() {
        info!(project = %project, stage = %stage, "{line}");
    }
    debug!(
        project = %project,
        stage = %stage,
        exit_code = ?output.exit_code,
        duration_ms = output.duration_ms,
        "Command finished"
    );
}
