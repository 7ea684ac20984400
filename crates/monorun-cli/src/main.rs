//! monorun - incremental monorepo builds
//!
//! The `monorun` command runs build, test or deploy commands for the projects
//! of a monorepo that changed since the last fully successful run.
//!
//! ## Commands
//!
//! - `build [project]`: beforeBuild, build and afterBuild commands
//! - `test [project]`: test commands
//! - `deploy [project]`: deploy commands

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use monorun_core::{
    detect_affected, detect_affected_at, CommitCache, Config, GitCli, Project, Repository,
};
use monorun_runner::{Action, Coordinator, CoordinatorOptions};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "monorun")]
#[command(author = "Monorun Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental build runner for monorepos", long_about = None)]
struct Cli {
    /// Configuration file, relative to --dir unless absolute
    #[arg(long, global = true, env = "MONORUN_FILE", default_value = monorun_core::DEFAULT_CONFIG_FILE)]
    file: PathBuf,

    /// Working directory (default: current directory)
    #[arg(long, global = true, env = "MONORUN_DIR")]
    dir: Option<PathBuf>,

    /// Print commands instead of running them
    #[arg(long = "no-run", global = true, env = "MONORUN_NO_RUN")]
    no_run: bool,

    /// Run for every project, without change detection
    #[arg(long, global = true, env = "MONORUN_ALL")]
    all: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run beforeBuild, build and afterBuild commands
    Build {
        /// Only this project, regardless of changes
        project: Option<String>,
    },

    /// Run test commands
    Test {
        /// Only this project, regardless of changes
        project: Option<String>,
    },

    /// Run deploy commands
    Deploy {
        /// Only this project, regardless of changes
        project: Option<String>,
    },
}

impl Commands {
    fn action(&self) -> Action {
        match self {
            Commands::Build { .. } => Action::Build,
            Commands::Test { .. } => Action::Test,
            Commands::Deploy { .. } => Action::Deploy,
        }
    }

    fn project(&self) -> Option<&str> {
        match self {
            Commands::Build { project } | Commands::Test { project } | Commands::Deploy { project } => {
                project.as_deref()
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    monorun_core::init_tracing(cli.json, level);

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let (dir, file) = resolve_paths(&cwd, cli.dir.as_deref(), &cli.file);

    let result = cmd_run(&cli, &dir, &file).await;
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

/// Resolve `--dir` against the current directory and `--file` against `--dir`.
fn resolve_paths(cwd: &Path, dir: Option<&Path>, file: &Path) -> (PathBuf, PathBuf) {
    let dir = match dir {
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    let file = dir.join(file);
    (dir, file)
}

/// Which projects to run, and the commit a success records.
#[derive(Debug)]
struct Selection {
    projects: Vec<Project>,

    /// HEAD as resolved before detection. `None` when the run must not
    /// advance the cache.
    head: Option<String>,
}

fn select_projects(
    config: &Config,
    explicit: Option<&str>,
    all: bool,
    record_head: bool,
    dir: &Path,
    cache: &CommitCache,
) -> Result<Selection> {
    if let Some(name) = explicit {
        let project = config.project(name)?.clone();
        info!(project = %name, "Running a single project, change detection skipped");
        return Ok(Selection {
            projects: vec![project],
            head: None,
        });
    }

    let since = cache.last_successful_commit();

    if !record_head {
        let projects = if all {
            info!("--all is set, selecting every project");
            config.projects.clone()
        } else {
            detect_affected(&config.projects, dir, since).context("Failed to detect changed projects")?
        };
        return Ok(Selection { projects, head: None });
    }

    let repo = GitCli::open(dir).context("Failed to open repository")?;
    let head = repo.head().context("Failed to resolve repository HEAD")?;

    let projects = if all {
        info!("--all is set, selecting every project");
        config.projects.clone()
    } else {
        detect_affected_at(&config.projects, &repo, &head, since)
            .context("Failed to detect changed projects")?
    };
    Ok(Selection {
        projects,
        head: Some(head),
    })
}

async fn cmd_run(cli: &Cli, dir: &Path, file: &Path) -> Result<()> {
    let action = cli.command.action();

    let config = Config::load(file, dir)
        .with_context(|| format!("Failed to load configuration from {}", file.display()))?;
    let mut cache = CommitCache::load_or_empty(config.cache_file(dir));

    let selection = select_projects(
        &config,
        cli.command.project(),
        cli.all,
        !cli.no_run,
        dir,
        &cache,
    )?;
    if selection.projects.is_empty() {
        info!("No affected projects, nothing to {}", action);
    } else {
        let names: Vec<&str> = selection.projects.iter().map(|p| p.name()).collect();
        info!(projects = ?names, "Selected projects");
    }

    let coordinator = Coordinator::with_shell(
        CoordinatorOptions {
            root_dir: dir.to_path_buf(),
            dry_run: cli.no_run,
        },
        config.command_timeout,
    );
    let summary = coordinator
        .run(&selection.projects, action)
        .await
        .with_context(|| format!("{action} failed"))?;

    if cli.no_run {
        info!(commands = summary.commands_printed, "Dry run finished, cache left unchanged");
        return Ok(());
    }
    let Some(head) = selection.head else {
        info!("Partial run finished, cache left unchanged");
        return Ok(());
    };

    cache.record_success(head.clone()).with_context(|| {
        format!(
            "Run succeeded but the cache at {} could not be written; the next run will rebuild everything",
            cache.path().display()
        )
    })?;
    info!(commit = %head, "Recorded successful run");

    Ok(())
}
