//! Thin CLI entry point: argument parsing, logging setup and signal
//! handling live here; everything else is `bob_lib`. Mirrors the split
//! between `main_build.go`/`main_inspect.go` (cobra commands) and the `bob`
//! package they call into.

mod cli;

use std::{path::PathBuf, process::ExitCode};

use bob_lib::{error::ErrorCategory, Aggregate, Categorized, RunSpec, TaskId};
use clap::Parser;
use cli::{Cli, Command, InspectCommand};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let root_dir = resolve_root_dir(cli.dir);

    match cli.command {
        Command::Build { task, no_cache, concurrency } => run_build(root_dir, task, no_cache, concurrency).await,
        Command::Inspect { what } => run_inspect(root_dir, what),
        Command::Clean => run_clean(root_dir),
    }
}

fn resolve_root_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    bob_lib::find_bob_root(&cwd).unwrap_or(cwd)
}

/// Runs `task`, canceling in-flight work on Ctrl-C, the same way
/// `runBuild` wires `context.WithCancel` to SIGINT/SIGTERM.
async fn run_build(root_dir: PathBuf, task: String, no_cache: bool, concurrency: usize) -> ExitCode {
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let concurrency = if concurrency == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    } else {
        concurrency
    };

    let spec = RunSpec {
        root_dir,
        task: TaskId::new(task),
        enable_caching: !no_cache,
        concurrency,
    };

    match bob_lib::build(spec, cancel).await {
        Ok(summary) => {
            for outcome in &summary.outcomes {
                println!("{}: {:?}", outcome.task, outcome.state);
                if !outcome.stderr.is_empty() {
                    eprint!("{}", outcome.stderr);
                }
            }
            if summary.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => fail(&err),
    }
}

fn run_inspect(root_dir: PathBuf, what: InspectCommand) -> ExitCode {
    let (task_name, show) = match what {
        InspectCommand::Env { task } => (task, Show::Env),
        InspectCommand::Export { task } => (task, Show::Export),
    };

    let aggregate = match Aggregate::build(&root_dir, true) {
        Ok(a) => a,
        Err(err) => return fail(&err),
    };

    let id = TaskId::new(task_name);
    let Some(task) = aggregate.tasks.get(&id) else {
        error!(task = %id, "task does not exist");
        return ExitCode::FAILURE;
    };

    match show {
        Show::Env => {
            for (key, value) in &task.env {
                println!("{key}={value}");
            }
        }
        Show::Export => {
            for (name, path) in &task.exports {
                println!("{name}={}", path.display());
            }
        }
    }
    ExitCode::SUCCESS
}

enum Show {
    Env,
    Export,
}

fn run_clean(root_dir: PathBuf) -> ExitCode {
    let bob_dir = root_dir.join(bob_lib::BOB_DIR_NAME);
    let build_info = match bob_lib::store::BuildInfoStore::new(bob_dir.join("buildinfo")) {
        Ok(store) => store,
        Err(err) => return fail(&err),
    };
    let artifacts = match bob_lib::store::ArtifactStore::new(bob_dir.join("artifacts")) {
        Ok(store) => store,
        Err(err) => return fail(&err),
    };

    if let Err(err) = build_info.clean() {
        return fail(&err);
    }
    if let Err(err) = artifacts.clean() {
        return fail(&err);
    }
    ExitCode::SUCCESS
}

fn fail(err: &(impl std::fmt::Display + Categorized)) -> ExitCode {
    error!(category = %err.category(), "{err}");
    match err.category() {
        ErrorCategory::User => ExitCode::from(2),
        ErrorCategory::TaskFailure => ExitCode::FAILURE,
        ErrorCategory::Store | ErrorCategory::Internal => ExitCode::from(70),
        ErrorCategory::Canceled => ExitCode::from(130),
    }
}
