use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bob", version, about = "Polyrepo-aware build orchestrator")]
pub struct Cli {
    /// Directory to treat as the bob root; defaults to the nearest ancestor
    /// containing a `.bob` directory.
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a task and everything it depends on.
    Build {
        task: String,
        /// Ignore the build-info cache and rebuild every task.
        #[arg(long)]
        no_cache: bool,
        #[arg(long, default_value_t = 0)]
        concurrency: usize,
    },
    /// Inspect a task without running it.
    Inspect {
        #[command(subcommand)]
        what: InspectCommand,
    },
    /// Remove every cached build-info record and artifact.
    Clean,
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    /// Print a task's resolved environment variables.
    Env { task: String },
    /// Print a task's declared exports.
    Export { task: String },
}
