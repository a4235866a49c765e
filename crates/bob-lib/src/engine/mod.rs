//! Ties aggregation, scheduling and execution together into a single
//! `build(root_dir, task)` entry point, the Rust counterpart of
//! `main_build.go`'s `runBuild`.

pub mod playbook;
pub mod runner;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{
        playbook::Playbook,
        runner::{RunSummary, Runner, RunnerOptions},
    },
    error::{Categorized, ErrorCategory},
    manifest::aggregate::{Aggregate, AggregateError},
    store::{ArtifactStore, ArtifactStoreError, BuildInfoStore, BuildInfoStoreError},
    task::TaskId,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("task {0} does not exist")]
    UnknownTask(TaskId),
    #[error(transparent)]
    BuildInfoStore(#[from] BuildInfoStoreError),
    #[error(transparent)]
    ArtifactStore(#[from] ArtifactStoreError),
}

impl Categorized for EngineError {
    fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Aggregate(e) => e.category(),
            EngineError::UnknownTask(_) => ErrorCategory::User,
            EngineError::BuildInfoStore(e) => e.category(),
            EngineError::ArtifactStore(e) => e.category(),
        }
    }
}

/// The `.bob` directory under a bob root, holding the build-info log and
/// the artifact store. Mirrors the layout `pkg/bobutil.FindBobRoot` looks
/// for.
pub const BOB_DIR_NAME: &str = ".bob";

pub struct RunSpec {
    pub root_dir: PathBuf,
    pub task: TaskId,
    pub enable_caching: bool,
    pub concurrency: usize,
}

/// Aggregates the manifest tree rooted at `spec.root_dir`, builds a
/// playbook targeting `spec.task`, and runs it to completion (or until
/// `cancel` fires).
pub async fn build(spec: RunSpec, cancel: CancellationToken) -> Result<RunSummary, EngineError> {
    let aggregate = Aggregate::build(&spec.root_dir, spec.enable_caching)?;

    if !aggregate.tasks.contains_key(&spec.task) {
        return Err(EngineError::UnknownTask(spec.task));
    }

    let reachable = reachable_tasks(&aggregate, &spec.task);

    let bob_dir = spec.root_dir.join(BOB_DIR_NAME);
    let build_info = BuildInfoStore::new(bob_dir.join("buildinfo"))?;
    let artifacts = ArtifactStore::new(bob_dir.join("artifacts"))?;

    let (playbook, ready_rx) = Playbook::new(reachable, spec.task);
    let runner = Runner::new(build_info, artifacts);

    Ok(runner
        .run(
            playbook,
            ready_rx,
            RunnerOptions { concurrency: spec.concurrency.max(1) },
            cancel,
        )
        .await)
}

/// Restricts the aggregate's task map to `target` and everything it
/// transitively depends on, via `bob-graph-utils::transitive_closure`. A
/// playbook only needs to know about the subgraph it's actually going to
/// run.
fn reachable_tasks(
    aggregate: &Aggregate,
    target: &TaskId,
) -> std::collections::BTreeMap<TaskId, crate::task::Task> {
    use petgraph::{Direction, graph::Graph};

    let mut graph = Graph::<TaskId, ()>::new();
    let mut indices = std::collections::BTreeMap::new();
    for id in aggregate.tasks.keys() {
        indices.insert(id.clone(), graph.add_node(id.clone()));
    }
    for task in aggregate.tasks.values() {
        let from = indices[&task.name];
        for dep in &task.depends_on {
            graph.add_edge(from, indices[dep], ());
        }
    }

    let start = indices[target];
    let closure = bob_graph_utils::transitive_closure(&graph, [start], Direction::Outgoing);

    aggregate
        .tasks
        .iter()
        .filter(|(id, _)| closure.contains(*id))
        .map(|(id, task)| (id.clone(), task.clone()))
        .collect()
}

/// Finds the nearest ancestor directory (including `start`) containing a
/// `.bob` directory, the same upward walk `FindBobRoot` performs, stopping
/// at the user's home directory or the filesystem root.
pub fn find_bob_root(start: &Path) -> Option<PathBuf> {
    let home = dirs_next::home_dir();
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(BOB_DIR_NAME).is_dir() {
            return Some(dir);
        }
        if Some(&dir) == home.as_ref() || dir.parent().is_none() {
            return None;
        }
        dir = dir.parent().unwrap().to_path_buf();
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn builds_a_linear_chain() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join(crate::manifest::MANIFEST_FILE_NAME),
            r#"
tasks:
  build:
    command: "echo building > build.out"
    depends_on: ["compile"]
    target:
      type: path
      paths: ["build.out"]
  compile:
    command: "echo compiling > compile.out"
    target:
      type: path
      paths: ["compile.out"]
"#,
        )
        .unwrap();

        let summary = build(
            RunSpec {
                root_dir: root.path().to_path_buf(),
                task: TaskId::new("build"),
                enable_caching: true,
                concurrency: 2,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(summary.succeeded());
        assert_eq!(summary.outcomes.len(), 2);
        assert!(root.path().join("build.out").exists());
        assert!(root.path().join("compile.out").exists());
    }

    #[tokio::test]
    async fn unknown_target_task_is_an_error() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join(crate::manifest::MANIFEST_FILE_NAME),
            "tasks:\n  build:\n    command: \"true\"\n",
        )
        .unwrap();

        let result = build(
            RunSpec {
                root_dir: root.path().to_path_buf(),
                task: TaskId::new("does-not-exist"),
                enable_caching: true,
                concurrency: 1,
            },
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(EngineError::UnknownTask(_))));
    }

    #[test]
    fn find_bob_root_walks_up_to_an_ancestor_bob_dir() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join(BOB_DIR_NAME)).unwrap();
        let nested = root.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_bob_root(&nested), Some(root.path().to_path_buf()));
    }
}
