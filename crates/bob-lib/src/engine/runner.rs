//! Drains a [`Playbook`]'s ready-task channel with a bounded pool of
//! workers, deciding per task whether the cache can be trusted, running the
//! task's command otherwise, and reporting the outcome back to the
//! playbook.
//!
//! The worker-pool-over-a-channel shape and the `Semaphore`-bounded
//! concurrency come from `Engine::execute` in
//! `turborepo-lib/src/engine/execute.rs`. Deciding whether a task needs to
//! run at all is grounded on `bobtask/target/exists.go` (`Target::exists`)
//! together with `playbook.go`'s `TaskNeedsRebuild`, now
//! [`Playbook::dependency_rebuilt`].

use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{process::Command, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    engine::playbook::{Playbook, TaskState},
    error::{Categorized, ErrorCategory},
    hash,
    store::{ArtifactStore, ArtifactStoreError, BuildInfo, BuildInfoStore, BuildInfoStoreError},
    task::{RebuildPolicy, Target, TaskId},
};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    BuildInfoStore(#[from] BuildInfoStoreError),
    #[error(transparent)]
    ArtifactStore(#[from] ArtifactStoreError),
    #[error("could not read input file {path}: {source}")]
    ReadInput { path: PathBuf, source: std::io::Error },
    #[error("task {0} failed with exit code {1:?}")]
    TaskExitedNonZero(TaskId, Option<i32>),
}

impl Categorized for RunnerError {
    fn category(&self) -> ErrorCategory {
        match self {
            RunnerError::BuildInfoStore(e) => e.category(),
            RunnerError::ArtifactStore(e) => e.category(),
            RunnerError::ReadInput { .. } => ErrorCategory::Internal,
            RunnerError::TaskExitedNonZero(..) => ErrorCategory::TaskFailure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

pub struct RunSummary {
    pub execution_time: Option<Duration>,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.state, TaskState::Completed | TaskState::NoRebuildRequired))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub concurrency: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self { concurrency: num_cpus() }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

pub struct Runner {
    build_info: Arc<BuildInfoStore>,
    artifacts: Arc<ArtifactStore>,
}

impl Runner {
    pub fn new(build_info: BuildInfoStore, artifacts: ArtifactStore) -> Self {
        Self {
            build_info: Arc::new(build_info),
            artifacts: Arc::new(artifacts),
        }
    }

    /// Calls `playbook.start()` and then drains its ready-task channel,
    /// spawning up to `options.concurrency` tasks at once, until the
    /// channel closes (the root task reached a terminal state).
    pub async fn run(
        &self,
        playbook: Arc<Playbook>,
        mut ready_rx: tokio::sync::mpsc::Receiver<TaskId>,
        options: RunnerOptions,
        cancel: CancellationToken,
    ) -> RunSummary {
        playbook.start().await;

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut workers = JoinSet::new();

        while let Some(task_id) = ready_rx.recv().await {
            if cancel.is_cancelled() {
                playbook.task_canceled(&task_id).await;
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let playbook = playbook.clone();
            let build_info = self.build_info.clone();
            let artifacts = self.artifacts.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = permit;
                let outcome = execute_one(&playbook, &task_id, &build_info, &artifacts, &cancel).await;

                match outcome.state {
                    TaskState::Completed => playbook.task_completed(&task_id).await,
                    TaskState::NoRebuildRequired => playbook.task_no_rebuild_required(&task_id).await,
                    TaskState::Failed => playbook.task_failed(&task_id).await,
                    _ => playbook.task_canceled(&task_id).await,
                }
                outcome
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => warn!(%join_err, "worker task panicked"),
            }
        }

        RunSummary {
            execution_time: playbook.execution_time(),
            outcomes,
        }
    }
}

#[instrument(skip(playbook, build_info, artifacts, cancel), fields(task = %task_id))]
async fn execute_one(
    playbook: &Playbook,
    task_id: &TaskId,
    build_info: &BuildInfoStore,
    artifacts: &ArtifactStore,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let task = playbook.task(task_id).clone();
    let start = Instant::now();

    let computed_hash = match compute_hash(&task) {
        Ok(hash) => hash,
        Err(err) => {
            warn!(%err, "failed to hash task inputs");
            return TaskOutcome {
                task: task_id.clone(),
                state: TaskState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: err.to_string(),
                duration: start.elapsed(),
            };
        }
    };

    let previous_record = build_info.get(&computed_hash).ok();
    let cache_is_current = task.rebuild_policy == RebuildPolicy::IfChanged
        && !playbook.dependency_rebuilt(task_id)
        && previous_record.as_ref().map(|record| record.success).unwrap_or(false);

    if cache_is_current {
        let record = previous_record.as_ref().expect("checked above");

        if task.target.exists(&task.dir) {
            let live_hashes = hash::hash_target(&task.dir, &task.target).unwrap_or_default();
            if live_hashes == record.target_hashes {
                info!("no rebuild required, hash {computed_hash} matches prior build");
                return TaskOutcome {
                    task: task_id.clone(),
                    state: TaskState::NoRebuildRequired,
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: start.elapsed(),
                };
            }
            info!("cached target no longer matches its recorded hash, rebuilding");
        } else if artifacts.restore(&computed_hash, &task.dir).is_ok() {
            info!("restored cached artifact for hash {computed_hash}, no rebuild required");
            return TaskOutcome {
                task: task_id.clone(),
                state: TaskState::NoRebuildRequired,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration: start.elapsed(),
            };
        }
    }

    run_command(&task, &computed_hash, build_info, artifacts, cancel, start).await
}

async fn run_command(
    task: &crate::task::Task,
    computed_hash: &str,
    build_info: &BuildInfoStore,
    artifacts: &ArtifactStore,
    cancel: &CancellationToken,
    start: Instant,
) -> TaskOutcome {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&task.command)
        .current_dir(&task.dir)
        .envs(&task.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return TaskOutcome {
                task: task.name.clone(),
                state: TaskState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to start command: {err}"),
                duration: start.elapsed(),
            };
        }
    };

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = cancel.cancelled() => {
            return TaskOutcome {
                task: task.name.clone(),
                state: TaskState::Canceled,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration: start.elapsed(),
            };
        }
    };

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            return TaskOutcome {
                task: task.name.clone(),
                state: TaskState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to wait on command: {err}"),
                duration: start.elapsed(),
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let duration = start.elapsed();

    if !output.status.success() {
        let _ = build_info.put(&BuildInfo {
            task_name: task.name.to_string(),
            hash: computed_hash.to_string(),
            started_at_unix_ms: unix_ms_now(),
            duration_ms: duration.as_millis() as u64,
            success: false,
            target_hashes: BTreeMap::new(),
        });
        return TaskOutcome {
            task: task.name.clone(),
            state: TaskState::Failed,
            exit_code: output.status.code(),
            stdout,
            stderr,
            duration,
        };
    }

    if let Err(err) = persist_success(task, computed_hash, artifacts, duration) {
        warn!(%err, "failed to persist artifact for successful task");
    }

    let target_hashes = hash::hash_target(&task.dir, &task.target).unwrap_or_else(|err| {
        warn!(%err, "failed to hash task target after a successful run");
        BTreeMap::new()
    });

    if let Err(err) = build_info.put(&BuildInfo {
        task_name: task.name.to_string(),
        hash: computed_hash.to_string(),
        started_at_unix_ms: unix_ms_now(),
        duration_ms: duration.as_millis() as u64,
        success: true,
        target_hashes,
    }) {
        warn!(%err, "failed to record build info for successful task");
    }

    TaskOutcome {
        task: task.name.clone(),
        state: TaskState::Completed,
        exit_code: output.status.code(),
        stdout,
        stderr,
        duration,
    }
}

fn persist_success(
    task: &crate::task::Task,
    computed_hash: &str,
    artifacts: &ArtifactStore,
    _duration: Duration,
) -> Result<(), RunnerError> {
    if let Target::Path { paths } = &task.target {
        if !paths.is_empty() {
            artifacts.put(computed_hash, &task.dir, paths)?;
        }
    }
    Ok(())
}

fn compute_hash(task: &crate::task::Task) -> Result<String, RunnerError> {
    let mut input_files = Vec::with_capacity(task.inputs.len());
    for relative in &task.inputs {
        let full = task.dir.join(relative);
        let contents = std::fs::read(&full).map_err(|source| RunnerError::ReadInput {
            path: full.clone(),
            source,
        })?;
        input_files.push((relative.to_string_lossy().into_owned(), contents));
    }

    let env: BTreeMap<String, String> = task.env.clone();
    let depends_on: Vec<String> = task.depends_on.iter().map(|d| d.to_string()).collect();

    Ok(hash::hash_task(
        task.name.as_str(),
        &task.command,
        env.into_iter(),
        depends_on,
        input_files,
        task.nix_deps.iter().cloned(),
    ))
}

fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, path::Path};

    use tempfile::tempdir;

    use super::*;
    use crate::task::Task;

    fn echo_task(dir: &Path) -> Task {
        Task {
            name: TaskId::new("build"),
            dir: dir.to_path_buf(),
            command: "echo hi > out.txt".into(),
            depends_on: vec![],
            inputs: vec![],
            exports: Default::default(),
            env: BTreeMap::new(),
            target: Target::Path { paths: vec![PathBuf::from("out.txt")] },
            rebuild_policy: RebuildPolicy::IfChanged,
            nix_deps: vec![],
        }
    }

    #[tokio::test]
    async fn runs_a_task_to_completion_and_caches_it() {
        let work_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();

        let tasks: BTreeMap<TaskId, Task> =
            [(TaskId::new("build"), echo_task(work_dir.path()))].into_iter().collect();
        let (playbook, rx) = Playbook::new(tasks, TaskId::new("build"));

        let runner = Runner::new(
            BuildInfoStore::new(store_dir.path().join("buildinfo")).unwrap(),
            ArtifactStore::new(store_dir.path().join("artifacts")).unwrap(),
        );

        let summary = runner
            .run(playbook, rx, RunnerOptions { concurrency: 2 }, CancellationToken::new())
            .await;

        assert!(summary.succeeded());
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].state, TaskState::Completed);
        assert!(work_dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn a_failing_command_fails_the_task() {
        let work_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();

        let mut task = echo_task(work_dir.path());
        task.command = "exit 1".into();
        let tasks: BTreeMap<TaskId, Task> = [(TaskId::new("build"), task)].into_iter().collect();
        let (playbook, rx) = Playbook::new(tasks, TaskId::new("build"));

        let runner = Runner::new(
            BuildInfoStore::new(store_dir.path().join("buildinfo")).unwrap(),
            ArtifactStore::new(store_dir.path().join("artifacts")).unwrap(),
        );

        let summary = runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        assert!(!summary.succeeded());
        assert_eq!(summary.outcomes[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn a_second_run_with_unchanged_inputs_skips_the_command() {
        let work_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let buildinfo_dir = store_dir.path().join("buildinfo");
        let artifacts_dir = store_dir.path().join("artifacts");

        let tasks: BTreeMap<TaskId, Task> =
            [(TaskId::new("build"), echo_task(work_dir.path()))].into_iter().collect();
        let (playbook, rx) = Playbook::new(tasks.clone(), TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        let (playbook, rx) = Playbook::new(tasks, TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        let summary = runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        assert_eq!(summary.outcomes[0].state, TaskState::NoRebuildRequired);
    }

    #[tokio::test]
    async fn a_missing_output_is_restored_from_the_artifact_store_instead_of_rebuilding() {
        let work_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let buildinfo_dir = store_dir.path().join("buildinfo");
        let artifacts_dir = store_dir.path().join("artifacts");

        let tasks: BTreeMap<TaskId, Task> =
            [(TaskId::new("build"), echo_task(work_dir.path()))].into_iter().collect();
        let (playbook, rx) = Playbook::new(tasks.clone(), TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        std::fs::remove_file(work_dir.path().join("out.txt")).unwrap();

        let (playbook, rx) = Playbook::new(tasks, TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        let summary = runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        assert_eq!(summary.outcomes[0].state, TaskState::NoRebuildRequired);
        assert!(work_dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn a_tampered_output_forces_a_rebuild_even_with_unchanged_inputs() {
        let work_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let buildinfo_dir = store_dir.path().join("buildinfo");
        let artifacts_dir = store_dir.path().join("artifacts");

        let tasks: BTreeMap<TaskId, Task> =
            [(TaskId::new("build"), echo_task(work_dir.path()))].into_iter().collect();
        let (playbook, rx) = Playbook::new(tasks.clone(), TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        std::fs::write(work_dir.path().join("out.txt"), b"tampered").unwrap();

        let (playbook, rx) = Playbook::new(tasks, TaskId::new("build"));
        let runner = Runner::new(
            BuildInfoStore::new(&buildinfo_dir).unwrap(),
            ArtifactStore::new(&artifacts_dir).unwrap(),
        );
        let summary = runner
            .run(playbook, rx, RunnerOptions::default(), CancellationToken::new())
            .await;

        assert_eq!(summary.outcomes[0].state, TaskState::Completed);
        assert_eq!(
            std::fs::read_to_string(work_dir.path().join("out.txt")).unwrap(),
            "hi\n"
        );
    }
}
