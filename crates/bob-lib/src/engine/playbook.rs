//! Tracks the state of every task in a build and decides which ones are
//! ready to run.
//!
//! Grounded on `bob/build/playbook.go`, with one deliberate redesign. The
//! original recursively walks the whole task tree on every state change and
//! bails out via a sentinel `Done` error as soon as it finds a single ready
//! task, relying on being re-invoked (`next`) after every completion to
//! eventually dispatch everything. That walk-and-bail-on-first-match shape
//! is hard to reason about under concurrent dispatch: nothing stops two
//! callers from discovering (and sending) the same ready task twice. This
//! version keeps the same state names and the same completion callbacks
//! (`task_completed`, `task_no_rebuild_required`, `task_failed`,
//! `task_canceled`) but scans for *every* currently-ready task on each pass
//! and transitions each one to `Dispatched` before it's handed to a worker,
//! so a task can only ever be sent once.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::mpsc;

use crate::task::{Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Dispatched,
    Completed,
    NoRebuildRequired,
    Failed,
    Canceled,
}

impl TaskState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::NoRebuildRequired | TaskState::Failed | TaskState::Canceled
        )
    }

    fn satisfies_dependents(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::NoRebuildRequired)
    }
}

#[derive(Debug, Default)]
struct TaskStatus {
    state: Option<TaskState>,
    start: Option<SystemTime>,
    end: Option<SystemTime>,
}

/// Tracks task readiness and completion for one build. Cheap to clone
/// (everything's behind `Arc`), so it can be shared between the dispatch
/// loop and every spawned worker.
pub struct Playbook {
    tasks: BTreeMap<TaskId, Task>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    status: HashMap<TaskId, Mutex<TaskStatus>>,
    root: TaskId,
    ready_tx: tokio::sync::Mutex<Option<mpsc::Sender<TaskId>>>,
}

impl Playbook {
    /// Builds a playbook over `tasks`, targeting `root`. Returns the
    /// playbook and the receiving end of its ready-task channel; a worker
    /// pool drains that channel and reports back via the `task_*` methods.
    pub fn new(tasks: BTreeMap<TaskId, Task>, root: TaskId) -> (Arc<Self>, mpsc::Receiver<TaskId>) {
        let (tx, rx) = mpsc::channel(tasks.len().max(1));

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in tasks.values() {
            for dep in &task.depends_on {
                dependents.entry(dep.clone()).or_default().push(task.name.clone());
            }
        }

        let status = tasks
            .keys()
            .cloned()
            .map(|id| (id, Mutex::new(TaskStatus { state: Some(TaskState::Pending), ..Default::default() })))
            .collect();

        let playbook = Arc::new(Self {
            tasks,
            dependents,
            status,
            root,
            ready_tx: tokio::sync::Mutex::new(Some(tx)),
        });
        (playbook, rx)
    }

    pub fn task(&self, id: &TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn state(&self, id: &TaskId) -> TaskState {
        self.status[id].lock().unwrap().state.expect("state always set")
    }

    fn set_state(&self, id: &TaskId, state: TaskState) {
        let mut status = self.status[id].lock().unwrap();
        if state == TaskState::Dispatched {
            status.start = Some(SystemTime::now());
        }
        if state.is_terminal() {
            status.end = Some(SystemTime::now());
        }
        status.state = Some(state);
    }

    fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        self.tasks[id]
            .depends_on
            .iter()
            .all(|dep| self.state(dep).satisfies_dependents())
    }

    fn dependency_failed_or_canceled(&self, id: &TaskId) -> bool {
        self.tasks[id]
            .depends_on
            .iter()
            .any(|dep| matches!(self.state(dep), TaskState::Failed | TaskState::Canceled))
    }

    /// True if running `id` would be pointless even with a matching input
    /// hash, because some transitive dependency actually rebuilt. Mirrors
    /// `TaskNeedsRebuild`'s tree walk: a rebuild anywhere upstream forces a
    /// rebuild downstream, no matter what this task's own hash says.
    pub fn dependency_rebuilt(&self, id: &TaskId) -> bool {
        let mut seen = HashSet::new();
        self.dependency_rebuilt_inner(id, &mut seen)
    }

    fn dependency_rebuilt_inner(&self, id: &TaskId, seen: &mut HashSet<TaskId>) -> bool {
        if !seen.insert(id.clone()) {
            return false;
        }
        self.tasks[id].depends_on.iter().any(|dep| {
            self.state(dep) == TaskState::Completed || self.dependency_rebuilt_inner(dep, seen)
        })
    }

    /// Sends every pending task whose dependencies are all satisfied,
    /// marking each `Dispatched` as it's sent. Called once at the start of
    /// a run and again after every task reaches a terminal state.
    async fn dispatch_ready(&self) {
        let mut tx_guard = self.ready_tx.lock().await;
        let Some(tx) = tx_guard.as_ref() else {
            return;
        };

        let mut ready = Vec::new();
        for id in self.tasks.keys() {
            if self.state(id) != TaskState::Pending {
                continue;
            }
            if self.dependency_failed_or_canceled(id) {
                self.set_state(id, TaskState::Canceled);
                continue;
            }
            if self.dependencies_satisfied(id) {
                ready.push(id.clone());
            }
        }

        for id in ready {
            self.set_state(&id, TaskState::Dispatched);
            if tx.send(id).await.is_err() {
                break;
            }
        }

        if self.state(&self.root).is_terminal() {
            *tx_guard = None;
        }
    }

    pub async fn start(self: &Arc<Self>) {
        self.dispatch_ready().await;
    }

    pub async fn task_completed(&self, id: &TaskId) {
        self.set_state(id, TaskState::Completed);
        self.dispatch_ready().await;
    }

    pub async fn task_no_rebuild_required(&self, id: &TaskId) {
        self.set_state(id, TaskState::NoRebuildRequired);
        self.dispatch_ready().await;
    }

    pub async fn task_failed(&self, id: &TaskId) {
        self.set_state(id, TaskState::Failed);
        self.dispatch_ready().await;
    }

    pub async fn task_canceled(&self, id: &TaskId) {
        self.set_state(id, TaskState::Canceled);
        self.dispatch_ready().await;
    }

    /// Wall-clock span of the build: from the earliest dispatched task's
    /// start to the latest terminal task's end. `None` if nothing ran yet.
    pub fn execution_time(&self) -> Option<std::time::Duration> {
        let mut earliest: Option<SystemTime> = None;
        let mut latest: Option<SystemTime> = None;
        for status in self.status.values() {
            let status = status.lock().unwrap();
            if let Some(start) = status.start {
                earliest = Some(earliest.map_or(start, |e| e.min(start)));
            }
            if let Some(end) = status.end {
                latest = Some(latest.map_or(end, |l| l.max(end)));
            }
        }
        match (earliest, latest) {
            (Some(start), Some(end)) => end.duration_since(start).ok(),
            _ => None,
        }
    }

    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use crate::task::{RebuildPolicy, Target};

    use super::*;

    fn task(name: &str, depends_on: &[&str]) -> Task {
        Task {
            name: TaskId::new(name),
            dir: "/tmp".into(),
            command: "true".into(),
            depends_on: depends_on.iter().map(|d| TaskId::new(*d)).collect(),
            inputs: vec![],
            exports: Default::default(),
            env: Default::default(),
            target: Target::Path { paths: vec![] },
            rebuild_policy: RebuildPolicy::IfChanged,
            nix_deps: vec![],
        }
    }

    fn tasks(defs: &[(&str, &[&str])]) -> BTreeMap<TaskId, Task> {
        defs.iter()
            .map(|(name, deps)| (TaskId::new(*name), task(name, deps)))
            .collect()
    }

    #[tokio::test]
    async fn dispatches_root_with_no_dependencies_immediately() {
        let (playbook, mut rx) = Playbook::new(tasks(&[("a", &[])]), TaskId::new("a"));
        playbook.start().await;
        assert_eq!(rx.recv().await, Some(TaskId::new("a")));
    }

    #[tokio::test]
    async fn only_dispatches_a_dependency_once_its_completed() {
        let (playbook, mut rx) = Playbook::new(tasks(&[("a", &["b"]), ("b", &[])]), TaskId::new("a"));
        playbook.start().await;
        assert_eq!(rx.recv().await, Some(TaskId::new("b")));

        playbook.task_completed(&TaskId::new("b")).await;
        assert_eq!(rx.recv().await, Some(TaskId::new("a")));
    }

    #[tokio::test]
    async fn failure_cancels_dependents_instead_of_dispatching_them() {
        let (playbook, mut rx) = Playbook::new(tasks(&[("a", &["b"]), ("b", &[])]), TaskId::new("a"));
        playbook.start().await;
        assert_eq!(rx.recv().await, Some(TaskId::new("b")));

        playbook.task_failed(&TaskId::new("b")).await;
        assert_eq!(rx.recv().await, None);
        assert_eq!(playbook.state(&TaskId::new("a")), TaskState::Canceled);
    }

    #[tokio::test]
    async fn dependency_rebuilt_is_transitive() {
        let (playbook, mut rx) = Playbook::new(
            tasks(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]),
            TaskId::new("a"),
        );
        playbook.start().await;
        assert_eq!(rx.recv().await, Some(TaskId::new("c")));
        playbook.task_completed(&TaskId::new("c")).await;
        assert_eq!(rx.recv().await, Some(TaskId::new("b")));

        assert!(playbook.dependency_rebuilt(&TaskId::new("b")));
        playbook.task_no_rebuild_required(&TaskId::new("b")).await;
        assert!(playbook.dependency_rebuilt(&TaskId::new("a")));
    }

    #[tokio::test]
    async fn channel_closes_once_root_reaches_a_terminal_state() {
        let (playbook, mut rx) = Playbook::new(tasks(&[("a", &[])]), TaskId::new("a"));
        playbook.start().await;
        assert_eq!(rx.recv().await, Some(TaskId::new("a")));
        playbook.task_completed(&TaskId::new("a")).await;
        assert_eq!(rx.recv().await, None);
    }
}
