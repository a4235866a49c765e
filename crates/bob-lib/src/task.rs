//! A single build step: its command, declared inputs/outputs, and the
//! dependencies it needs completed first.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// A task name, qualified by the project-relative path of the manifest that
/// declared it, e.g. `services/api/build`. Simpler than
/// `turborepo-lib`'s `TaskId<'static>` (package name + `#` + task name)
/// since bob manifests nest by directory rather than by package name; see
/// `addTaskPrefix`/`taskNameToEnvironment` in `bob/aggregate.go`, which this
/// mirrors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins a manifest-relative prefix onto a task name declared inside
    /// that manifest, e.g. prefix `services/api`, name `build` ->
    /// `services/api/build`. Root-level manifests have an empty prefix, so
    /// the leading separator is trimmed, matching `addTaskPrefix`.
    pub fn prefixed(prefix: &str, name: &str) -> Self {
        if prefix.is_empty() {
            return Self(name.to_string());
        }
        Self(format!("{prefix}/{name}"))
    }

    /// The environment variable name an export of this task is wired to on
    /// a dependent, e.g. task `second-level/openapi`, export `spec` ->
    /// `SECOND_LEVEL_OPENAPI_SPEC`. Mirrors `taskNameToEnvironment` exactly:
    /// split on `/`, append the export name, join with `_`, replace `-` and
    /// `.` with `_`, uppercase.
    pub fn export_env_var(&self, export_name: &str) -> String {
        let mut parts: Vec<&str> = self.0.split('/').collect();
        parts.push(export_name);
        parts
            .join("_")
            .replace(['-', '.'], "_")
            .to_uppercase()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What a task produces, and how to tell whether that output already
/// exists. Grounded on `bobtask/target/exists.go`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// The task's output is a set of filesystem paths, relative to the
    /// task's directory.
    Path { paths: Vec<PathBuf> },
    /// The task's output is a container image; bob has no way to probe
    /// whether it's present, so `exists` conservatively reports `true`
    /// (the original always returns `true` for Docker targets too).
    Docker,
}

impl Target {
    /// Mirrors `Target.Exists()`: a path target with no declared output
    /// paths is considered to always exist (there's nothing to check), and
    /// a Docker target always exists because bob can't inspect image
    /// registries.
    pub fn exists(&self, task_dir: &Path) -> bool {
        match self {
            Target::Docker => true,
            Target::Path { paths } => {
                if paths.is_empty() {
                    return true;
                }
                paths.iter().all(|p| task_dir.join(p).exists())
            }
        }
    }
}

/// When a task should be rebuilt even if its input hash matches a prior
/// build-info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPolicy {
    /// Rebuild only if the computed task hash differs from the last
    /// recorded hash, or the declared target is missing.
    IfChanged,
    /// Always rebuild, regardless of hash or target presence. Forced on
    /// every task when caching is disabled, matching
    /// `task.SetRebuildStrategy(bobtask.RebuildAlways)` in `Aggregate`.
    Always,
}

/// A single node in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: TaskId,
    pub dir: PathBuf,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Input file paths, relative to `dir`, that feed this task's hash.
    /// Populated by a language-specific input-discovery step that lives
    /// outside this crate; bob only needs the resolved list.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Named outputs this task exposes to dependents, relative to `dir`.
    #[serde(default)]
    pub exports: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub target: Target,
    #[serde(default = "default_rebuild_policy")]
    pub rebuild_policy: RebuildPolicy,
    /// Opaque identifiers for this task's external (Nix) dependencies.
    /// bob doesn't resolve or validate these itself; they're folded into
    /// the task's input hash so a dependency-set change forces a rebuild,
    /// mirroring how `nix_builder.go` resolves a task's `Dependencies()`
    /// into its build environment before the task runs.
    #[serde(default)]
    pub nix_deps: Vec<String>,
}

fn default_rebuild_policy() -> RebuildPolicy {
    RebuildPolicy::IfChanged
}

impl Task {
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }
}
