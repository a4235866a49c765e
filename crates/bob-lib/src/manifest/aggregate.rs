//! Recursively reads a manifest and everything it imports into a single
//! merged task graph, wires dependency exports into environment variables,
//! and validates the result is acyclic.
//!
//! Grounded on `bob/aggregate.go`'s `Aggregate`/`AggregateSparse`: the
//! variable-merge loop, the `taskNameToEnvironment`/export-wiring loop, and
//! forcing `RebuildAlways` when caching is disabled are all translated
//! field-for-field from that file. Cycle detection is delegated to
//! `bob-graph-utils::validate_graph`, itself grounded on
//! `turborepo-graph-utils`.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use path_clean::PathClean;
use petgraph::graph::Graph;
use semver::Version;
use thiserror::Error;
use tracing::warn;

use crate::{
    error::{Categorized, ErrorCategory},
    manifest::{Manifest, ManifestError},
    task::{RebuildPolicy, Task, TaskId},
};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no {} found in {0}", crate::manifest::MANIFEST_FILE_NAME, .0.display())]
    MissingTopLevelManifest(PathBuf),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("task {task} depends on {dependency}, which does not exist")]
    MissingDependency { task: TaskId, dependency: TaskId },
    #[error(transparent)]
    Graph(#[from] bob_graph_utils::Error),
    #[error("import cycle detected at {0}")]
    ImportCycle(PathBuf),
}

impl Categorized for AggregateError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::User
    }
}

/// The merged, validated task graph for a bob root and everything it
/// transitively imports.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub root_dir: PathBuf,
    pub tasks: BTreeMap<TaskId, Task>,
}

/// One manifest discovered while walking `imports`, together with the
/// task-name prefix it contributes (its directory, relative to the root).
struct Discovered {
    prefix: String,
    manifest: Manifest,
}

impl Aggregate {
    /// Reads `root_dir`'s manifest and all manifests it imports, merges
    /// their tasks into one graph, and validates it.
    ///
    /// `enable_caching` mirrors the `b.enableCaching` field threaded through
    /// `Aggregate()`: when caching is off every task's rebuild policy is
    /// forced to [`RebuildPolicy::Always`] regardless of what the manifest
    /// declared.
    pub fn build(root_dir: &Path, enable_caching: bool) -> Result<Self, AggregateError> {
        if !root_dir.join(crate::manifest::MANIFEST_FILE_NAME).is_file() {
            return Err(AggregateError::MissingTopLevelManifest(root_dir.to_path_buf()));
        }

        let discovered = discover(root_dir, root_dir, &mut HashSet::new())?;
        print_version_compatibility(&discovered);

        let mut tasks = BTreeMap::new();
        for Discovered { prefix, manifest } in &discovered {
            for (local_name, task) in &manifest.tasks {
                let mut task = task.clone();
                task.name = TaskId::prefixed(prefix, local_name);
                task.depends_on = task
                    .depends_on
                    .iter()
                    .map(|dep| TaskId::prefixed(prefix, dep.as_str()))
                    .collect();
                tasks.insert(task.name.clone(), task);
            }
        }

        // Merge each manifest's `variables` into every task it declared,
        // uppercased, before resolving exports: `Aggregate()` does the same
        // ordering so an export can't shadow a variable with the same
        // generated name silently.
        for Discovered { prefix, manifest } in &discovered {
            for (variable, value) in &manifest.variables {
                for (local_name, _) in &manifest.tasks {
                    let id = TaskId::prefixed(prefix, local_name);
                    if let Some(task) = tasks.get_mut(&id) {
                        task.add_env(variable.to_uppercase(), value.clone());
                    }
                }
            }
        }

        wire_exports(&mut tasks, root_dir)?;

        for task in tasks.values_mut() {
            if !enable_caching {
                task.rebuild_policy = RebuildPolicy::Always;
            }
        }

        let aggregate = Aggregate {
            root_dir: root_dir.to_path_buf(),
            tasks,
        };
        aggregate.verify()?;
        Ok(aggregate)
    }

    /// Checks the merged task graph has no cycles and every `depends_on`
    /// points at a task that exists.
    pub fn verify(&self) -> Result<(), AggregateError> {
        let mut graph = Graph::<TaskId, ()>::new();
        let mut indices = BTreeMap::new();
        for id in self.tasks.keys() {
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }
        for task in self.tasks.values() {
            let &from = indices.get(&task.name).expect("task indexed above");
            for dep in &task.depends_on {
                let &to = indices.get(dep).ok_or_else(|| AggregateError::MissingDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
        }
        bob_graph_utils::validate_graph(&graph)?;
        Ok(())
    }
}

/// Wires each task's dependency exports into environment variables.
///
/// For a task depending on `second-level/openapi`, which exports
/// `spec` -> `openapi.yaml`, the dependent gets
/// `SECOND_LEVEL_OPENAPI_SPEC=<path to openapi.yaml relative to the
/// aggregate root>`. Mirrors the export loop in `Aggregate()` exactly,
/// including making the path relative to the aggregate's directory via
/// prefix stripping rather than a general path-diff.
fn wire_exports(tasks: &mut BTreeMap<TaskId, Task>, root_dir: &Path) -> Result<(), AggregateError> {
    let snapshot = tasks.clone();

    for task in tasks.values_mut() {
        for dependency_name in &task.depends_on {
            let dependency = snapshot
                .get(dependency_name)
                .ok_or_else(|| AggregateError::MissingDependency {
                    task: task.name.clone(),
                    dependency: dependency_name.clone(),
                })?;

            for (export_name, export_path) in &dependency.exports {
                let env_var = dependency_name.export_env_var(export_name);
                let absolute = dependency.dir.join(export_path).clean();
                let value = absolute
                    .strip_prefix(root_dir)
                    .unwrap_or(&absolute)
                    .to_string_lossy()
                    .into_owned();
                task.add_env(env_var, value);
            }
        }
    }
    Ok(())
}

/// Walks `imports` depth-first from `dir`, reading every manifest reached
/// and recording the directory-relative prefix each one contributes.
/// Guards against import cycles by tracking canonicalized directories
/// already visited.
fn discover(root_dir: &Path, dir: &Path, visited: &mut HashSet<PathBuf>) -> Result<Vec<Discovered>, AggregateError> {
    let canonical = dir.clean();
    if !visited.insert(canonical.clone()) {
        return Err(AggregateError::ImportCycle(canonical));
    }

    let manifest = Manifest::read(dir)?;
    let prefix = dir
        .clean()
        .strip_prefix(root_dir.clean())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = Vec::new();
    for import_dir in manifest.imports.clone() {
        out.extend(discover(root_dir, &import_dir, visited)?);
    }
    out.push(Discovered { prefix, manifest });
    Ok(out)
}

/// Warns (never errors) when an imported manifest's declared version is
/// incompatible with this build of bob. Mirrors `PrintVersionCompatibility`:
/// a major-version mismatch or a manifest newer than the binary both print
/// a warning and move on.
fn print_version_compatibility(discovered: &[Discovered]) {
    let Ok(bin_version) = Version::parse(env!("CARGO_PKG_VERSION")) else {
        return;
    };

    for Discovered { manifest, .. } in discovered {
        let Some(manifest_version) = &manifest.version else {
            continue;
        };

        if bin_version.major != manifest_version.major {
            warn!(
                manifest_dir = %manifest.dir.display(),
                manifest_version = %manifest_version,
                bin_version = %bin_version,
                "manifest major version differs from bob's version; this may cause unexpected errors"
            );
            continue;
        }

        if &bin_version < manifest_version {
            warn!(
                manifest_dir = %manifest.dir.display(),
                manifest_version = %manifest_version,
                bin_version = %bin_version,
                "manifest version is newer than bob's version; some features may not work as expected"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn write_manifest(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(crate::manifest::MANIFEST_FILE_NAME), contents).unwrap();
    }

    #[test]
    fn merges_a_single_manifest() {
        let root = tempdir().unwrap();
        write_manifest(
            root.path(),
            r#"
tasks:
  build:
    command: "echo build"
"#,
        );

        let aggregate = Aggregate::build(root.path(), true).unwrap();
        assert!(aggregate.tasks.contains_key(&TaskId::new("build")));
    }

    #[test]
    fn merges_imported_manifest_with_prefix() {
        let root = tempdir().unwrap();
        write_manifest(
            root.path(),
            r#"
imports:
  - lib
tasks:
  build:
    command: "echo build"
    depends_on: ["lib/compile"]
"#,
        );
        write_manifest(
            &root.path().join("lib"),
            r#"
tasks:
  compile:
    command: "echo compile"
"#,
        );

        let aggregate = Aggregate::build(root.path(), true).unwrap();
        assert!(aggregate.tasks.contains_key(&TaskId::new("build")));
        assert!(aggregate.tasks.contains_key(&TaskId::new("lib/compile")));
    }

    #[test]
    fn exports_become_environment_variables_on_dependents() {
        let root = tempdir().unwrap();
        write_manifest(
            root.path(),
            r#"
imports:
  - second-level
tasks:
  build:
    command: "echo build"
    depends_on: ["second-level/openapi"]
"#,
        );
        write_manifest(
            &root.path().join("second-level"),
            r#"
tasks:
  openapi:
    command: "echo openapi"
    exports:
      spec: openapi.yaml
"#,
        );

        let aggregate = Aggregate::build(root.path(), true).unwrap();
        let build = &aggregate.tasks[&TaskId::new("build")];
        assert_eq!(
            build.env.get("SECOND_LEVEL_OPENAPI_SPEC").map(String::as_str),
            Some("second-level/openapi.yaml")
        );
    }

    #[test]
    fn caching_disabled_forces_always_rebuild() {
        let root = tempdir().unwrap();
        write_manifest(
            root.path(),
            r#"
tasks:
  build:
    command: "echo build"
"#,
        );

        let aggregate = Aggregate::build(root.path(), false).unwrap();
        assert_eq!(
            aggregate.tasks[&TaskId::new("build")].rebuild_policy,
            RebuildPolicy::Always
        );
    }

    #[test]
    fn cyclic_dependency_is_rejected() {
        let root = tempdir().unwrap();
        write_manifest(
            root.path(),
            r#"
tasks:
  a:
    command: "echo a"
    depends_on: ["b"]
  b:
    command: "echo b"
    depends_on: ["a"]
"#,
        );

        assert!(Aggregate::build(root.path(), true).is_err());
    }

    #[test]
    fn missing_top_level_manifest_is_reported() {
        let root = tempdir().unwrap();
        assert!(matches!(
            Aggregate::build(root.path(), true),
            Err(AggregateError::MissingTopLevelManifest(_))
        ));
    }
}
