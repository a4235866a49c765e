//! Reading a single `bob.yml` manifest off disk. [`aggregate`] composes many
//! of these, resolved from nested `imports`, into one task graph.

pub mod aggregate;
pub mod raw;

use std::{collections::BTreeMap, fs, io, path::PathBuf};

use semver::Version;
use thiserror::Error;

use crate::{
    error::{Categorized, ErrorCategory},
    task::{Task, TaskId},
};

pub const MANIFEST_FILE_NAME: &str = "bob.yml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: invalid version {version:?}: {source}")]
    InvalidVersion {
        path: PathBuf,
        version: String,
        #[source]
        source: semver::Error,
    },
}

impl Categorized for ManifestError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::User
    }
}

/// A manifest, resolved from its raw YAML form but not yet merged with its
/// imports: task names here are local (unprefixed) and `depends_on`
/// references are still local names.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub dir: PathBuf,
    pub version: Option<Version>,
    pub project: Option<String>,
    pub imports: Vec<PathBuf>,
    pub variables: BTreeMap<String, String>,
    pub tasks: BTreeMap<String, Task>,
}

impl Manifest {
    /// Reads and parses `dir/bob.yml`.
    pub fn read(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        let manifest_path = dir.join(MANIFEST_FILE_NAME);

        let contents = fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        let raw = raw::parse(&contents).map_err(|source| ManifestError::Parse {
            path: manifest_path.clone(),
            source,
        })?;

        let version = raw
            .version
            .as_ref()
            .map(|v| {
                Version::parse(v).map_err(|source| ManifestError::InvalidVersion {
                    path: manifest_path.clone(),
                    version: v.clone(),
                    source,
                })
            })
            .transpose()?;

        let tasks = raw
            .tasks
            .into_iter()
            .map(|(name, raw_task)| {
                let task = Task {
                    name: TaskId::new(name.clone()),
                    dir: dir.clone(),
                    command: raw_task.command,
                    depends_on: raw_task.depends_on.into_iter().map(TaskId::new).collect(),
                    inputs: raw_task.inputs.into_iter().map(PathBuf::from).collect(),
                    exports: raw_task
                        .exports
                        .into_iter()
                        .map(|(k, v)| (k, PathBuf::from(v)))
                        .collect(),
                    env: raw_task.env,
                    target: raw_task.target,
                    rebuild_policy: raw_task.rebuild_policy,
                    nix_deps: raw_task.nix_deps,
                };
                (name, task)
            })
            .collect();

        Ok(Manifest {
            imports: raw.imports.into_iter().map(|p| dir.join(p)).collect(),
            dir,
            version,
            project: raw.project,
            variables: raw.variables,
            tasks,
        })
    }
}
