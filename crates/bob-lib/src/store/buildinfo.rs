//! Records one JSON file per task hash describing the last build of that
//! hash: when it ran, how long it took, and whether it succeeded.
//!
//! Grounded on `pkg/buildinfostore/protostore.go` (`NewBuildInfo` /
//! `GetBuildInfo` / `GetBuildInfos` / `Clean`), translated from a
//! protobuf-per-hash-file layout to `serde_json`, and on
//! `turborepo-cache/src/fs.rs`'s write-to-temp-then-rename pattern for
//! atomic metadata writes.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Categorized, ErrorCategory};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub task_name: String,
    pub hash: String,
    pub started_at_unix_ms: u64,
    pub duration_ms: u64,
    pub success: bool,
    /// Content hash of every file under the task's target at the time this
    /// build completed, keyed by path relative to the task's directory.
    /// Mirrors the `Targets map[hash.In]string` field `protostore.go`
    /// unmarshals into `buildinfo.I`; the runner recomputes these live on a
    /// potential cache hit and only serves the cache if they still match.
    #[serde(default)]
    pub target_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum BuildInfoStoreError {
    #[error("build info for hash {0} does not exist")]
    NotFound(String),
    #[error("refusing to clean {0}: looks like a root or home directory")]
    UnsafeCleanTarget(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed build info record for hash {hash}: {source}")]
    Malformed {
        hash: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Categorized for BuildInfoStoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            BuildInfoStoreError::NotFound(_) => ErrorCategory::Store,
            BuildInfoStoreError::UnsafeCleanTarget(_) => ErrorCategory::Internal,
            BuildInfoStoreError::Io(_) => ErrorCategory::Store,
            BuildInfoStoreError::Malformed { .. } => ErrorCategory::Store,
        }
    }
}

/// A directory of build-info records, one JSON file per hash.
pub struct BuildInfoStore {
    dir: PathBuf,
}

impl BuildInfoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BuildInfoStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Writes `info` for `info.hash`, replacing any prior record for that
    /// hash. Writes to a process-unique temp file first and renames into
    /// place so a reader never observes a partially written record.
    pub fn put(&self, info: &BuildInfo) -> Result<(), BuildInfoStoreError> {
        let body = serde_json::to_vec_pretty(info).map_err(|source| BuildInfoStoreError::Malformed {
            hash: info.hash.clone(),
            source,
        })?;

        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", info.hash, std::process::id()));
        fs::write(&temp_path, &body)?;
        fs::rename(&temp_path, self.record_path(&info.hash))?;
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Result<BuildInfo, BuildInfoStoreError> {
        let path = self.record_path(hash);
        let body = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BuildInfoStoreError::NotFound(hash.to_string())
            } else {
                BuildInfoStoreError::Io(e)
            }
        })?;
        serde_json::from_slice(&body).map_err(|source| BuildInfoStoreError::Malformed {
            hash: hash.to_string(),
            source,
        })
    }

    /// All recorded build infos, keyed by hash, in sorted (deterministic)
    /// order.
    pub fn all(&self) -> Result<BTreeMap<String, BuildInfo>, BuildInfoStoreError> {
        let mut out = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            out.insert(name.to_string(), self.get(&name)?);
        }
        Ok(out)
    }

    /// Deletes every record in the store. Refuses if the store directory is
    /// `/` or the user's home directory, mirroring `filestore.go`'s safety
    /// check so a misconfigured cache directory can't wipe a home folder.
    pub fn clean(&self) -> Result<(), BuildInfoStoreError> {
        assert_safe_to_clean(&self.dir)?;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

pub(crate) fn assert_safe_to_clean(dir: &Path) -> Result<(), BuildInfoStoreError> {
    if dir == Path::new("/") {
        return Err(BuildInfoStoreError::UnsafeCleanTarget(dir.to_path_buf()));
    }
    if let Some(home) = dirs_next::home_dir() {
        if dir == home {
            return Err(BuildInfoStoreError::UnsafeCleanTarget(dir.to_path_buf()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    fn sample(hash: &str) -> BuildInfo {
        BuildInfo {
            task_name: "svc/build".into(),
            hash: hash.into(),
            started_at_unix_ms: 0,
            duration_ms: 12,
            success: true,
            target_hashes: BTreeMap::from([("out.txt".to_string(), "deadbeef".to_string())]),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = BuildInfoStore::new(dir.path()).unwrap();
        store.put(&sample("abc123")).unwrap();
        assert_eq!(store.get("abc123").unwrap(), sample("abc123"));
    }

    #[test]
    fn missing_hash_is_not_found() {
        let dir = tempdir().unwrap();
        let store = BuildInfoStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get("nope"),
            Err(BuildInfoStoreError::NotFound(_))
        ));
    }

    #[test]
    fn all_lists_every_record_sorted() {
        let dir = tempdir().unwrap();
        let store = BuildInfoStore::new(dir.path()).unwrap();
        store.put(&sample("bbb")).unwrap();
        store.put(&sample("aaa")).unwrap();

        let all = store.all().unwrap();
        let keys: Vec<_> = all.keys().collect();
        assert_eq!(keys, vec!["aaa", "bbb"]);
    }

    #[test]
    fn refuses_to_clean_home_directory() {
        let home = dirs_next::home_dir().unwrap();
        assert!(assert_safe_to_clean(&home).is_err());
    }

    #[test]
    fn cleans_a_normal_directory() {
        let dir = tempdir().unwrap();
        let store = BuildInfoStore::new(dir.path()).unwrap();
        store.put(&sample("abc")).unwrap();
        store.clean().unwrap();
        assert!(store.all().unwrap().is_empty());
    }
}
