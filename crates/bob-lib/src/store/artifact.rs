//! Stores task output artifacts as uncompressed tar archives, one per
//! content hash.
//!
//! Grounded on `pkg/store/filestore/filestore.go` (`NewArtifact` opens for
//! write and overwrites, `GetArtifact` opens for read, `Clean` refuses to
//! touch `/` or the home directory) and on `turborepo-cache`'s choice of the
//! `tar` crate for archiving task outputs. We skip the zstd compression
//! layer `turborepo-cache`'s `FSCache` adds on top of `tar`: bob artifacts
//! are typically small build outputs restored on the same machine, so the
//! extra dependency and CPU cost isn't worth it here.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    error::{Categorized, ErrorCategory},
    store::buildinfo::assert_safe_to_clean,
};

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("no artifact stored for hash {0}")]
    NotFound(String),
    #[error("refusing to clean {0}: looks like a root or home directory")]
    UnsafeCleanTarget(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Categorized for ArtifactStoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            ArtifactStoreError::NotFound(_) => ErrorCategory::Store,
            ArtifactStoreError::UnsafeCleanTarget(_) => ErrorCategory::Internal,
            ArtifactStoreError::Io(_) => ErrorCategory::Store,
        }
    }
}

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArtifactStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn archive_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.tar"))
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.archive_path(hash).is_file()
    }

    /// Archives `paths` (given relative to `base_dir`) into a tar file named
    /// after `hash`. Writes to a temp file in the same directory and renames
    /// into place, so a reader never observes a half-written archive.
    pub fn put(&self, hash: &str, base_dir: &Path, paths: &[PathBuf]) -> Result<(), ArtifactStoreError> {
        let temp_path = self.dir.join(format!(".{hash}.{}.tmp", std::process::id()));

        {
            let file = File::create(&temp_path)?;
            let mut builder = tar::Builder::new(file);
            for rel in paths {
                let full = base_dir.join(rel);
                if full.is_dir() {
                    builder.append_dir_all(rel, &full)?;
                } else {
                    builder.append_path_with_name(&full, rel)?;
                }
            }
            builder.finish()?;
        }

        fs::rename(&temp_path, self.archive_path(hash))?;
        Ok(())
    }

    /// Extracts the archive for `hash` into `dest_dir`, which is created if
    /// missing.
    pub fn restore(&self, hash: &str, dest_dir: &Path) -> Result<(), ArtifactStoreError> {
        let path = self.archive_path(hash);
        if !path.is_file() {
            return Err(ArtifactStoreError::NotFound(hash.to_string()));
        }
        fs::create_dir_all(dest_dir)?;
        let file = File::open(&path)?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(dest_dir)?;
        Ok(())
    }

    /// Deletes every archive in the store, with the same safety check the
    /// build-info store uses.
    pub fn clean(&self) -> Result<(), ArtifactStoreError> {
        assert_safe_to_clean(&self.dir).map_err(|_| ArtifactStoreError::UnsafeCleanTarget(self.dir.clone()))?;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn put_then_restore_round_trips_a_file() {
        let store_dir = tempdir().unwrap();
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();

        fs::write(src_dir.path().join("out.txt"), b"hello").unwrap();

        let store = ArtifactStore::new(store_dir.path()).unwrap();
        store
            .put("h1", src_dir.path(), &[PathBuf::from("out.txt")])
            .unwrap();
        assert!(store.exists("h1"));

        store.restore("h1", dest_dir.path()).unwrap();
        let restored = fs::read_to_string(dest_dir.path().join("out.txt")).unwrap();
        assert_eq!(restored, "hello");
    }

    #[test]
    fn restoring_missing_hash_errors() {
        let store_dir = tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path()).unwrap();
        let dest_dir = tempdir().unwrap();
        assert!(matches!(
            store.restore("missing", dest_dir.path()),
            Err(ArtifactStoreError::NotFound(_))
        ));
    }
}
