//! Deterministic content hashing for tasks and their outputs.
//!
//! `turborepo-lib`'s `hash` module builds a Cap'n Proto message per task and
//! hashes its canonical byte representation so the same inputs always
//! produce the same digest regardless of map iteration order. We don't need
//! cross-language determinism, so instead of a schema compiler we hand-roll
//! a small canonical framing: every field is written as a type tag followed
//! by a length-prefixed payload, and every map-shaped input is sorted by key
//! before being fed in. The result is hashed with SHA-256, the same
//! primitive `turborepo-cache`'s `signature_authentication` module uses for
//! artifact signing.

use std::{
    collections::BTreeMap,
    fs, io,
    path::Path,
};

use sha2::{Digest, Sha256};

use crate::task::Target;

/// Wraps a running SHA-256 digest and appends framed, typed fields to it.
///
/// Framing rules:
/// - a UTF-8 string is written as its length (u64 little-endian) followed by
///   its bytes
/// - a `(&str, &str)` pair list (used for env vars and file hashes) is
///   sorted by key, then each pair is written as two framed strings
/// - a tag byte precedes each field so that, e.g., an empty list and a
///   missing field never collide on the wire
#[derive(Default)]
pub struct Hasher {
    digest: Sha256,
}

const TAG_STR: u8 = 0x01;
const TAG_PAIRS: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_framed(&mut self, tag: u8, bytes: &[u8]) {
        self.digest.update([tag]);
        self.digest.update((bytes.len() as u64).to_le_bytes());
        self.digest.update(bytes);
    }

    /// Appends a single string field (task name, command, target type tag).
    pub fn update_str(&mut self, value: &str) -> &mut Self {
        self.write_framed(TAG_STR, value.as_bytes());
        self
    }

    /// Appends raw bytes, e.g. a file's contents digest.
    pub fn update_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_framed(TAG_BYTES, value);
        self
    }

    /// Appends a key/value list (environment variables, file paths to
    /// content hashes) after sorting by key, so iteration order of the
    /// caller's map never affects the digest.
    pub fn update_pairs<'a, I>(&mut self, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut sorted: Vec<(&str, &str)> = pairs.into_iter().collect();
        sorted.sort_unstable_by_key(|(k, _)| *k);

        self.digest.update([TAG_PAIRS]);
        self.digest.update((sorted.len() as u64).to_le_bytes());
        for (key, value) in sorted {
            self.write_framed(TAG_STR, key.as_bytes());
            self.write_framed(TAG_STR, value.as_bytes());
        }
        self
    }

    /// Consumes the hasher and returns the hex-encoded digest.
    pub fn finish(self) -> String {
        hex::encode(self.digest.finalize())
    }
}

/// Convenience wrapper: hashes a single string in one call.
pub fn hash_str(value: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update_str(value);
    hasher.finish()
}

/// The deterministic input hash for a task: its qualified name, its command,
/// its environment, the names of the tasks it depends on, the content of
/// every declared input file, and its Nix dependency identifiers. Any
/// change to any of these changes the digest, which is exactly what
/// `BuildInfoStore` keys a build record by. The name is included so two
/// tasks that happen to share a command, environment and inputs don't
/// collide on the same cached artifact and build-info record; `nix_deps` is
/// included for the same reason `bob/nix_builder.go` folds a task's
/// resolved Nix dependencies into its build environment before hashing —
/// a dependency-set change has to force a rebuild even if nothing else did.
pub fn hash_task(
    name: &str,
    command: &str,
    env: impl IntoIterator<Item = (String, String)>,
    depends_on: impl IntoIterator<Item = String>,
    input_files: impl IntoIterator<Item = (String, Vec<u8>)>,
    nix_deps: impl IntoIterator<Item = String>,
) -> String {
    let mut hasher = Hasher::new();
    hasher.update_str(name);
    hasher.update_str(command);

    let env: Vec<(String, String)> = env.into_iter().collect();
    hasher.update_pairs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut deps: Vec<String> = depends_on.into_iter().collect();
    deps.sort_unstable();
    for dep in &deps {
        hasher.update_str(dep);
    }

    let mut files: Vec<(String, String)> = input_files
        .into_iter()
        .map(|(path, contents)| (path, hash_bytes(&contents)))
        .collect();
    files.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    hasher.update_pairs(files.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut nix_deps: Vec<String> = nix_deps.into_iter().collect();
    nix_deps.sort_unstable();
    for dep in &nix_deps {
        hasher.update_str(dep);
    }

    hasher.finish()
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut digest = Sha256::new();
    digest.update(bytes);
    hex::encode(digest.finalize())
}

/// Content hashes of every file under a task's declared target, keyed by
/// path relative to the task's directory. Used to tell whether a target a
/// `BuildInfoStore` record says is already built still matches what's on
/// disk, so a file edited or deleted after the build that produced it isn't
/// silently served as a cache hit. A directory target is walked recursively;
/// a `Target::Docker` target has nothing on the filesystem to hash, so it
/// always returns an empty map.
pub fn hash_target(dir: &Path, target: &Target) -> io::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if let Target::Path { paths } = target {
        for relative in paths {
            hash_target_entry(dir, &dir.join(relative), &mut out)?;
        }
    }
    Ok(out)
}

fn hash_target_entry(base: &Path, path: &Path, out: &mut BTreeMap<String, String>) -> io::Result<()> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            hash_target_entry(base, &entry?.path(), out)?;
        }
        return Ok(());
    }
    let contents = fs::read(path)?;
    let relative = path.strip_prefix(base).unwrap_or(path).to_string_lossy().into_owned();
    out.insert(relative, hash_bytes(&contents));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pairs_are_order_independent() {
        let mut a = Hasher::new();
        a.update_pairs([("B", "2"), ("A", "1")]);

        let mut b = Hasher::new();
        b.update_pairs([("A", "1"), ("B", "2")]);

        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn different_values_hash_differently() {
        assert_ne!(hash_str("a"), hash_str("b"));
    }

    #[test]
    fn hash_task_changes_when_an_input_files_contents_change() {
        let h1 = hash_task("build", "make", [], [], [("src/main.rs".to_string(), b"a".to_vec())], []);
        let h2 = hash_task("build", "make", [], [], [("src/main.rs".to_string(), b"b".to_vec())], []);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_task_is_stable_under_env_reordering() {
        let h1 = hash_task(
            "build",
            "make",
            [("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())],
            [],
            [],
            [],
        );
        let h2 = hash_task(
            "build",
            "make",
            [("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())],
            [],
            [],
            [],
        );
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_task_changes_when_the_name_differs() {
        let h1 = hash_task("a/build", "make", [], [], [], []);
        let h2 = hash_task("b/build", "make", [], [], [], []);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_task_changes_when_nix_deps_differ() {
        let h1 = hash_task("build", "make", [], [], [], ["pkg-a".to_string()]);
        let h2 = hash_task("build", "make", [], [], [], ["pkg-b".to_string()]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_target_walks_a_directory_recursively() {
        use std::fs;

        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out/nested")).unwrap();
        fs::write(dir.path().join("out/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("out/nested/b.txt"), b"b").unwrap();

        let hashes = hash_target(
            dir.path(),
            &Target::Path { paths: vec![std::path::PathBuf::from("out")] },
        )
        .unwrap();

        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains_key(&Path::new("out/a.txt").to_string_lossy().into_owned()));
    }

    #[test]
    fn hash_target_of_a_docker_target_is_empty() {
        let hashes = hash_target(Path::new("/nonexistent"), &Target::Docker).unwrap();
        assert!(hashes.is_empty());
    }

    #[test]
    fn str_and_bytes_tags_dont_collide() {
        let mut a = Hasher::new();
        a.update_str("x");

        let mut b = Hasher::new();
        b.update_bytes(b"x");

        assert_ne!(a.finish(), b.finish());
    }
}
