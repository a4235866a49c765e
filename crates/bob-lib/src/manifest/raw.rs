//! The on-disk shape of a `bob.yml` manifest, deserialized with `serde_yaml`
//! before being resolved into [`super::Manifest`].
//!
//! `turborepo-lib`'s `turbo_json::raw` module keeps an identical `Raw*` ->
//! processed split, though it layers span-tracking (`Spanned<T>`) and a
//! `biome_deserialize` derive on top for precise error locations in
//! `turbo.json`. Bob manifests are far simpler, so plain `serde` +
//! `serde_yaml` is enough; we keep the split itself because it's the right
//! shape regardless of scale: `RawManifest` is the untrusted wire format,
//! `Manifest` is the validated, prefix-resolved graph.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::task::{RebuildPolicy, Target};

#[derive(Debug, Deserialize)]
pub struct RawManifest {
    pub version: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Paths to child manifest directories, relative to this manifest's
    /// directory.
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTask>,
}

#[derive(Debug, Deserialize)]
pub struct RawTask {
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_target")]
    pub target: Target,
    #[serde(default = "default_rebuild_policy")]
    pub rebuild_policy: RebuildPolicy,
    #[serde(default)]
    pub nix_deps: Vec<String>,
}

fn default_target() -> Target {
    Target::Path { paths: Vec::new() }
}

fn default_rebuild_policy() -> RebuildPolicy {
    RebuildPolicy::IfChanged
}

pub fn parse(contents: &str) -> Result<RawManifest, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}
