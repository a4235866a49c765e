//! Content-addressed storage: the build-info log and the artifact archive.

pub mod artifact;
pub mod buildinfo;

pub use artifact::{ArtifactStore, ArtifactStoreError};
pub use buildinfo::{BuildInfo, BuildInfoStore, BuildInfoStoreError};
