//! Filesystem-backed artifact storage.

pub mod artifacts;

pub use artifacts::{ArtifactStore, StorageError};
