//! gradeprobe: assessment-attack pipeline for probing automated graders.
//!
//! This library provides a pausable, resumable pipeline that extracts
//! questions from assessment documents, applies validated substring
//! substitutions and scores the result against an automated grader.

// Core modules
pub mod cli;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod question;
pub mod registry;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export commonly used error types
pub use error::RegistryError;
pub use mapping::MappingError;
pub use pipeline::executor::{ExecutorError, StageError};
pub use storage::StorageError;
pub use sync::SyncError;
