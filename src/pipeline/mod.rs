//! Pipeline stages, configuration, execution and built-in processors.

pub mod config;
pub mod executor;
pub mod processors;
pub mod stage;

pub use config::{RunConfig, ServerConfig};
pub use executor::{ExecutorError, ProcessorSet, StageContext, StageError, StageExecutor, StageProcessor};
pub use processors::{HeuristicScoring, ScoringService};
pub use stage::{Stage, StageParseError};
