//! Domain models for container-use.
//!
//! - `EnvironmentConfig`: declarative build recipe read from the repository
//! - `EnvironmentId` / `EnvironmentState`: identity and commit-borne metadata
//! - `ExecutionResult` / `RunRequest`: one command execution
//! - `CuError`: the error taxonomy surfaced to callers

pub mod config;
pub mod environment;
pub mod error;

pub use config::{EnvironmentConfig, CONFIG_PATH, DEFAULT_BASE_IMAGE, DEFAULT_WORKDIR};
pub use environment::{
    compose_commit_message, EnvironmentId, EnvironmentState, EnvironmentSummary, ExecutionResult,
    RunRequest, BRANCH_PREFIX, DEFAULT_SHELL, RETIRED_PREFIX, STATE_TRAILER,
};
pub use error::{CuError, Result};
