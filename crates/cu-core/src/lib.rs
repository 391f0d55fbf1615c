//! container-use core library
//!
//! Environment lifecycle and git-backed snapshots: environments are built
//! from committed history, commands run in throwaway containers, and every
//! resulting filesystem state is folded back into a commit on the
//! environment's own branch.
//!
//! ## Layer 1 - Domain
//!
//! - `Registry`: create / get / persist / list / delete environments as branches
//! - `Environment`: per-invocation handle that runs commands
//! - `SnapshotEngine`: tree -> container -> tree bridge

pub mod domain;
pub mod handle;
pub mod obs;
pub mod registry;
pub mod snapshot;
pub mod telemetry;

pub use domain::{
    CuError, EnvironmentConfig, EnvironmentId, EnvironmentState, EnvironmentSummary,
    ExecutionResult, Result, RunRequest, CONFIG_PATH, DEFAULT_SHELL,
};
pub use handle::{Environment, HandlePhase};
pub use registry::{CreateRequest, PersistOutcome, Registry};
pub use snapshot::{fold_snapshot, LiveContainer, SnapshotEngine};

pub use obs::{
    emit_build_failed, emit_deleted, emit_environment_created, emit_persist_conflict,
    emit_persisted, emit_run_finished, environment_span,
};
pub use telemetry::init_tracing;

/// container-use version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
