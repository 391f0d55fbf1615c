//! Engine-agnostic container client interface.
//!
//! A [`ContainerEngine`] hands out one [`EngineSession`] per top-level
//! operation. Sessions own every container they create and release them on
//! all exit paths: explicitly through [`EngineSession::remove`], or
//! best-effort through [`EngineSession::discard`] when a caller is unwinding
//! or was cancelled.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use cu_state::FsSnapshot;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Engine-assigned container id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to build a container from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// One command execution inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Prepend the image's configured entrypoint to `argv`.
    pub use_entrypoint: bool,
    pub workdir: String,
    pub timeout: Option<Duration>,
}

/// Captured result of an exec. A nonzero `exit_code` is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Factory for per-operation sessions.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for diagnostics (`docker`, `podman`, `memory`).
    fn name(&self) -> &str;

    /// Open a session. Fails with `EngineError::DaemonUnreachable` when the
    /// engine is installed but not answering.
    async fn connect(&self) -> Result<Box<dyn EngineSession>>;
}

/// A live connection to the engine, scoped to one top-level operation.
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Pull `spec.image` if needed and start an idle container with
    /// `spec.workdir` created and `spec.env` applied.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Unpack `snapshot` into `dest` inside the container.
    async fn copy_in(&self, container: &ContainerId, dest: &str, snapshot: &FsSnapshot)
        -> Result<()>;

    /// Run a command and capture its output and exit status.
    async fn exec(&self, container: &ContainerId, request: &ExecRequest) -> Result<ExecOutput>;

    /// Read everything under `path` back out of the container.
    async fn export(&self, container: &ContainerId, path: &str) -> Result<FsSnapshot>;

    /// Stop and delete a container.
    async fn remove(&self, container: &ContainerId) -> Result<()>;

    /// Fire-and-forget removal usable from `Drop`.
    fn discard(&self, container: &ContainerId);
}
