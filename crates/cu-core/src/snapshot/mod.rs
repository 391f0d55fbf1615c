//! Environment Snapshot Engine.
//!
//! Bridges a git tree and a live container in both directions:
//! [`SnapshotEngine::materialize`] copies a tree into a fresh container,
//! [`SnapshotEngine::execute`] runs one command, and
//! [`SnapshotEngine::export_tree`] folds the container's workdir back into a
//! tree object. Creation and command execution share this one path.

pub mod fold;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cu_engine::{ContainerId, ContainerSpec, EngineSession, ExecRequest};
use cu_state::{ObjectId, VcsStore};
use tracing::{debug, warn};

use crate::domain::{EnvironmentConfig, ExecutionResult, Result, RunRequest};

pub use fold::fold_snapshot;

/// Container label holding the config digest.
pub const LABEL_CONFIG: &str = "dev.container-use.config";
/// Container label holding the source tree id.
pub const LABEL_TREE: &str = "dev.container-use.tree";

/// A container owned by one top-level operation.
///
/// Dropping it without calling [`LiveContainer::release`] schedules a
/// forced removal, so cancelled or failed operations never leak containers.
pub struct LiveContainer<'s> {
    session: &'s dyn EngineSession,
    id: ContainerId,
    released: bool,
}

impl<'s> LiveContainer<'s> {
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Stop and remove the container.
    pub async fn release(mut self) -> Result<()> {
        self.session.remove(&self.id).await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for LiveContainer<'_> {
    fn drop(&mut self) {
        if !self.released {
            debug!(container = %self.id, "discarding container");
            self.session.discard(&self.id);
        }
    }
}

/// Converts between trees and containers.
#[derive(Clone)]
pub struct SnapshotEngine {
    store: Arc<dyn VcsStore>,
}

impl SnapshotEngine {
    pub fn new(store: Arc<dyn VcsStore>) -> Self {
        Self { store }
    }

    /// Start a container from `config.base_image` with `tree` copied into
    /// `config.workdir` and `config.env` applied.
    pub async fn materialize<'s>(
        &self,
        session: &'s dyn EngineSession,
        tree: &ObjectId,
        config: &EnvironmentConfig,
    ) -> Result<LiveContainer<'s>> {
        let files = self.store.read_tree(tree).await?;

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CONFIG.to_string(), config.digest()?);
        labels.insert(LABEL_TREE.to_string(), tree.to_string());
        let spec = ContainerSpec {
            image: config.base_image.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
            labels,
        };

        let container = LiveContainer {
            session,
            id: session.create(&spec).await?,
            released: false,
        };
        session
            .copy_in(&container.id, &config.workdir, &files)
            .await?;

        debug!(
            container = %container.id,
            image = %config.base_image,
            tree = %tree.short(),
            files = files.len(),
            "materialized container"
        );
        Ok(container)
    }

    /// Run one command. A nonzero exit is returned as data.
    pub async fn execute(
        &self,
        container: &LiveContainer<'_>,
        config: &EnvironmentConfig,
        request: &RunRequest,
    ) -> Result<ExecutionResult> {
        let exec = ExecRequest {
            argv: request.argv()?,
            use_entrypoint: request.use_entrypoint,
            workdir: config.workdir.clone(),
            timeout: request.timeout,
        };

        let started = Instant::now();
        let output = container.session.exec(&container.id, &exec).await?;
        let duration = started.elapsed();

        debug!(
            container = %container.id,
            exit_code = output.exit_code,
            duration_ms = duration.as_millis() as u64,
            "command finished"
        );
        Ok(ExecutionResult {
            command: request.command.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration,
        })
    }

    /// Snapshot `config.workdir` into a tree, storing only blobs that
    /// `base_tree` does not already reference.
    pub async fn export_tree(
        &self,
        container: &LiveContainer<'_>,
        config: &EnvironmentConfig,
        base_tree: &ObjectId,
    ) -> Result<ObjectId> {
        let fs = container
            .session
            .export(&container.id, &config.workdir)
            .await?;
        let base = self.store.list_tree(base_tree).await?;
        let write = fold_snapshot(&base, &fs);
        let tree = self.store.write_tree(&write).await?;

        debug!(
            container = %container.id,
            tree = %tree.short(),
            entries = write.entries.len(),
            new_blobs = write.new_blobs.len(),
            "exported tree"
        );
        Ok(tree)
    }

    /// Release a container whose work is done. Failures are logged; the
    /// result has already been captured.
    pub async fn finish(&self, container: LiveContainer<'_>) {
        let id = container.id.clone();
        if let Err(err) = container.release().await {
            warn!(container = %id, error = %err, "failed to remove container");
        }
    }
}
