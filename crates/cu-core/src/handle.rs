//! Environment Handle: the per-invocation view of one environment.
//!
//! A handle is loaded from the registry, runs commands against its current
//! tree, and is handed back to the registry to persist. It never writes
//! history on its own.

use cu_engine::EngineSession;
use cu_state::ObjectId;
use serde::Serialize;
use tracing::Instrument;

use crate::domain::{EnvironmentConfig, EnvironmentId, EnvironmentState, ExecutionResult, Result, RunRequest};
use crate::obs::{emit_run_finished, environment_span};
use crate::snapshot::SnapshotEngine;

/// Lifecycle of a handle.
///
/// `Loaded -> Running -> Executed -> {Persisted | Discarded}`. A handle left
/// in `Running` had its run cancelled or fail before export; its `head_tree`
/// was not advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlePhase {
    Loaded,
    Running,
    Executed,
    Persisted,
    Discarded,
}

/// One environment as seen by the current process.
#[derive(Debug, Clone)]
pub struct Environment {
    id: EnvironmentId,
    branch_ref: String,
    head_commit: ObjectId,
    persisted_tree: ObjectId,
    head_tree: ObjectId,
    state: EnvironmentState,
    phase: HandlePhase,
    pending: Vec<ExecutionResult>,
}

impl Environment {
    pub(crate) fn loaded(
        id: EnvironmentId,
        head_commit: ObjectId,
        head_tree: ObjectId,
        state: EnvironmentState,
    ) -> Self {
        Self {
            branch_ref: id.branch_ref(),
            id,
            head_commit,
            persisted_tree: head_tree.clone(),
            head_tree,
            state,
            phase: HandlePhase::Loaded,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    pub fn branch_ref(&self) -> &str {
        &self.branch_ref
    }

    /// Last commit known to be on the branch.
    pub fn head_commit(&self) -> &ObjectId {
        &self.head_commit
    }

    /// Current tree, including unpersisted runs.
    pub fn head_tree(&self) -> &ObjectId {
        &self.head_tree
    }

    /// Tree of `head_commit`.
    pub fn persisted_tree(&self) -> &ObjectId {
        &self.persisted_tree
    }

    pub fn state(&self) -> &EnvironmentState {
        &self.state
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.state.config
    }

    pub fn title(&self) -> &str {
        &self.state.title
    }

    pub fn description(&self) -> &str {
        &self.state.description
    }

    pub fn phase(&self) -> HandlePhase {
        self.phase
    }

    /// Runs executed since the last persist, oldest first.
    pub fn pending_runs(&self) -> &[ExecutionResult] {
        &self.pending
    }

    pub fn has_unpersisted_changes(&self) -> bool {
        self.head_tree != self.persisted_tree || !self.pending.is_empty()
    }

    /// Run one command against the current tree.
    ///
    /// The container is built from `head_tree`, the command executes, and the
    /// resulting workdir becomes the new `head_tree` whatever the exit code.
    /// An engine failure, timeout, or cancellation leaves `head_tree` as it
    /// was and tears the container down.
    pub async fn run(
        &mut self,
        snapshots: &SnapshotEngine,
        session: &dyn EngineSession,
        request: &RunRequest,
    ) -> Result<ExecutionResult> {
        let span = environment_span(self.id.as_str());
        self.run_in_container(snapshots, session, request)
            .instrument(span)
            .await
    }

    async fn run_in_container(
        &mut self,
        snapshots: &SnapshotEngine,
        session: &dyn EngineSession,
        request: &RunRequest,
    ) -> Result<ExecutionResult> {
        self.phase = HandlePhase::Running;

        let container = snapshots
            .materialize(session, &self.head_tree, &self.state.config)
            .await?;
        let result = snapshots
            .execute(&container, &self.state.config, request)
            .await?;
        let tree = snapshots
            .export_tree(&container, &self.state.config, &self.head_tree)
            .await?;
        snapshots.finish(container).await;

        emit_run_finished(
            self.id.as_str(),
            result.exit_code,
            result.duration.as_millis() as u64,
            tree.short(),
        );
        self.head_tree = tree;
        self.pending.push(result.clone());
        self.phase = HandlePhase::Executed;
        Ok(result)
    }

    /// Drop unpersisted runs and return to the last persisted tree.
    pub fn discard(&mut self) {
        self.head_tree = self.persisted_tree.clone();
        self.pending.clear();
        self.phase = HandlePhase::Discarded;
    }

    /// Subject and body for the next commit.
    ///
    /// The subject is `note` when given, otherwise a summary of the last
    /// run. The body lists every pending run in order.
    pub fn commit_summary(&self, note: Option<&str>) -> (String, String) {
        let subject = match note.map(str::trim).filter(|n| !n.is_empty()) {
            Some(note) => note.to_string(),
            None => match self.pending.last() {
                Some(last) => format!("Run {}", last.summary()),
                None => format!("Update environment {}", self.id),
            },
        };
        let body = self
            .pending
            .iter()
            .map(|run| format!("- {}", run.summary()))
            .collect::<Vec<_>>()
            .join("\n");
        (subject, body)
    }

    pub(crate) fn mark_persisted(&mut self, commit: ObjectId, state: EnvironmentState) {
        self.head_commit = commit;
        self.persisted_tree = self.head_tree.clone();
        self.state = state;
        self.pending.clear();
        self.phase = HandlePhase::Persisted;
    }
}
