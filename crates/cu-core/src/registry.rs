//! Environment Registry: environments as branches.
//!
//! Every environment `id` owns `refs/heads/container-use/<id>`. The branch
//! head's tree is the environment's state and its commit message carries the
//! [`EnvironmentState`] trailer. Branch moves are compare-and-swap on the
//! expected parent, so two writers can never both advance from the same
//! commit: the loser gets [`CuError::ConcurrentModification`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cu_engine::EngineSession;
use cu_state::{ObjectId, StateError, VcsStore};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn, Instrument};

use crate::domain::{
    compose_commit_message, CuError, EnvironmentConfig, EnvironmentId, EnvironmentState,
    EnvironmentSummary, Result, RunRequest, BRANCH_PREFIX,
};
use crate::handle::Environment;
use crate::obs::{
    emit_build_failed, emit_deleted, emit_environment_created, emit_persist_conflict,
    emit_persisted, environment_span,
};
use crate::snapshot::SnapshotEngine;

/// Attempts at a random id before falling back to numeric suffixes.
const RANDOM_ID_ATTEMPTS: usize = 8;
const MAX_ID_SUFFIX: u32 = 1000;

/// Inputs to [`Registry::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub title: String,
    pub description: String,
    /// Defaults to `HEAD`.
    pub from_ref: Option<String>,
}

/// What [`Registry::persist`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PersistOutcome {
    Committed { commit: ObjectId, tree: ObjectId },
    /// Nothing ran and the tree did not move; no commit was written.
    Unchanged,
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held writer lock for one id. The map slot is dropped with the last holder
/// or waiter, so the map only tracks ids in use.
struct IdLock<'r> {
    locks: &'r LockMap,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Durable bookkeeping of environments in one repository.
pub struct Registry {
    store: Arc<dyn VcsStore>,
    snapshots: SnapshotEngine,
    locks: LockMap,
}

impl Registry {
    pub fn new(store: Arc<dyn VcsStore>) -> Self {
        Self {
            snapshots: SnapshotEngine::new(Arc::clone(&store)),
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn VcsStore> {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    /// Serialize writers of one id within this process.
    async fn lock(&self, id: &EnvironmentId) -> IdLock<'_> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                locks
                    .entry(id.as_str().to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        IdLock {
            locks: &self.locks,
            key: id.as_str().to_string(),
            guard: Some(slot.lock_owned().await),
        }
    }

    /// Whether `id` has ever been used in this repository.
    async fn is_taken(&self, id: &EnvironmentId) -> Result<bool> {
        Ok(self.store.read_ref(&id.branch_ref()).await?.is_some()
            || self.store.read_ref(&id.retired_ref()).await?.is_some())
    }

    async fn allocate_id(&self) -> Result<EnvironmentId> {
        let mut candidate = EnvironmentId::generate();
        for _ in 0..RANDOM_ID_ATTEMPTS {
            if !self.is_taken(&candidate).await? {
                return Ok(candidate);
            }
            candidate = EnvironmentId::generate();
        }
        for n in 2..MAX_ID_SUFFIX {
            let suffixed = candidate.with_suffix(n);
            if !self.is_taken(&suffixed).await? {
                return Ok(suffixed);
            }
        }
        Err(CuError::InvalidEnvironmentId(format!(
            "no free id near {candidate}"
        )))
    }

    /// Create a new environment from `request.from_ref`.
    ///
    /// The base tree is copied into a fresh container, the configured setup
    /// and install commands run in order, and the resulting tree becomes the
    /// first commit on a new branch. If any build command exits nonzero the
    /// branch is never created.
    pub async fn create(
        &self,
        session: &dyn EngineSession,
        request: CreateRequest,
    ) -> Result<Environment> {
        let from_ref = request.from_ref.as_deref().unwrap_or("HEAD");
        let base = self.store.resolve(from_ref).await?;
        let config = EnvironmentConfig::load(self.store.as_ref(), &base.tree).await?;
        let id = self.allocate_id().await?;

        let span = environment_span(id.as_str());
        self.build(session, id, base.id, base.tree, config, request)
            .instrument(span)
            .await
    }

    async fn build(
        &self,
        session: &dyn EngineSession,
        id: EnvironmentId,
        base_commit: ObjectId,
        base_tree: ObjectId,
        config: EnvironmentConfig,
        request: CreateRequest,
    ) -> Result<Environment> {
        let _guard = self.lock(&id).await;
        debug!(base = %base_commit.short(), image = %config.base_image, "building environment");

        let container = self
            .snapshots
            .materialize(session, &base_tree, &config)
            .await?;
        for command in config.build_commands() {
            let result = self
                .snapshots
                .execute(&container, &config, &RunRequest::new(command))
                .await?;
            if !result.success() {
                emit_build_failed(id.as_str(), command, result.exit_code);
                return Err(CuError::EnvironmentBuild {
                    command: command.to_string(),
                    exit_code: result.exit_code,
                    stderr: result.stderr,
                });
            }
        }
        let tree = self
            .snapshots
            .export_tree(&container, &config, &base_tree)
            .await?;
        self.snapshots.finish(container).await;

        let build_commands = config.build_commands().count();
        let title = if request.title.trim().is_empty() {
            id.to_string()
        } else {
            request.title
        };
        let state = EnvironmentState::new(&title, &request.description, config);
        let body = state
            .config
            .build_commands()
            .map(|c| format!("- `{c}`"))
            .collect::<Vec<_>>()
            .join("\n");
        let message = compose_commit_message(&format!("Create environment {id}"), &body, &state)?;

        let commit = self.store.commit(Some(&base_commit), &tree, &message).await?;
        let branch = id.branch_ref();
        self.store
            .update_ref(&branch, &commit, None)
            .await
            .map_err(|err| conflict(&id, None, err))?;

        emit_environment_created(id.as_str(), &branch, base_commit.as_str(), build_commands);
        Ok(Environment::loaded(id, commit, tree, state))
    }

    /// Load the latest state of `id`.
    pub async fn get(&self, id: &str) -> Result<Environment> {
        let id = existing_id(id)?;
        let branch = id.branch_ref();
        let head = self
            .store
            .read_ref(&branch)
            .await?
            .ok_or_else(|| CuError::EnvironmentNotFound(id.to_string()))?;
        let commit = self.store.resolve(head.as_str()).await?;
        let state = EnvironmentState::from_commit_message(&commit.message).map_err(|reason| {
            CuError::CorruptState {
                reference: branch.clone(),
                reason,
            }
        })?;
        debug!(env_id = %id, head = %head.short(), "loaded environment");
        Ok(Environment::loaded(id, commit.id, commit.tree, state))
    }

    /// Commit the handle's current tree onto its branch.
    ///
    /// The commit's parent is the handle's `head_commit`, and the branch only
    /// moves if it still points there. When nothing ran and the tree has not
    /// moved this is a no-op returning [`PersistOutcome::Unchanged`].
    pub async fn persist(&self, env: &mut Environment, note: Option<&str>) -> Result<PersistOutcome> {
        let span = environment_span(env.id().as_str());
        self.persist_locked(env, note).instrument(span).await
    }

    async fn persist_locked(
        &self,
        env: &mut Environment,
        note: Option<&str>,
    ) -> Result<PersistOutcome> {
        if !env.has_unpersisted_changes() {
            debug!("nothing to persist");
            return Ok(PersistOutcome::Unchanged);
        }

        let _guard = self.lock(env.id()).await;
        let state = env.state().touched();
        let (subject, body) = env.commit_summary(note);
        let message = compose_commit_message(&subject, &body, &state)?;

        let parent = env.head_commit().clone();
        let tree = env.head_tree().clone();
        let commit = self.store.commit(Some(&parent), &tree, &message).await?;

        if let Err(err) = self
            .store
            .update_ref(env.branch_ref(), &commit, Some(&parent))
            .await
        {
            let err = conflict(env.id(), Some(&parent), err);
            if let CuError::ConcurrentModification {
                expected, actual, ..
            } = &err
            {
                emit_persist_conflict(env.id().as_str(), expected, actual);
            }
            return Err(err);
        }

        let runs = env.pending_runs().len();
        env.mark_persisted(commit.clone(), state);
        emit_persisted(env.id().as_str(), commit.as_str(), tree.as_str(), runs);
        Ok(PersistOutcome::Committed { commit, tree })
    }

    /// Whether the host working tree has uncommitted changes.
    pub async fn is_dirty(&self) -> Result<(bool, String)> {
        let status = self.store.working_tree_status().await?;
        Ok((status.dirty, status.status_text))
    }

    /// Every live environment, sorted by id. Branches whose state cannot be
    /// read are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<EnvironmentSummary>> {
        let mut summaries = Vec::new();
        for (refname, head) in self.store.list_refs(BRANCH_PREFIX).await? {
            let Some(raw_id) = refname.strip_prefix(BRANCH_PREFIX) else {
                continue;
            };
            let Ok(id) = EnvironmentId::parse(raw_id) else {
                warn!(branch = %refname, "skipping branch with invalid environment id");
                continue;
            };
            let commit = self.store.resolve(head.as_str()).await?;
            match EnvironmentState::from_commit_message(&commit.message) {
                Ok(state) => summaries.push(EnvironmentSummary {
                    id,
                    title: state.title,
                    head_commit: head,
                    updated_at: state.updated_at,
                }),
                Err(reason) => warn!(branch = %refname, reason = %reason, "skipping unreadable environment"),
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Remove the environment's branch and retire its id for good.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = existing_id(id)?;
        let _guard = self.lock(&id).await;

        let branch = id.branch_ref();
        let head = self
            .store
            .read_ref(&branch)
            .await?
            .ok_or_else(|| CuError::EnvironmentNotFound(id.to_string()))?;

        match self.store.update_ref(&id.retired_ref(), &head, None).await {
            Ok(()) | Err(StateError::RefConflict { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.store
            .delete_ref(&branch, &head)
            .await
            .map_err(|err| conflict(&id, Some(&head), err))?;

        emit_deleted(id.as_str(), head.as_str());
        Ok(())
    }
}

/// Parse an id naming an environment that should already exist. A malformed
/// id can never have been allocated, so it is reported as not found.
fn existing_id(raw: &str) -> Result<EnvironmentId> {
    EnvironmentId::parse(raw).map_err(|_| CuError::EnvironmentNotFound(raw.to_string()))
}

/// Translate a lost ref compare-and-swap into the domain error.
fn conflict(id: &EnvironmentId, expected: Option<&ObjectId>, err: StateError) -> CuError {
    match err {
        StateError::RefConflict { actual, .. } => CuError::ConcurrentModification {
            id: id.to_string(),
            expected: expected
                .map(|e| e.to_string())
                .unwrap_or_else(|| "(absent)".to_string()),
            actual,
        },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cu_state::fakes::MemoryVcs;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryVcs::with_files(&[("README.md", "hi\n")])))
    }

    fn slots(registry: &Registry) -> usize {
        registry.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_lock_slots_are_pruned_on_release() {
        let registry = registry();
        let a = EnvironmentId::parse("brave-otter").unwrap();
        let b = EnvironmentId::parse("calm-heron").unwrap();

        let held = registry.lock(&a).await;
        assert_eq!(slots(&registry), 1);
        {
            let _other = registry.lock(&b).await;
            assert_eq!(slots(&registry), 2);
        }
        assert_eq!(slots(&registry), 1);
        drop(held);
        assert_eq!(slots(&registry), 0);

        for _ in 0..10 {
            let _again = registry.lock(&a).await;
        }
        assert_eq!(slots(&registry), 0);
    }

    #[tokio::test]
    async fn test_waiting_writer_keeps_slot_alive() {
        let registry = registry();
        let id = EnvironmentId::parse("brave-otter").unwrap();

        let first = registry.lock(&id).await;
        let second = async {
            let _guard = registry.lock(&id).await;
            slots(&registry)
        };
        let release = async move {
            tokio::task::yield_now().await;
            drop(first);
        };
        let (seen, ()) = tokio::join!(second, release);
        assert_eq!(seen, 1);
        assert_eq!(slots(&registry), 0);
    }
}
