//! Structured observability hooks for environment lifecycle events.
//!
//! This module provides:
//! - Environment-scoped tracing spans via [`environment_span`]
//! - Emission functions for create, run, persist, conflict and delete
//!
//! Events are emitted at `info!` level (`warn!` for conflicts and build
//! failures) and filtered through `RUST_LOG`.

use tracing::{info, warn, Span};

/// Span tagging everything inside it with `env_id`.
///
/// Attach it to futures with `tracing::Instrument`:
///
/// ```ignore
/// registry.persist(&mut env, None).instrument(environment_span("brave-otter")).await
/// ```
pub fn environment_span(env_id: &str) -> Span {
    tracing::info_span!("container_use.environment", env_id = %env_id)
}

/// Emit event: environment branch created.
pub fn emit_environment_created(env_id: &str, branch: &str, base_commit: &str, build_commands: usize) {
    info!(
        event = "environment.created",
        env_id = %env_id,
        branch = %branch,
        base_commit = %base_commit,
        build_commands = build_commands,
    );
}

/// Emit event: a setup or install command failed during create.
pub fn emit_build_failed(env_id: &str, command: &str, exit_code: i32) {
    warn!(
        event = "environment.build_failed",
        env_id = %env_id,
        command = %command,
        exit_code = exit_code,
    );
}

/// Emit event: one command ran to completion inside the environment.
pub fn emit_run_finished(env_id: &str, exit_code: i32, duration_ms: u64, tree: &str) {
    info!(
        event = "environment.run_finished",
        env_id = %env_id,
        exit_code = exit_code,
        duration_ms = duration_ms,
        tree = %tree,
    );
}

/// Emit event: a new commit landed on the environment branch.
pub fn emit_persisted(env_id: &str, commit: &str, tree: &str, runs: usize) {
    info!(
        event = "environment.persisted",
        env_id = %env_id,
        commit = %commit,
        tree = %tree,
        runs = runs,
    );
}

/// Emit event: persist lost the compare-and-swap on the branch (warn level).
pub fn emit_persist_conflict(env_id: &str, expected: &str, actual: &str) {
    warn!(
        event = "environment.persist_conflict",
        env_id = %env_id,
        expected = %expected,
        actual = %actual,
    );
}

/// Emit event: environment branch removed and its id retired.
pub fn emit_deleted(env_id: &str, last_commit: &str) {
    info!(event = "environment.deleted", env_id = %env_id, last_commit = %last_commit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_environment_span_create() {
        let span = environment_span("test-env");
        let _entered = span.enter();
    }

    #[traced_test]
    #[test]
    fn test_persisted_event_carries_commit() {
        emit_persisted("brave-otter", "abc1234", "def5678", 2);
        assert!(logs_contain("environment.persisted"));
        assert!(logs_contain("abc1234"));
        assert!(logs_contain("runs=2"));
    }

    #[traced_test]
    #[test]
    fn test_conflict_is_a_warning() {
        emit_persist_conflict("brave-otter", "aaaa", "bbbb");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("expected=aaaa"));
    }

    #[traced_test]
    #[test]
    fn test_span_fields_reach_events() {
        let span = environment_span("calm-heron");
        let _entered = span.enter();
        emit_deleted("calm-heron", "0123abc");
        assert!(logs_contain("env_id=calm-heron"));
    }
}
