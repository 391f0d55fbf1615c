//! Error taxonomy for environment operations.

use cu_engine::EngineError;
use cu_state::StateError;

/// container-use domain errors.
///
/// Every kind is a distinct variant so callers can pick an actionable
/// message. A command's nonzero exit status is never an error; it is carried
/// in [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, thiserror::Error)]
pub enum CuError {
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("environment build failed: `{command}` exited with status {exit_code}")]
    EnvironmentBuild {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("execution engine error: {0}")]
    ExecutionEngine(#[source] EngineError),

    #[error("environment {id} was modified concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("container engine unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("invalid environment id: {0:?}")]
    InvalidEnvironmentId(String),

    #[error("invalid environment config: {0}")]
    InvalidConfig(String),

    #[error("corrupt environment state at {reference}: {reason}")]
    CorruptState { reference: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[source] StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CuError {
    /// A short hint telling the user what to do next.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            CuError::ReferenceNotFound(_) => Some(
                "check the reference with `git rev-parse`; environments are built from committed history only",
            ),
            CuError::EnvironmentNotFound(_) => {
                Some("run `container-use list` to see the available environments")
            }
            CuError::EnvironmentBuild { .. } => Some(
                "fix the failing setup or install command in .container-use/environment.json, commit it, and retry",
            ),
            CuError::ExecutionEngine(_) => {
                Some("check that the base image exists and that the container engine is healthy")
            }
            CuError::ConcurrentModification { .. } => {
                Some("another command advanced this environment first; re-run yours on top of it")
            }
            CuError::DaemonUnreachable(_) => Some(
                "start the container engine (e.g. open Docker Desktop or run `systemctl start docker`), or point CONTAINER_USE_ENGINE at a running one",
            ),
            CuError::InvalidEnvironmentId(_) => {
                Some("environment ids use lowercase letters, digits and dashes")
            }
            CuError::InvalidConfig(_) => Some("fix .container-use/environment.json and commit it"),
            CuError::CorruptState { .. } => Some(
                "the environment branch was rewritten outside container-use; delete it and create a new environment",
            ),
            CuError::Storage(_) | CuError::Serialization(_) => None,
        }
    }
}

impl From<StateError> for CuError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ReferenceNotFound(reference) => CuError::ReferenceNotFound(reference),
            other => CuError::Storage(other),
        }
    }
}

impl From<EngineError> for CuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DaemonUnreachable { engine, detail } => {
                CuError::DaemonUnreachable(format!("{engine}: {detail}"))
            }
            EngineError::BinaryNotFound(engine) => {
                CuError::DaemonUnreachable(format!("`{engine}` is not installed or not in PATH"))
            }
            other => CuError::ExecutionEngine(other),
        }
    }
}

/// Result type for container-use domain operations.
pub type Result<T> = std::result::Result<T, CuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_errors_map_to_domain_kinds() {
        let err: CuError = StateError::ReferenceNotFound("no-such-ref".into()).into();
        assert!(matches!(err, CuError::ReferenceNotFound(ref r) if r == "no-such-ref"));

        let err: CuError = StateError::InvalidPath("../x".into()).into();
        assert!(matches!(err, CuError::Storage(_)));
    }

    #[test]
    fn test_engine_errors_map_to_domain_kinds() {
        let err: CuError = EngineError::DaemonUnreachable {
            engine: "docker".into(),
            detail: "connection refused".into(),
        }
        .into();
        assert!(matches!(err, CuError::DaemonUnreachable(_)));
        assert!(err.remediation().unwrap().contains("start the container engine"));

        let err: CuError = EngineError::Timeout { limit_ms: 10 }.into();
        assert!(matches!(err, CuError::ExecutionEngine(EngineError::Timeout { .. })));
    }

    #[test]
    fn test_every_user_facing_kind_has_a_hint() {
        let errors = [
            CuError::ReferenceNotFound("x".into()),
            CuError::EnvironmentNotFound("x".into()),
            CuError::EnvironmentBuild {
                command: "false".into(),
                exit_code: 1,
                stderr: String::new(),
            },
            CuError::ConcurrentModification {
                id: "x".into(),
                expected: "a".into(),
                actual: "b".into(),
            },
            CuError::DaemonUnreachable("docker".into()),
        ];
        for err in &errors {
            assert!(err.remediation().is_some(), "{err} has no hint");
        }
    }
}
