//! Error types for cu-engine

use thiserror::Error;

/// Errors that can occur while talking to the container engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine binary is installed but its daemon/socket did not answer
    #[error("Container engine `{engine}` is not reachable: {detail}")]
    DaemonUnreachable { engine: String, detail: String },

    /// Engine binary not found
    #[error("Container engine `{0}` is not installed or not in PATH")]
    BinaryNotFound(String),

    /// Image could not be pulled or resolved
    #[error("Failed to pull image {image}: {detail}")]
    ImagePull { image: String, detail: String },

    /// Container could not be created or started
    #[error("Failed to start container from {image}: {detail}")]
    ContainerStart { image: String, detail: String },

    /// Container vanished or was never created in this session
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Command exceeded the caller's time limit
    #[error("Command timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// The exec client died without an exit status
    #[error("Command terminated by signal")]
    Terminated,

    /// Engine command execution failed
    #[error("{engine} {command} failed: {stderr}")]
    Command {
        engine: String,
        command: String,
        stderr: String,
    },

    /// Command could not be turned into an argv
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Filesystem snapshot encoding error
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] cu_state::StateError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
