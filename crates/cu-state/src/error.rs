//! Error types for cu-state

use thiserror::Error;

/// Errors that can occur in the version-control persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// A reference (branch, tag, sha, `HEAD`) did not resolve to a commit
    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    /// A compare-and-swap ref update lost against another writer
    #[error("Ref {refname} moved: expected {expected}, found {actual}")]
    RefConflict {
        refname: String,
        expected: String,
        actual: String,
    },

    /// Object id is not 40 lowercase hex characters
    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    /// Object missing from the store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// The store computed a different id than the one planned locally
    #[error("Object id mismatch: planned {planned}, stored {stored}")]
    ObjectIdMismatch { planned: String, stored: String },

    /// Path is not representable inside a tree
    #[error("Invalid tree path: {0}")]
    InvalidPath(String),

    /// Git command execution failed
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// Not inside a git work tree
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    /// Tar stream could not be read or written
    #[error("Archive error: {0}")]
    Archive(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
