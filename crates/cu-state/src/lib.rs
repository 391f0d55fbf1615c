//! cu-state: git-backed persistence for container-use
//!
//! This crate is the version-control accessor. Environments live entirely in
//! the host repository: their filesystem states are ordinary git trees and
//! their histories are ordinary branches.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: content addressing, append-only history, atomic ref updates.
//!
//! ## Key Components
//!
//! - `VcsStore`: resolve refs, list/read/write trees, commit, compare-and-swap refs
//! - `GitRepository`: `VcsStore` over the `git` CLI
//! - `FsSnapshot`: path-keyed file contents plus the tar codec shared with the container engine
//! - `fakes::MemoryVcs`: in-memory `VcsStore` for tests

mod error;
pub mod fakes;
pub mod fs;
pub mod git;
pub mod object;
pub mod store;
pub mod tree;

pub use error::StateError;
pub use fs::{FsEntry, FsSnapshot};
pub use git::GitRepository;
pub use object::ObjectId;
pub use store::VcsStore;
pub use tree::{
    CommitIdentity, CommitInfo, EntryMode, PendingBlob, TreeEntry, TreeWrite, WorkingTreeStatus,
};

/// Result type for cu-state operations
pub type Result<T> = std::result::Result<T, StateError>;
