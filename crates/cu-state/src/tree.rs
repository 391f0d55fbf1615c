//! Tree listings, commit records, and write plans.

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::object::ObjectId;

/// File mode of a tree entry, as git records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    /// Submodule commit pointer
    Gitlink,
}

impl EntryMode {
    pub fn as_octal(&self) -> &'static str {
        match self {
            EntryMode::Regular => "100644",
            EntryMode::Executable => "100755",
            EntryMode::Symlink => "120000",
            EntryMode::Gitlink => "160000",
        }
    }
}

impl std::str::FromStr for EntryMode {
    type Err = StateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "100644" | "100664" => Ok(EntryMode::Regular),
            "100755" => Ok(EntryMode::Executable),
            "120000" => Ok(EntryMode::Symlink),
            "160000" => Ok(EntryMode::Gitlink),
            other => Err(StateError::InvalidPath(format!("unsupported mode {other}"))),
        }
    }
}

/// One leaf of a recursively listed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: EntryMode,
    pub id: ObjectId,
}

/// A blob that must be written before the tree referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlob {
    pub id: ObjectId,
    pub data: Vec<u8>,
}

/// Everything needed to store one tree: its full leaf listing (sorted by
/// path) plus the blobs the store does not have yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeWrite {
    pub entries: Vec<TreeEntry>,
    pub new_blobs: Vec<PendingBlob>,
}

/// A resolved commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub message: String,
}

/// Host work-tree cleanliness as reported by `git status --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeStatus {
    pub dirty: bool,
    pub status_text: String,
}

/// Author and committer identity stamped on environment commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "container-use".to_string(),
            email: "noreply@container-use.local".to_string(),
        }
    }
}
