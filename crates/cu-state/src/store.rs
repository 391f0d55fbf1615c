//! Storage trait for the version-control accessor
//!
//! `VcsStore` is the only way the rest of the workspace touches history:
//! resolving references, listing and writing trees, creating commits, and
//! moving refs with compare-and-swap semantics.
//!
//! A git CLI backend lives in [`crate::git`]; an in-memory fake for tests
//! lives in [`crate::fakes`].

use async_trait::async_trait;

use crate::fs::FsSnapshot;
use crate::object::ObjectId;
use crate::tree::{CommitInfo, TreeEntry, TreeWrite, WorkingTreeStatus};
use crate::Result;

/// Version-control accessor.
///
/// Guarantees:
/// - `resolve` fails with `StateError::ReferenceNotFound` for refs that do
///   not name a commit.
/// - `write_tree` is content-addressed: equal entry lists yield equal ids.
/// - `update_ref` is atomic. It only moves `refname` when its current value
///   equals `expected` (`None` meaning "absent"), otherwise it fails with
///   `StateError::RefConflict` and leaves the ref untouched.
/// - Nothing here rewrites or deletes objects; history is append-only.
#[async_trait]
pub trait VcsStore: Send + Sync {
    /// Resolve a branch, tag, sha, or `HEAD` to a commit.
    async fn resolve(&self, reference: &str) -> Result<CommitInfo>;

    /// The commit the host work tree currently has checked out.
    async fn current_head(&self) -> Result<CommitInfo> {
        self.resolve("HEAD").await
    }

    /// Uncommitted changes in the host work tree.
    async fn working_tree_status(&self) -> Result<WorkingTreeStatus>;

    /// Recursive leaf listing of a tree, sorted by path.
    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>>;

    /// Full contents of a tree as a filesystem snapshot.
    async fn read_tree(&self, tree: &ObjectId) -> Result<FsSnapshot>;

    /// Contents of one regular file in a tree, `None` if absent.
    async fn read_file(&self, tree: &ObjectId, path: &str) -> Result<Option<Vec<u8>>>;

    /// Store pending blobs, then the tree described by `write.entries`.
    async fn write_tree(&self, write: &TreeWrite) -> Result<ObjectId>;

    /// Create a commit object. Does not move any ref.
    async fn commit(&self, parent: Option<&ObjectId>, tree: &ObjectId, message: &str)
        -> Result<ObjectId>;

    /// Current target of a fully qualified ref, `None` if it does not exist.
    async fn read_ref(&self, refname: &str) -> Result<Option<ObjectId>>;

    /// Compare-and-swap a ref from `expected` to `new`.
    async fn update_ref(
        &self,
        refname: &str,
        new: &ObjectId,
        expected: Option<&ObjectId>,
    ) -> Result<()>;

    /// Compare-and-delete a ref.
    async fn delete_ref(&self, refname: &str, expected: &ObjectId) -> Result<()>;

    /// All refs under `prefix` with their targets, sorted by name.
    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>>;
}
