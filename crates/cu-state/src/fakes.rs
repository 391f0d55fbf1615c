//! In-memory fake for `VcsStore` (testing only)
//!
//! `MemoryVcs` keeps blobs, trees, commits, and refs in hash maps. Blob ids
//! are real git blob ids; tree and commit ids are content hashes over a
//! canonical encoding, which is enough for equality and dedup checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StateError;
use crate::fs::{FsEntry, FsSnapshot};
use crate::object::ObjectId;
use crate::store::VcsStore;
use crate::tree::{CommitInfo, EntryMode, PendingBlob, TreeEntry, TreeWrite, WorkingTreeStatus};
use crate::Result;

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<ObjectId, Vec<u8>>,
    trees: HashMap<ObjectId, Vec<TreeEntry>>,
    commits: HashMap<ObjectId, CommitInfo>,
    refs: BTreeMap<String, ObjectId>,
    status: WorkingTreeStatus,
    commit_seq: u64,
}

impl Inner {
    fn store_tree(&mut self, write: &TreeWrite) -> Result<ObjectId> {
        for blob in &write.new_blobs {
            let actual = ObjectId::for_blob(&blob.data);
            if actual != blob.id {
                return Err(StateError::ObjectIdMismatch {
                    planned: blob.id.to_string(),
                    stored: actual.to_string(),
                });
            }
            self.blobs.insert(blob.id.clone(), blob.data.clone());
        }

        let mut entries = write.entries.clone();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut canonical = Vec::new();
        for entry in &entries {
            if entry.mode != EntryMode::Gitlink && !self.blobs.contains_key(&entry.id) {
                return Err(StateError::ObjectNotFound(entry.id.to_string()));
            }
            canonical.extend_from_slice(
                format!("{} {}\0{}\n", entry.mode.as_octal(), entry.path, entry.id).as_bytes(),
            );
        }

        let id = ObjectId::hash_object("tree", &canonical);
        self.trees.insert(id.clone(), entries);
        Ok(id)
    }

    fn store_commit(
        &mut self,
        parent: Option<&ObjectId>,
        tree: &ObjectId,
        message: &str,
    ) -> Result<ObjectId> {
        if !self.trees.contains_key(tree) {
            return Err(StateError::ObjectNotFound(tree.to_string()));
        }
        if let Some(parent) = parent {
            if !self.commits.contains_key(parent) {
                return Err(StateError::ObjectNotFound(parent.to_string()));
            }
        }

        self.commit_seq += 1;
        let parent_line = parent.map(|p| p.to_string()).unwrap_or_default();
        let body = format!(
            "tree {tree}\nparent {parent_line}\nseq {}\n\n{message}",
            self.commit_seq
        );
        let id = ObjectId::hash_object("commit", body.as_bytes());
        self.commits.insert(
            id.clone(),
            CommitInfo {
                id: id.clone(),
                tree: tree.clone(),
                parents: parent.into_iter().cloned().collect(),
                message: message.to_string(),
            },
        );
        Ok(id)
    }

    fn lookup(&self, reference: &str) -> Option<ObjectId> {
        let candidates = [
            reference.to_string(),
            format!("refs/heads/{reference}"),
            format!("refs/tags/{reference}"),
        ];
        for name in &candidates {
            if let Some(id) = self.refs.get(name) {
                return Some(id.clone());
            }
        }
        let id: ObjectId = reference.parse().ok()?;
        self.commits.contains_key(&id).then_some(id)
    }
}

/// In-memory version-control store.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    inner: Mutex<Inner>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `HEAD` (`refs/heads/main`) holds one commit with `files`.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let vcs = Self::new();
        let mut snapshot = FsSnapshot::new();
        for (path, content) in files {
            snapshot
                .insert_file(path, *content)
                .expect("fixture paths are valid");
        }
        vcs.commit_snapshot("refs/heads/main", &snapshot, "initial commit")
            .expect("fixture commit succeeds");
        vcs
    }

    /// Commit `snapshot` on top of `branch` and advance it. `HEAD` follows
    /// `refs/heads/main`.
    pub fn commit_snapshot(
        &self,
        branch: &str,
        snapshot: &FsSnapshot,
        message: &str,
    ) -> Result<ObjectId> {
        let mut inner = self.inner.lock().unwrap();
        let mut write = TreeWrite::default();
        for (path, entry) in snapshot.iter() {
            let (mode, data) = match entry {
                FsEntry::File { data, executable } => (
                    if *executable {
                        EntryMode::Executable
                    } else {
                        EntryMode::Regular
                    },
                    data.clone(),
                ),
                FsEntry::Symlink { target } => (EntryMode::Symlink, target.clone().into_bytes()),
            };
            let id = ObjectId::for_blob(&data);
            write.entries.push(TreeEntry {
                path: path.to_string(),
                mode,
                id: id.clone(),
            });
            write.new_blobs.push(PendingBlob { id, data });
        }
        let tree = inner.store_tree(&write)?;
        let parent = inner.refs.get(branch).cloned();
        let commit = inner.store_commit(parent.as_ref(), &tree, message)?;
        inner.refs.insert(branch.to_string(), commit.clone());
        if branch == "refs/heads/main" {
            inner.refs.insert("HEAD".to_string(), commit.clone());
        }
        Ok(commit)
    }

    pub fn set_working_tree_status(&self, status: WorkingTreeStatus) {
        self.inner.lock().unwrap().status = status;
    }

    /// Names of every ref currently present.
    pub fn ref_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().refs.keys().cloned().collect()
    }

    /// Number of commit objects ever written.
    pub fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits.len()
    }

    /// Number of blob objects stored.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }

    /// Look up a commit without going through ref resolution.
    pub fn commit_info(&self, id: &ObjectId) -> Option<CommitInfo> {
        self.inner.lock().unwrap().commits.get(id).cloned()
    }
}

#[async_trait]
impl VcsStore for MemoryVcs {
    async fn resolve(&self, reference: &str) -> Result<CommitInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .lookup(reference)
            .and_then(|id| inner.commits.get(&id).cloned())
            .ok_or_else(|| StateError::ReferenceNotFound(reference.to_string()))
    }

    async fn working_tree_status(&self) -> Result<WorkingTreeStatus> {
        Ok(self.inner.lock().unwrap().status.clone())
    }

    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>> {
        self.inner
            .lock()
            .unwrap()
            .trees
            .get(tree)
            .cloned()
            .ok_or_else(|| StateError::ObjectNotFound(tree.to_string()))
    }

    async fn read_tree(&self, tree: &ObjectId) -> Result<FsSnapshot> {
        let inner = self.inner.lock().unwrap();
        let entries = inner
            .trees
            .get(tree)
            .ok_or_else(|| StateError::ObjectNotFound(tree.to_string()))?;

        let mut snapshot = FsSnapshot::new();
        for entry in entries {
            if entry.mode == EntryMode::Gitlink {
                continue;
            }
            let data = inner
                .blobs
                .get(&entry.id)
                .cloned()
                .ok_or_else(|| StateError::ObjectNotFound(entry.id.to_string()))?;
            let fs_entry = match entry.mode {
                EntryMode::Symlink => FsEntry::Symlink {
                    target: String::from_utf8_lossy(&data).into_owned(),
                },
                mode => FsEntry::File {
                    data,
                    executable: mode == EntryMode::Executable,
                },
            };
            snapshot.insert(&entry.path, fs_entry)?;
        }
        Ok(snapshot)
    }

    async fn read_file(&self, tree: &ObjectId, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        let entries = inner
            .trees
            .get(tree)
            .ok_or_else(|| StateError::ObjectNotFound(tree.to_string()))?;
        Ok(entries
            .iter()
            .find(|e| {
                e.path == path && matches!(e.mode, EntryMode::Regular | EntryMode::Executable)
            })
            .and_then(|e| inner.blobs.get(&e.id).cloned()))
    }

    async fn write_tree(&self, write: &TreeWrite) -> Result<ObjectId> {
        self.inner.lock().unwrap().store_tree(write)
    }

    async fn commit(
        &self,
        parent: Option<&ObjectId>,
        tree: &ObjectId,
        message: &str,
    ) -> Result<ObjectId> {
        self.inner.lock().unwrap().store_commit(parent, tree, message)
    }

    async fn read_ref(&self, refname: &str) -> Result<Option<ObjectId>> {
        Ok(self.inner.lock().unwrap().refs.get(refname).cloned())
    }

    async fn update_ref(
        &self,
        refname: &str,
        new: &ObjectId,
        expected: Option<&ObjectId>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let actual = inner.refs.get(refname);
        if actual != expected {
            return Err(StateError::RefConflict {
                refname: refname.to_string(),
                expected: expected.map(|id| id.to_string()).unwrap_or_else(|| "(absent)".into()),
                actual: actual.map(|id| id.to_string()).unwrap_or_else(|| "(absent)".into()),
            });
        }
        inner.refs.insert(refname.to_string(), new.clone());
        Ok(())
    }

    async fn delete_ref(&self, refname: &str, expected: &ObjectId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let actual = inner.refs.get(refname).cloned();
        if actual.as_ref() != Some(expected) {
            return Err(StateError::RefConflict {
                refname: refname.to_string(),
                expected: expected.to_string(),
                actual: actual.map(|id| id.to_string()).unwrap_or_else(|| "(absent)".into()),
            });
        }
        inner.refs.remove(refname);
        Ok(())
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect())
    }
}
