//! Git CLI backend for [`VcsStore`].
//!
//! Every operation shells out to `git` in the repository root. Trees are
//! built in a throwaway index (`GIT_INDEX_FILE`) so the host's staging area
//! is never touched.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::StateError;
use crate::fs::{FsEntry, FsSnapshot};
use crate::object::ObjectId;
use crate::store::VcsStore;
use crate::tree::{CommitIdentity, CommitInfo, EntryMode, TreeEntry, TreeWrite, WorkingTreeStatus};
use crate::Result;

/// A git repository on the host, driven through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
    identity: CommitIdentity,
}

impl GitRepository {
    /// Open the repository containing `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dir = path.as_ref();
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(StateError::NotARepository(dir.display().to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(root = %root, "opened git repository");
        Ok(Self {
            root: PathBuf::from(root),
            identity: CommitIdentity::default(),
        })
    }

    /// Override the identity stamped on commits.
    pub fn with_identity(mut self, identity: CommitIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn run(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        envs: &[(&str, &str)],
    ) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        // Feed stdin while stdout drains: `cat-file --batch` answers line by line.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (pipe, stdin) {
                pipe.write_all(data).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err.into()),
            _ => Ok(output),
        }
    }

    /// Run git and return stdout, failing on a nonzero exit.
    async fn git(&self, args: &[&str], stdin: Option<&[u8]>, envs: &[(&str, &str)]) -> Result<Vec<u8>> {
        let output = self.run(args, stdin, envs).await?;
        if !output.status.success() {
            return Err(StateError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn conflict_or(
        &self,
        refname: &str,
        expected: Option<&ObjectId>,
        err: StateError,
    ) -> StateError {
        match self.read_ref(refname).await {
            Ok(actual) if actual.as_ref() != expected => StateError::RefConflict {
                refname: refname.to_string(),
                expected: describe(expected),
                actual: describe(actual.as_ref()),
            },
            _ => err,
        }
    }
}

fn describe(id: Option<&ObjectId>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "(absent)".to_string())
}

/// Parse a raw `git cat-file commit` body.
pub(crate) fn parse_commit(id: ObjectId, raw: &[u8]) -> Result<CommitInfo> {
    let text = String::from_utf8_lossy(raw);
    let (headers, message) = text.split_once("\n\n").unwrap_or((text.as_ref(), ""));

    let mut tree = None;
    let mut parents = Vec::new();
    for line in headers.lines() {
        if let Some(rest) = line.strip_prefix("tree ") {
            tree = Some(rest.parse::<ObjectId>()?);
        } else if let Some(rest) = line.strip_prefix("parent ") {
            parents.push(rest.parse::<ObjectId>()?);
        }
    }

    let tree = tree.ok_or_else(|| StateError::ObjectNotFound(format!("tree of {id}")))?;
    Ok(CommitInfo {
        id,
        tree,
        parents,
        message: message.to_string(),
    })
}

/// Parse `git ls-tree -z` output: `<mode> <type> <id>\t<path>\0`.
pub(crate) fn parse_ls_tree(raw: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for record in raw.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        let (meta, path) = record
            .split_once('\t')
            .ok_or_else(|| StateError::InvalidPath(record.to_string()))?;
        let mut fields = meta.split(' ');
        let (Some(mode), Some(_kind), Some(id)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(StateError::InvalidPath(record.to_string()));
        };
        entries.push(TreeEntry {
            path: path.to_string(),
            mode: mode.parse()?,
            id: id.parse()?,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Split `git cat-file --batch` output into object payloads, in request order.
pub(crate) fn parse_cat_file_batch(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut objects = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| StateError::Archive("truncated cat-file header".into()))?;
        let header = String::from_utf8_lossy(&rest[..newline]).to_string();
        if header.ends_with(" missing") {
            return Err(StateError::ObjectNotFound(header));
        }
        let size: usize = header
            .rsplit(' ')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StateError::Archive(format!("bad cat-file header: {header}")))?;
        let start = newline + 1;
        let end = start + size;
        if rest.len() < end + 1 {
            return Err(StateError::Archive("truncated cat-file payload".into()));
        }
        objects.push(rest[start..end].to_vec());
        rest = &rest[end + 1..];
    }
    Ok(objects)
}

#[async_trait]
impl VcsStore for GitRepository {
    async fn resolve(&self, reference: &str) -> Result<CommitInfo> {
        if reference.is_empty() || reference.starts_with('-') {
            return Err(StateError::ReferenceNotFound(reference.to_string()));
        }
        let spec = format!("{reference}^{{commit}}");
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", &spec], None, &[])
            .await?;
        if !output.status.success() {
            return Err(StateError::ReferenceNotFound(reference.to_string()));
        }
        let id: ObjectId = String::from_utf8_lossy(&output.stdout).parse()?;
        let raw = self.git(&["cat-file", "commit", id.as_str()], None, &[]).await?;
        parse_commit(id, &raw)
    }

    async fn working_tree_status(&self) -> Result<WorkingTreeStatus> {
        let raw = self.git(&["status", "--porcelain"], None, &[]).await?;
        let status_text = String::from_utf8_lossy(&raw).trim_end().to_string();
        Ok(WorkingTreeStatus {
            dirty: !status_text.is_empty(),
            status_text,
        })
    }

    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>> {
        let raw = self
            .git(&["ls-tree", "-r", "-z", "--full-tree", tree.as_str()], None, &[])
            .await?;
        parse_ls_tree(&raw)
    }

    async fn read_tree(&self, tree: &ObjectId) -> Result<FsSnapshot> {
        let entries: Vec<TreeEntry> = self
            .list_tree(tree)
            .await?
            .into_iter()
            .filter(|e| e.mode != EntryMode::Gitlink)
            .collect();

        let mut request = String::new();
        for entry in &entries {
            request.push_str(entry.id.as_str());
            request.push('\n');
        }
        let raw = self
            .git(&["cat-file", "--batch"], Some(request.as_bytes()), &[])
            .await?;
        let payloads = parse_cat_file_batch(&raw)?;

        let mut snapshot = FsSnapshot::new();
        for (entry, data) in entries.iter().zip(payloads) {
            let fs_entry = match entry.mode {
                EntryMode::Symlink => FsEntry::Symlink {
                    target: String::from_utf8_lossy(&data).into_owned(),
                },
                EntryMode::Executable => FsEntry::File {
                    data,
                    executable: true,
                },
                _ => FsEntry::File {
                    data,
                    executable: false,
                },
            };
            snapshot.insert(&entry.path, fs_entry)?;
        }
        Ok(snapshot)
    }

    async fn read_file(&self, tree: &ObjectId, path: &str) -> Result<Option<Vec<u8>>> {
        let raw = self
            .git(&["ls-tree", "-z", tree.as_str(), "--", path], None, &[])
            .await?;
        let entry = match parse_ls_tree(&raw)?.into_iter().find(|e| e.path == path) {
            Some(entry) if matches!(entry.mode, EntryMode::Regular | EntryMode::Executable) => {
                entry
            }
            _ => return Ok(None),
        };
        let data = self
            .git(&["cat-file", "blob", entry.id.as_str()], None, &[])
            .await?;
        Ok(Some(data))
    }

    async fn write_tree(&self, write: &TreeWrite) -> Result<ObjectId> {
        for blob in &write.new_blobs {
            let raw = self
                .git(&["hash-object", "-w", "--stdin"], Some(&blob.data), &[])
                .await?;
            let stored: ObjectId = String::from_utf8_lossy(&raw).parse()?;
            if stored != blob.id {
                return Err(StateError::ObjectIdMismatch {
                    planned: blob.id.to_string(),
                    stored: stored.to_string(),
                });
            }
        }

        let scratch = tempfile::tempdir()?;
        let index = scratch.path().join("index");
        let index = index.to_string_lossy();
        let envs = [("GIT_INDEX_FILE", index.as_ref())];

        let mut info = Vec::new();
        for entry in &write.entries {
            info.extend_from_slice(
                format!("{} {}\t{}", entry.mode.as_octal(), entry.id, entry.path).as_bytes(),
            );
            info.push(0);
        }
        if !info.is_empty() {
            self.git(&["update-index", "-z", "--index-info"], Some(&info), &envs)
                .await?;
        }

        let raw = self.git(&["write-tree"], None, &envs).await?;
        let tree: ObjectId = String::from_utf8_lossy(&raw).parse()?;
        debug!(
            tree = %tree,
            entries = write.entries.len(),
            new_blobs = write.new_blobs.len(),
            "wrote tree"
        );
        Ok(tree)
    }

    async fn commit(
        &self,
        parent: Option<&ObjectId>,
        tree: &ObjectId,
        message: &str,
    ) -> Result<ObjectId> {
        let mut args = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = parent {
            args.push("-p");
            args.push(parent.as_str());
        }
        args.extend(["-F", "-"]);

        let envs = [
            ("GIT_AUTHOR_NAME", self.identity.name.as_str()),
            ("GIT_AUTHOR_EMAIL", self.identity.email.as_str()),
            ("GIT_COMMITTER_NAME", self.identity.name.as_str()),
            ("GIT_COMMITTER_EMAIL", self.identity.email.as_str()),
        ];
        let raw = self.git(&args, Some(message.as_bytes()), &envs).await?;
        String::from_utf8_lossy(&raw).parse()
    }

    async fn read_ref(&self, refname: &str) -> Result<Option<ObjectId>> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", refname], None, &[])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).parse()?))
    }

    async fn update_ref(
        &self,
        refname: &str,
        new: &ObjectId,
        expected: Option<&ObjectId>,
    ) -> Result<()> {
        let old = expected.cloned().unwrap_or_else(ObjectId::null);
        let result = self
            .git(
                &[
                    "update-ref",
                    "-m",
                    "container-use",
                    refname,
                    new.as_str(),
                    old.as_str(),
                ],
                None,
                &[],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => Err(self.conflict_or(refname, expected, err).await),
        }
    }

    async fn delete_ref(&self, refname: &str, expected: &ObjectId) -> Result<()> {
        let result = self
            .git(&["update-ref", "-d", refname, expected.as_str()], None, &[])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => Err(self.conflict_or(refname, Some(expected), err).await),
        }
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        let raw = self
            .git(
                &["for-each-ref", "--format=%(refname) %(objectname)", prefix],
                None,
                &[],
            )
            .await?;
        let mut refs = Vec::new();
        for line in String::from_utf8_lossy(&raw).lines() {
            if let Some((name, id)) = line.rsplit_once(' ') {
                refs.push((name.to_string(), id.parse()?));
            }
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
    const BLOB: &str = "45b983be36b73c0788dc9cbcb76cbb80fc7bb057";

    #[test]
    fn parse_commit_reads_tree_parents_and_message() {
        let raw = format!(
            "tree {TREE}\nparent {BLOB}\nauthor a <a@b> 0 +0000\ncommitter a <a@b> 0 +0000\n\nsubject\n\nbody\n"
        );
        let info = parse_commit(BLOB.parse().unwrap(), raw.as_bytes()).unwrap();
        assert_eq!(info.tree.as_str(), TREE);
        assert_eq!(info.parents.len(), 1);
        assert_eq!(info.message, "subject\n\nbody\n");
    }

    #[test]
    fn parse_ls_tree_handles_tabs_and_modes() {
        let raw = format!("100755 blob {BLOB}\tbin/run me.sh\0120000 blob {BLOB}\tlink\0");
        let entries = parse_ls_tree(raw.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "bin/run me.sh");
        assert_eq!(entries[0].mode, EntryMode::Executable);
        assert_eq!(entries[1].mode, EntryMode::Symlink);
    }

    #[test]
    fn parse_cat_file_batch_splits_payloads() {
        let raw = format!("{BLOB} blob 3\nhi\n\n{BLOB} blob 0\n\n");
        let objects = parse_cat_file_batch(raw.as_bytes()).unwrap();
        assert_eq!(objects, vec![b"hi\n".to_vec(), Vec::new()]);
    }

    #[test]
    fn parse_cat_file_batch_reports_missing() {
        let raw = format!("{BLOB} missing\n");
        assert!(matches!(
            parse_cat_file_batch(raw.as_bytes()),
            Err(StateError::ObjectNotFound(_))
        ));
    }
}
