//! In-memory filesystem snapshots and their tar encoding.
//!
//! A [`FsSnapshot`] is the common currency between the object store and the
//! container engine: `git archive` and `docker cp` both speak tar, and both
//! sides decode into (or encode from) the same path-keyed map.

use std::collections::BTreeMap;
use std::io::Read;

use tar::{Archive, Builder, EntryType, Header};

use crate::error::StateError;
use crate::Result;

/// A single non-directory filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEntry {
    File { data: Vec<u8>, executable: bool },
    Symlink { target: String },
}

/// Files and symlinks under one root, keyed by normalized relative path.
///
/// Directories are implied by their contents. Paths never contain `.`, `..`,
/// empty components, or a `.git` component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsSnapshot {
    entries: BTreeMap<String, FsEntry>,
}

/// Normalize a path relative to the snapshot root.
///
/// Returns `Ok(None)` for paths that are not tracked (the root itself and
/// anything under a `.git` directory).
pub fn normalize_path(raw: &str) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(StateError::InvalidPath(raw.to_string())),
            ".git" => return Ok(None),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

impl FsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Untracked paths are silently ignored.
    pub fn insert(&mut self, path: &str, entry: FsEntry) -> Result<()> {
        if let Some(path) = normalize_path(path)? {
            self.entries.insert(path, entry);
        }
        Ok(())
    }

    pub fn insert_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        self.insert(
            path,
            FsEntry::File {
                data: data.into(),
                executable: false,
            },
        )
    }

    pub fn remove(&mut self, path: &str) -> Option<FsEntry> {
        let path = normalize_path(path).ok().flatten()?;
        self.entries.remove(&path)
    }

    pub fn get(&self, path: &str) -> Option<&FsEntry> {
        let path = normalize_path(path).ok().flatten()?;
        self.entries.get(&path)
    }

    /// Contents of a regular file, if `path` is one.
    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        match self.get(path)? {
            FsEntry::File { data, .. } => Some(data),
            FsEntry::Symlink { .. } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FsEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a tar stream. Hard links become copies of their target;
    /// directories and metadata records are skipped.
    pub fn from_tar(bytes: &[u8]) -> Result<Self> {
        let mut snapshot = FsSnapshot::new();
        let mut archive = Archive::new(bytes);
        let entries = archive
            .entries()
            .map_err(|e| StateError::Archive(e.to_string()))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| StateError::Archive(e.to_string()))?;
            let raw_path = entry
                .path()
                .map_err(|e| StateError::Archive(e.to_string()))?
                .to_string_lossy()
                .into_owned();

            let fs_entry = match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {
                    let mode = entry.header().mode().unwrap_or(0o644);
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    FsEntry::File {
                        data,
                        executable: mode & 0o111 != 0,
                    }
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(|e| StateError::Archive(e.to_string()))?
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    FsEntry::Symlink { target }
                }
                // Later names of a multiply-linked inode point back at the
                // first one, which is always earlier in the stream.
                EntryType::Link => {
                    let source = entry
                        .link_name()
                        .map_err(|e| StateError::Archive(e.to_string()))?
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let Some(source) = normalize_path(&source)? else {
                        continue;
                    };
                    match snapshot.entries.get(&source) {
                        Some(original) => original.clone(),
                        None => {
                            return Err(StateError::Archive(format!(
                                "hard link {raw_path} points at unknown entry {source}"
                            )))
                        }
                    }
                }
                _ => continue,
            };
            snapshot.insert(&raw_path, fs_entry)?;
        }

        Ok(snapshot)
    }

    /// Encode as a tar stream with explicit parent directory records.
    ///
    /// Timestamps and ownership are zeroed so equal snapshots produce equal
    /// archives.
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());

        let mut dirs = std::collections::BTreeSet::new();
        for path in self.entries.keys() {
            let mut prefix = String::new();
            let components: Vec<&str> = path.split('/').collect();
            for component in &components[..components.len() - 1] {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(component);
                dirs.insert(prefix.clone());
            }
        }

        for dir in &dirs {
            let mut header = base_header(EntryType::Directory, 0o755);
            builder
                .append_data(&mut header, format!("{dir}/"), std::io::empty())
                .map_err(|e| StateError::Archive(e.to_string()))?;
        }

        for (path, entry) in &self.entries {
            match entry {
                FsEntry::File { data, executable } => {
                    let mode = if *executable { 0o755 } else { 0o644 };
                    let mut header = base_header(EntryType::Regular, mode);
                    header.set_size(data.len() as u64);
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .map_err(|e| StateError::Archive(e.to_string()))?;
                }
                FsEntry::Symlink { target } => {
                    let mut header = base_header(EntryType::Symlink, 0o777);
                    builder
                        .append_link(&mut header, path, target)
                        .map_err(|e| StateError::Archive(e.to_string()))?;
                }
            }
        }

        builder
            .into_inner()
            .map_err(|e| StateError::Archive(e.to_string()))
    }
}

fn base_header(kind: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(0);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dots_and_slashes() {
        assert_eq!(normalize_path("./a/b").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_path("/a//b/").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_path("./").unwrap(), None);
    }

    #[test]
    fn normalize_skips_git_dirs_and_rejects_parent() {
        assert_eq!(normalize_path(".git/config").unwrap(), None);
        assert_eq!(normalize_path("vendor/lib/.git/HEAD").unwrap(), None);
        assert!(normalize_path("../etc/passwd").is_err());
    }

    #[test]
    fn tar_preserves_files_modes_and_symlinks() {
        let mut snap = FsSnapshot::new();
        snap.insert_file("README.md", "hello\n").unwrap();
        snap.insert(
            "bin/run.sh",
            FsEntry::File {
                data: b"#!/bin/sh\n".to_vec(),
                executable: true,
            },
        )
        .unwrap();
        snap.insert(
            "link",
            FsEntry::Symlink {
                target: "README.md".into(),
            },
        )
        .unwrap();

        let decoded = FsSnapshot::from_tar(&snap.to_tar().unwrap()).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn to_tar_is_deterministic() {
        let mut snap = FsSnapshot::new();
        snap.insert_file("a/b/c.txt", "x").unwrap();
        assert_eq!(snap.to_tar().unwrap(), snap.to_tar().unwrap());
    }

    #[test]
    fn from_tar_ignores_git_metadata() {
        let mut with_git = FsSnapshot::new();
        with_git.insert_file("src/main.rs", "fn main() {}").unwrap();
        let mut bytes = with_git.to_tar().unwrap();

        // Append a `.git/HEAD` record by hand; the decoder must drop it.
        let mut builder = Builder::new(Vec::new());
        let mut header = base_header(EntryType::Regular, 0o644);
        header.set_size(4);
        builder
            .append_data(&mut header, ".git/HEAD", &b"ref:"[..])
            .unwrap();
        let extra = builder.into_inner().unwrap();
        bytes.truncate(bytes.len() - 1024);
        bytes.extend_from_slice(&extra);

        let decoded = FsSnapshot::from_tar(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.read_file("src/main.rs").is_some());
    }

    fn link_archive(target: &str) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        let mut header = base_header(EntryType::Regular, 0o755);
        header.set_size(3);
        builder
            .append_data(&mut header, "./a", &b"hi\n"[..])
            .unwrap();
        let mut link = base_header(EntryType::Link, 0o755);
        builder.append_link(&mut link, "./b", target).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn from_tar_copies_hard_links() {
        let decoded = FsSnapshot::from_tar(&link_archive("./a")).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("b"), decoded.get("a"));
        assert!(matches!(
            decoded.get("b"),
            Some(FsEntry::File { executable: true, .. })
        ));
    }

    #[test]
    fn from_tar_skips_hard_links_into_git_metadata() {
        let decoded = FsSnapshot::from_tar(&link_archive(".git/objects/pack/x")).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.get("b").is_none());
    }

    #[test]
    fn from_tar_rejects_dangling_hard_link() {
        let err = FsSnapshot::from_tar(&link_archive("missing")).unwrap_err();
        assert!(matches!(err, StateError::Archive(_)));
    }
}
