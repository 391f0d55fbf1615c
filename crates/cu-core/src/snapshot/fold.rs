//! Folding a container filesystem back onto a base tree.
//!
//! The fold is a pure function of `(base tree listing, exported snapshot)`,
//! so it can be tested without a container engine or a repository.

use std::collections::{BTreeMap, HashSet};

use cu_state::{EntryMode, FsEntry, FsSnapshot, ObjectId, PendingBlob, TreeEntry, TreeWrite};

/// Compute the tree for `fs`, reusing every blob `base` already references.
///
/// Only contents absent from `base` appear in `new_blobs`, once each.
/// Submodule entries of `base` survive unless the snapshot put something at
/// or under their path, or a file at one of their ancestors.
pub fn fold_snapshot(base: &[TreeEntry], fs: &FsSnapshot) -> TreeWrite {
    let known: HashSet<&ObjectId> = base
        .iter()
        .filter(|e| e.mode != EntryMode::Gitlink)
        .map(|e| &e.id)
        .collect();

    let mut entries = Vec::with_capacity(fs.len());
    let mut pending: BTreeMap<ObjectId, Vec<u8>> = BTreeMap::new();

    for (path, entry) in fs.iter() {
        let (mode, data) = match entry {
            FsEntry::File { data, executable } => (
                if *executable {
                    EntryMode::Executable
                } else {
                    EntryMode::Regular
                },
                data.as_slice(),
            ),
            FsEntry::Symlink { target } => (EntryMode::Symlink, target.as_bytes()),
        };

        let id = ObjectId::for_blob(data);
        if !known.contains(&id) && !pending.contains_key(&id) {
            pending.insert(id.clone(), data.to_vec());
        }
        entries.push(TreeEntry {
            path: path.to_string(),
            mode,
            id,
        });
    }

    for link in base.iter().filter(|e| e.mode == EntryMode::Gitlink) {
        if !shadowed(&link.path, fs) {
            entries.push(link.clone());
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    TreeWrite {
        entries,
        new_blobs: pending
            .into_iter()
            .map(|(id, data)| PendingBlob { id, data })
            .collect(),
    }
}

fn shadowed(path: &str, fs: &FsSnapshot) -> bool {
    if fs.get(path).is_some() {
        return true;
    }
    let below = format!("{path}/");
    if fs.iter().any(|(p, _)| p.starts_with(&below)) {
        return true;
    }
    let mut ancestor = path;
    while let Some((parent, _)) = ancestor.rsplit_once('/') {
        if fs.get(parent).is_some() {
            return true;
        }
        ancestor = parent;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, mode: EntryMode, data: &[u8]) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            mode,
            id: ObjectId::for_blob(data),
        }
    }

    fn gitlink(path: &str) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            mode: EntryMode::Gitlink,
            id: "1111111111111111111111111111111111111111".parse().unwrap(),
        }
    }

    fn snapshot(files: &[(&str, &str)]) -> FsSnapshot {
        let mut fs = FsSnapshot::new();
        for (path, data) in files {
            fs.insert_file(path, data.as_bytes()).unwrap();
        }
        fs
    }

    #[test]
    fn unchanged_snapshot_writes_no_blobs() {
        let base = vec![
            entry("README.md", EntryMode::Regular, b"hello\n"),
            entry("src/lib.rs", EntryMode::Regular, b"// lib\n"),
        ];
        let fs = snapshot(&[("README.md", "hello\n"), ("src/lib.rs", "// lib\n")]);

        let write = fold_snapshot(&base, &fs);
        assert!(write.new_blobs.is_empty());
        assert_eq!(write.entries, base);
    }

    #[test]
    fn only_new_contents_become_blobs() {
        let base = vec![entry("a.txt", EntryMode::Regular, b"same\n")];
        let fs = snapshot(&[
            ("a.txt", "same\n"),
            ("copy.txt", "same\n"),
            ("f", "hi\n"),
            ("g", "hi\n"),
        ]);

        let write = fold_snapshot(&base, &fs);
        assert_eq!(write.entries.len(), 4);
        assert_eq!(write.new_blobs.len(), 1);
        assert_eq!(write.new_blobs[0].data, b"hi\n");
        assert_eq!(
            write.new_blobs[0].id.as_str(),
            "45b983be36b73c0788dc9cbcb76cbb80fc7bb057"
        );
    }

    #[test]
    fn deleted_files_and_empty_dirs_disappear() {
        let base = vec![
            entry("keep", EntryMode::Regular, b"k"),
            entry("gone/file", EntryMode::Regular, b"g"),
        ];
        let fs = snapshot(&[("keep", "k")]);

        let write = fold_snapshot(&base, &fs);
        let paths: Vec<&str> = write.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["keep"]);
    }

    #[test]
    fn modes_follow_the_snapshot() {
        let mut fs = FsSnapshot::new();
        fs.insert(
            "run.sh",
            FsEntry::File {
                data: b"#!/bin/sh\n".to_vec(),
                executable: true,
            },
        )
        .unwrap();
        fs.insert(
            "current",
            FsEntry::Symlink {
                target: "run.sh".into(),
            },
        )
        .unwrap();
        let base = vec![entry("run.sh", EntryMode::Regular, b"#!/bin/sh\n")];

        let write = fold_snapshot(&base, &fs);
        assert_eq!(write.entries[0].path, "current");
        assert_eq!(write.entries[0].mode, EntryMode::Symlink);
        assert_eq!(write.entries[0].id, ObjectId::for_blob(b"run.sh"));
        assert_eq!(write.entries[1].mode, EntryMode::Executable);
        // the chmod alone needs no new blob
        assert_eq!(write.new_blobs.len(), 1);
    }

    #[test]
    fn submodules_are_carried_unless_replaced() {
        let base = vec![gitlink("vendor/dep"), gitlink("tools"), gitlink("docs/sub")];
        let fs = snapshot(&[("README.md", "x"), ("tools", "now a file"), ("docs", "file")]);

        let write = fold_snapshot(&base, &fs);
        let links: Vec<&str> = write
            .entries
            .iter()
            .filter(|e| e.mode == EntryMode::Gitlink)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(links, vec!["vendor/dep"]);
    }

    #[test]
    fn entries_are_sorted_by_path() {
        let fs = snapshot(&[("z", "1"), ("a/b", "2"), ("m", "3")]);
        let write = fold_snapshot(&[], &fs);
        let paths: Vec<&str> = write.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a/b", "m", "z"]);
    }
}
