use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::Path,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    utils::{self, SNAPSHOT_METADATA_DIR},
    DlrootfsResult, RepositoryError,
};

use super::{ObjectHash, ObjectStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Mode recorded for symbolic links, which carry no permissions of their own.
pub const SYMLINK_MODE: u32 = 0o777;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What kind of filesystem object a tree entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// A regular file whose content is the object `digest`.
    File {
        /// Hash of the content.
        digest: ObjectHash,

        /// Content length in bytes.
        size: u64,
    },

    /// A directory.
    Directory,

    /// A symbolic link.
    Symlink {
        /// The link target, verbatim.
        target: String,
    },

    /// A named pipe.
    Fifo,
}

/// One path of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct TreeEntry {
    /// What the path is.
    kind: EntryKind,

    /// Permission bits, including setuid/setgid/sticky.
    mode: u32,
}

/// The full state of a working tree: every tracked path relative to the root, in byte-wise
/// order, mapped to what it holds.
///
/// The repository's metadata directory is never part of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EntryKind {
    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

impl TreeEntry {
    /// Creates a new entry.
    pub fn new(kind: EntryKind, mode: u32) -> Self {
        Self { kind, mode }
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

impl Tree {
    /// Returns the entry at `path`.
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    /// Inserts or replaces the entry at `path`.
    pub fn insert(&mut self, path: impl Into<String>, entry: TreeEntry) {
        self.entries.insert(path.into(), entry);
    }

    /// Iterates entries in byte-wise path order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    /// Iterates paths in byte-wise order.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the current state of the directory tree at `root`.
    ///
    /// With a `store`, the content of every regular file is also written to it so the tree can
    /// be committed. Without one, files are only hashed.
    ///
    /// Device nodes and sockets are not tracked. Blocking.
    pub fn scan(root: &Path, store: Option<&ObjectStore>) -> DlrootfsResult<Self> {
        let mut tree = Tree::default();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == SNAPSHOT_METADATA_DIR));

        for entry in walker {
            let entry = entry
                .map_err(|e| RepositoryError::io("failed to walk working tree", e.into()))?;
            let path = entry.path();
            let relative = dlutils::relative_utf8_path(root, path)?;
            let metadata = entry
                .metadata()
                .map_err(|e| RepositoryError::io("failed to stat working tree entry", e.into()))?;
            let file_type = metadata.file_type();
            let mode = metadata.permissions().mode() & 0o7777;

            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                let digest = ObjectHash::from_digest(utils::get_file_hash(path).map_err(|e| {
                    RepositoryError::io(format!("failed to hash {relative}"), e)
                })?);

                if let Some(store) = store {
                    store.write_file(path, &digest).map_err(|e| {
                        RepositoryError::io(format!("failed to store {relative}"), e)
                    })?;
                }

                EntryKind::File {
                    digest,
                    size: metadata.len(),
                }
            } else if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(|e| {
                    RepositoryError::io(format!("failed to read link {relative}"), e)
                })?;
                let target = target
                    .to_str()
                    .ok_or_else(|| {
                        dlutils::DlutilsError::NonUtf8Path(target.display().to_string())
                    })?
                    .to_string();

                tree.insert(relative, TreeEntry::new(EntryKind::Symlink { target }, SYMLINK_MODE));
                continue;
            } else if file_type.is_fifo() {
                EntryKind::Fifo
            } else {
                tracing::warn!("not tracking special file {relative}");
                continue;
            };

            tree.insert(relative, TreeEntry::new(kind, mode));
        }

        Ok(tree)
    }

    /// Copies the content of every file in the tree from the working tree at `root` into
    /// `store`. Objects already stored are skipped.
    ///
    /// Blocking.
    pub fn store_contents(&self, root: &Path, store: &ObjectStore) -> DlrootfsResult<()> {
        for (path, entry) in self.iter() {
            if let EntryKind::File { digest, .. } = entry.get_kind() {
                store
                    .write_file(&root.join(path), digest)
                    .map_err(|e| RepositoryError::io(format!("failed to store {path}"), e))?;
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_tree_scan_records_kinds_and_modes() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();

        fs::create_dir_all(root.join("etc/ssl"))?;
        fs::write(root.join("etc/hostname"), "box")?;
        fs::set_permissions(root.join("etc/hostname"), fs::Permissions::from_mode(0o600))?;
        symlink("hostname", root.join("etc/name"))?;
        nix::unistd::mkfifo(
            &root.join("pipe"),
            nix::sys::stat::Mode::from_bits_truncate(0o640),
        )?;

        let tree = Tree::scan(root, None)?;
        let paths: Vec<_> = tree.paths().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec!["etc", "etc/hostname", "etc/name", "etc/ssl", "pipe"]
        );

        let hostname = tree.get("etc/hostname").unwrap();
        assert_eq!(*hostname.get_mode(), 0o600);
        assert!(matches!(
            hostname.get_kind(),
            EntryKind::File { size: 3, .. }
        ));

        assert_eq!(
            tree.get("etc/name").unwrap().get_kind(),
            &EntryKind::Symlink {
                target: "hostname".to_string()
            }
        );
        assert!(tree.get("etc/ssl").unwrap().is_dir());
        assert_eq!(tree.get("pipe").unwrap().get_kind(), &EntryKind::Fifo);

        Ok(())
    }

    #[test]
    fn test_tree_scan_skips_metadata_dir() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();

        fs::create_dir_all(root.join(SNAPSHOT_METADATA_DIR).join("objects"))?;
        fs::write(root.join(SNAPSHOT_METADATA_DIR).join("HEAD"), "layer_0")?;
        fs::create_dir_all(root.join("nested").join(SNAPSHOT_METADATA_DIR))?;
        fs::write(root.join("f0"), "")?;

        let tree = Tree::scan(root, None)?;
        let paths: Vec<_> = tree.paths().cloned().collect();

        // Only the top-level metadata directory is special.
        assert_eq!(
            paths,
            vec![
                "f0".to_string(),
                "nested".to_string(),
                format!("nested/{SNAPSHOT_METADATA_DIR}")
            ]
        );

        Ok(())
    }

    #[test]
    fn test_tree_scan_with_store_persists_content() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("root");
        fs::create_dir_all(&root)?;
        fs::write(root.join("f0"), "layer zero")?;

        let store = ObjectStore::new(temp.path().join("objects"));
        let tree = Tree::scan(&root, Some(&store))?;

        let EntryKind::File { digest, .. } = tree.get("f0").unwrap().get_kind() else {
            panic!("f0 should be a file");
        };
        assert_eq!(fs::read_to_string(store.object_path(digest))?, "layer zero");

        Ok(())
    }
}
