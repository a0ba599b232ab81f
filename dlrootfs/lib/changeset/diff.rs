use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use getset::Getters;

use crate::{
    snapshot::{EntryKind, ObjectStore, Tree, TreeEntry},
    utils,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a path differs between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Only the new tree has the path.
    Added,

    /// Both trees have the path with different content, mode or kind.
    Modified,

    /// Only the old tree has the path.
    Deleted,
}

/// One path-level difference between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ChangeEntry {
    /// The changed path, relative to the root.
    path: String,

    /// How the path changed.
    status: ChangeStatus,

    /// The new entry, or the removed one for [`ChangeStatus::Deleted`].
    entry: TreeEntry,

    /// Where to read the content of a regular file from.
    source: Option<PathBuf>,
}

/// Where the content of the new side of a diff lives.
#[derive(Debug, Clone, Copy)]
pub enum ContentSource<'a> {
    /// Committed content in the object store.
    Store(&'a ObjectStore),

    /// Live content in a working tree.
    WorkingTree(&'a Path),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ChangeEntry {
    /// The name the entry takes in a changeset archive: the path itself, or its whiteout
    /// for a deletion.
    pub fn archive_name(&self) -> String {
        match self.status {
            ChangeStatus::Deleted => utils::whiteout_path(&self.path),
            _ => self.path.clone(),
        }
    }

    /// Whether the entry is a whiteout.
    pub fn is_whiteout(&self) -> bool {
        self.status == ChangeStatus::Deleted
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the changes that turn `old` into `new`, ordered by path.
///
/// A deleted directory yields a single deletion; its descendants are implied. The same holds
/// for the old descendants of a directory that became something else.
pub fn diff_trees(old: &Tree, new: &Tree, content: ContentSource<'_>) -> Vec<ChangeEntry> {
    let mut changes = Vec::new();
    let mut covered: HashSet<&str> = HashSet::new();

    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some((o, _)), Some((n, _))) => o.cmp(n),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
        };

        let (path, old_entry, new_entry) = match order {
            Ordering::Less => match old_iter.next() {
                Some((path, old_entry)) => (path, Some(old_entry), None),
                None => break,
            },
            Ordering::Greater => match new_iter.next() {
                Some((path, new_entry)) => (path, None, Some(new_entry)),
                None => break,
            },
            Ordering::Equal => match (old_iter.next(), new_iter.next()) {
                (Some((path, old_entry)), Some((_, new_entry))) => {
                    (path, Some(old_entry), Some(new_entry))
                }
                _ => break,
            },
        };

        let Some(new_entry) = new_entry else {
            let Some(old_entry) = old_entry else {
                continue;
            };

            if has_covered_ancestor(&covered, path) {
                continue;
            }

            if old_entry.is_dir() {
                covered.insert(path);
            }

            changes.push(ChangeEntry {
                path: path.clone(),
                status: ChangeStatus::Deleted,
                entry: old_entry.clone(),
                source: None,
            });
            continue;
        };

        let status = match old_entry {
            None => ChangeStatus::Added,
            Some(old_entry) if old_entry == new_entry => continue,
            Some(old_entry) => {
                if old_entry.is_dir() && !new_entry.is_dir() {
                    covered.insert(path);
                }
                ChangeStatus::Modified
            }
        };

        changes.push(ChangeEntry {
            path: path.clone(),
            status,
            entry: new_entry.clone(),
            source: content_path(content, path, new_entry),
        });
    }

    changes
}

fn content_path(content: ContentSource<'_>, path: &str, entry: &TreeEntry) -> Option<PathBuf> {
    let EntryKind::File { digest, .. } = entry.get_kind() else {
        return None;
    };

    Some(match content {
        ContentSource::Store(store) => store.object_path(digest),
        ContentSource::WorkingTree(root) => root.join(path),
    })
}

fn has_covered_ancestor(covered: &HashSet<&str>, path: &str) -> bool {
    if covered.is_empty() {
        return false;
    }

    path.char_indices()
        .filter(|(_, c)| *c == '/')
        .any(|(i, _)| covered.contains(&path[..i]))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeStatus::Added => write!(f, "A"),
            ChangeStatus::Modified => write!(f, "M"),
            ChangeStatus::Deleted => write!(f, "D"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
