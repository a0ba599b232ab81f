use std::{
    fs, io,
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
};

use nix::sys::stat::Mode;

use crate::{DlrootfsResult, RepositoryError};

use super::{EntryKind, ObjectStore, Tree, TreeEntry};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Makes the working tree at `root`, currently holding `current`, hold `target` instead.
///
/// Paths whose entry is unchanged are left alone. File content is copied out of `store`.
/// Directory modes are applied last, deepest first, so a read-only directory does not block
/// writing its children.
///
/// Blocking.
pub(crate) fn checkout(
    root: &Path,
    current: &Tree,
    target: &Tree,
    store: &ObjectStore,
) -> DlrootfsResult<()> {
    // Children sort after their parent, so walking backwards removes them first.
    for (path, entry) in current.iter().rev() {
        let keep = matches!(target.get(path), Some(t) if same_kind(t, entry));
        if !keep {
            tracing::debug!("checkout: removing {path}");
            remove_path(&root.join(path), entry.is_dir())
                .map_err(|e| RepositoryError::io(format!("failed to remove {path}"), e))?;
        }
    }

    for (path, entry) in target.iter() {
        let dest = root.join(path);
        let existing = current.get(path).filter(|c| same_kind(c, entry));

        write_entry(&dest, entry, existing, store)
            .map_err(|e| RepositoryError::io(format!("failed to check out {path}"), e))?;
    }

    for (path, entry) in target.iter().rev() {
        if entry.is_dir() {
            fs::set_permissions(root.join(path), fs::Permissions::from_mode(*entry.get_mode()))
                .map_err(|e| RepositoryError::io(format!("failed to set mode of {path}"), e))?;
        }
    }

    Ok(())
}

fn write_entry(
    dest: &Path,
    entry: &TreeEntry,
    existing: Option<&TreeEntry>,
    store: &ObjectStore,
) -> io::Result<()> {
    let mode = *entry.get_mode();

    match entry.get_kind() {
        EntryKind::Directory => {
            fs::create_dir_all(dest)?;
            fs::set_permissions(dest, fs::Permissions::from_mode(mode | 0o700))?;
        }
        EntryKind::File { digest, .. } => {
            let unchanged = matches!(
                existing.map(TreeEntry::get_kind),
                Some(EntryKind::File { digest: d, .. }) if d == digest
            );

            if !unchanged {
                if existing.is_some() {
                    fs::remove_file(dest)?;
                }

                tracing::debug!("checkout: writing {}", dest.display());
                fs::copy(store.object_path(digest), dest)?;
            }

            fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
        }
        EntryKind::Symlink { target } => {
            if existing == Some(entry) {
                return Ok(());
            }

            if existing.is_some() {
                fs::remove_file(dest)?;
            }

            symlink(target, dest)?;
        }
        EntryKind::Fifo => {
            if existing.is_none() {
                nix::unistd::mkfifo(dest, Mode::from_bits_truncate(mode))?;
            }

            fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

fn remove_path(path: &Path, is_dir: bool) -> io::Result<()> {
    let result = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn same_kind(a: &TreeEntry, b: &TreeEntry) -> bool {
    std::mem::discriminant(a.get_kind()) == std::mem::discriminant(b.get_kind())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_checkout_replaces_working_tree() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("root");
        let store = ObjectStore::new(temp.path().join("objects"));

        fs::create_dir_all(root.join("etc"))?;
        fs::write(root.join("etc/motd"), "welcome")?;
        fs::write(root.join("keep"), "same")?;
        let wanted = Tree::scan(&root, Some(&store))?;

        fs::write(root.join("etc/motd"), "changed")?;
        fs::remove_file(root.join("keep"))?;
        fs::create_dir_all(root.join("var/cache"))?;
        fs::write(root.join("var/cache/junk"), "x")?;
        let current = Tree::scan(&root, Some(&store))?;

        checkout(&root, &current, &wanted, &store)?;

        assert_eq!(fs::read_to_string(root.join("etc/motd"))?, "welcome");
        assert_eq!(fs::read_to_string(root.join("keep"))?, "same");
        assert!(!root.join("var").exists());
        assert_eq!(Tree::scan(&root, None)?, wanted);

        Ok(())
    }

    #[test]
    fn test_checkout_handles_kind_change_and_readonly_dirs() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("root");
        let store = ObjectStore::new(temp.path().join("objects"));

        fs::create_dir_all(root.join("ro"))?;
        fs::write(root.join("ro/file"), "content")?;
        fs::write(root.join("swap"), "was a file")?;
        fs::set_permissions(root.join("ro"), fs::Permissions::from_mode(0o555))?;
        let wanted = Tree::scan(&root, Some(&store))?;

        fs::set_permissions(root.join("ro"), fs::Permissions::from_mode(0o755))?;
        fs::remove_dir_all(root.join("ro"))?;
        fs::remove_file(root.join("swap"))?;
        fs::create_dir_all(root.join("swap/inner"))?;
        let current = Tree::scan(&root, None)?;

        checkout(&root, &current, &wanted, &store)?;

        assert_eq!(fs::read_to_string(root.join("swap"))?, "was a file");
        assert_eq!(fs::read_to_string(root.join("ro/file"))?, "content");
        assert_eq!(
            fs::metadata(root.join("ro"))?.permissions().mode() & 0o7777,
            0o555
        );

        fs::set_permissions(root.join("ro"), fs::Permissions::from_mode(0o755))?;
        Ok(())
    }
}
