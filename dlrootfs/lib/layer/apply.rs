use std::{
    collections::{HashSet, VecDeque},
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use getset::Getters;
use nix::sys::stat::Mode;
use tar::EntryType;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

use crate::{
    utils::{self, SNAPSHOT_METADATA_DIR, WHITEOUT_OPAQUE, WHITEOUT_PREFIX},
    DlrootfsError, DlrootfsResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The first two bytes of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How many symlinks may be followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What applying one archive did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ApplyStats {
    /// Entries written to the tree.
    entries: usize,

    /// Whiteouts honored, opaque ones included.
    whiteouts: usize,

    /// Entries that were not applied, such as device nodes.
    skipped: usize,
}

/// Applies the entries of one archive onto a root directory.
struct Applier<'a> {
    root: &'a Path,
    written: HashSet<String>,
    dir_modes: Vec<(PathBuf, u32)>,
    stats: ApplyStats,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts a plain or gzip-compressed tar archive onto `dest`, treating `.wh.` entries as
/// deletions of what earlier layers put there.
///
/// Member names are confined to `dest`: leading `/` is dropped, `..` may not climb above it,
/// and symlinks met along the way are resolved as if `dest` were the filesystem root.
///
/// Ownership is not restored. Device nodes are skipped.
///
/// `layer` only names the archive in errors and logs. Any failure is reported as
/// [`DlrootfsError::LayerApply`].
pub async fn apply_archive<R>(reader: R, dest: &Path, layer: &str) -> DlrootfsResult<ApplyStats>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| DlrootfsError::layer_apply(layer, e))?;

    let bridge = SyncIoBridge::new(reader);
    let dest = dest.to_path_buf();
    let layer = layer.to_string();

    tokio::task::spawn_blocking(move || -> DlrootfsResult<ApplyStats> {
        let stats = Applier::new(&dest)
            .apply(bridge)
            .map_err(|e| DlrootfsError::layer_apply(&layer, e))?;

        tracing::debug!(
            "applied {layer}: {} entries, {} whiteouts, {} skipped",
            stats.entries,
            stats.whiteouts,
            stats.skipped
        );

        Ok(stats)
    })
    .await?
}

/// Resolves `relative` under `root`, following symlinks as if `root` were `/`.
///
/// The last component is not followed when `follow_last` is false.
fn resolve_in_root(root: &Path, relative: &str, follow_last: bool) -> io::Result<PathBuf> {
    let mut pending: VecDeque<String> = relative
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(component) = pending.pop_front() {
        match component.as_str() {
            "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        if pending.is_empty() && !follow_last {
            resolved.push(component);
            break;
        }

        let candidate = root.join(resolved.join("/")).join(&component);
        let is_symlink = fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        if !is_symlink {
            resolved.push(component);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("too many levels of symbolic links resolving {relative}"),
            ));
        }

        let target = fs::read_link(&candidate)?;
        let target = target.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "symlink target is not utf-8")
        })?;

        if target.starts_with('/') {
            resolved.clear();
        }

        for part in target.split('/').filter(|c| !c.is_empty()).rev() {
            pending.push_front(part.to_string());
        }
    }

    Ok(root.join(resolved.join("/")))
}

fn remove_any(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a> Applier<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            written: HashSet::new(),
            dir_modes: Vec::new(),
            stats: ApplyStats::default(),
        }
    }

    fn apply(mut self, reader: impl Read + 'static) -> io::Result<ApplyStats> {
        let mut reader = BufReader::new(reader);
        let input: Box<dyn Read> = if reader.fill_buf()?.starts_with(&GZIP_MAGIC) {
            Box::new(GzDecoder::new(reader))
        } else {
            Box::new(reader)
        };

        let mut archive = tar::Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8(entry.path_bytes().into_owned())
                .map_err(|_| invalid("archive member name is not utf-8"))?;

            self.apply_entry(&name, &mut entry)
                .map_err(|e| io::Error::new(e.kind(), format!("{name}: {e}")))?;
        }

        // Whatever trails the end-of-archive marker still belongs to the stream.
        io::copy(&mut archive.into_inner(), &mut io::sink())?;

        self.finish()
    }

    fn apply_entry<R: Read>(&mut self, name: &str, entry: &mut tar::Entry<R>) -> io::Result<()> {
        let normalized =
            dlutils::normalize_archive_path(name).map_err(|e| invalid(e.to_string()))?;
        let relative = normalized.as_str();
        if relative.is_empty() {
            return Ok(());
        }

        if relative.split('/').next() == Some(SNAPSHOT_METADATA_DIR) {
            tracing::warn!("skipping {relative}: reserved for snapshot metadata");
            self.stats.skipped += 1;
            return Ok(());
        }

        let (parent, file_name) = match relative.rsplit_once('/') {
            Some((parent, file_name)) => (parent, file_name),
            None => ("", relative),
        };

        if file_name == WHITEOUT_OPAQUE {
            let dir = resolve_in_root(self.root, parent, true)?;
            if self.is_metadata(&dir) {
                return self.skip_metadata(relative);
            }
            tracing::trace!("opaque whiteout in {parent:?}");
            self.clear_lower(&dir, parent)?;
            self.stats.whiteouts += 1;
            return Ok(());
        }

        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(invalid("whiteout does not name a path"));
            }

            let dest = resolve_in_root(self.root, parent, true)?.join(target);
            if self.is_metadata(&dest) {
                return self.skip_metadata(relative);
            }

            tracing::trace!("whiteout removes {}", dest.display());
            remove_any(&dest)?;
            self.stats.whiteouts += 1;
            return Ok(());
        }

        let parent_dir = resolve_in_root(self.root, parent, true)?;
        let dest = parent_dir.join(file_name);
        if self.is_metadata(&dest) {
            return self.skip_metadata(relative);
        }

        fs::create_dir_all(&parent_dir)?;

        let mode = entry.header().mode()? & 0o7777;
        let existing = fs::symlink_metadata(&dest).ok();
        tracing::trace!(
            "{relative} ({:?}, {})",
            entry.header().entry_type(),
            utils::format_mode(mode)
        );

        match entry.header().entry_type() {
            EntryType::Directory => {
                if existing.as_ref().is_some_and(|m| !m.is_dir()) {
                    fs::remove_file(&dest)?;
                }
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o700))?;
                self.dir_modes.push((dest, mode));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if existing.is_some() {
                    remove_any(&dest)?;
                }
                let mut file = File::create(&dest)?;
                io::copy(entry, &mut file)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| invalid("symlink without a target"))?;
                if existing.is_some() {
                    remove_any(&dest)?;
                }
                symlink(target, &dest)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name_bytes()
                    .ok_or_else(|| invalid("hard link without a target"))?;
                let target = std::str::from_utf8(&target)
                    .map_err(|_| invalid("hard link target is not utf-8"))?;
                let target = dlutils::normalize_archive_path(target)
                    .map_err(|e| invalid(e.to_string()))?;
                let source = resolve_in_root(self.root, target.as_str(), false)?;
                if self.is_metadata(&source) {
                    return self.skip_metadata(relative);
                }

                if existing.is_some() {
                    remove_any(&dest)?;
                }
                fs::hard_link(&source, &dest)?;
            }
            EntryType::Fifo => {
                if existing.is_some() {
                    remove_any(&dest)?;
                }
                nix::unistd::mkfifo(&dest, Mode::from_bits_truncate(mode))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Char | EntryType::Block => {
                tracing::warn!("skipping device node {relative}");
                self.stats.skipped += 1;
                return Ok(());
            }
            other => {
                tracing::warn!("skipping unsupported entry {relative} ({other:?})");
                self.stats.skipped += 1;
                return Ok(());
            }
        }

        self.written.insert(relative.to_string());
        self.stats.entries += 1;
        Ok(())
    }

    /// Removes everything under `dir` that this archive did not write itself.
    fn clear_lower(&self, dir: &Path, relative: &str) -> io::Result<()> {
        let children = match fs::read_dir(dir) {
            Ok(children) => children,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for child in children {
            let child = child?;
            let name = child.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| invalid("directory entry name is not utf-8"))?;
            if relative.is_empty() && name == SNAPSHOT_METADATA_DIR {
                continue;
            }

            let child_relative = if relative.is_empty() {
                name.to_string()
            } else {
                format!("{relative}/{name}")
            };

            if !self.written.contains(&child_relative) {
                remove_any(&child.path())?;
            } else if child.file_type()?.is_dir() {
                self.clear_lower(&child.path(), &child_relative)?;
            }
        }

        Ok(())
    }

    /// Whether `path` is the snapshot metadata directory or inside it.
    fn is_metadata(&self, path: &Path) -> bool {
        path.starts_with(self.root.join(SNAPSHOT_METADATA_DIR))
    }

    fn skip_metadata(&mut self, relative: &str) -> io::Result<()> {
        tracing::warn!("skipping {relative}: resolves into snapshot metadata");
        self.stats.skipped += 1;
        Ok(())
    }

    fn finish(mut self) -> io::Result<ApplyStats> {
        // Deepest first so a read-only parent does not block its children.
        self.dir_modes
            .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));

        for (path, mode) in &self.dir_modes {
            if fs::symlink_metadata(path).is_ok_and(|m| m.is_dir()) {
                fs::set_permissions(path, fs::Permissions::from_mode(*mode))?;
            }
        }

        Ok(self.stats)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{io::Cursor, os::unix::fs::FileTypeExt};

    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_whiteouts_remove_lower_content() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();

        let lower = helper::archive(|b| {
            helper::dir(b, "etc", 0o755)?;
            helper::file(b, "etc/motd", b"hello", 0o644)?;
            helper::file(b, "etc/issue", b"issue", 0o644)?;
            helper::dir(b, "var/cache", 0o755)?;
            helper::file(b, "var/cache/a", b"a", 0o644)?;
            Ok(())
        })?;
        apply_archive(Cursor::new(lower), root, "lower").await?;

        let upper = helper::archive(|b| {
            helper::file(b, "etc/.wh.motd", b"", 0o644)?;
            helper::file(b, "var/.wh.cache", b"", 0o644)?;
            Ok(())
        })?;
        let stats = apply_archive(Cursor::new(upper), root, "upper").await?;

        assert_eq!(*stats.get_whiteouts(), 2);
        assert_eq!(*stats.get_entries(), 0);
        assert!(!root.join("etc/motd").exists());
        assert!(!root.join("etc/.wh.motd").exists());
        assert!(root.join("etc/issue").exists());
        assert!(!root.join("var/cache").exists());
        assert!(root.join("var").is_dir());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_opaque_keeps_same_layer_entries() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();

        let lower = helper::archive(|b| {
            helper::file(b, "dir1/old1", b"1", 0o644)?;
            helper::file(b, "dir1/sub/old2", b"2", 0o644)?;
            Ok(())
        })?;
        apply_archive(Cursor::new(lower), root, "lower").await?;

        let upper = helper::archive(|b| {
            helper::dir(b, "dir1/sub", 0o755)?;
            helper::file(b, "dir1/new", b"n", 0o644)?;
            helper::file(b, "dir1/.wh..wh..opq", b"", 0o644)?;
            Ok(())
        })?;
        apply_archive(Cursor::new(upper), root, "upper").await?;

        assert!(root.join("dir1/new").exists());
        assert!(root.join("dir1/sub").is_dir());
        assert!(!root.join("dir1/old1").exists());
        assert!(!root.join("dir1/sub/old2").exists());
        assert!(!root.join("dir1/.wh..wh..opq").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_gzip_links_and_kinds() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        fs::create_dir_all(root.join("swap"))?;

        let tar = helper::archive(|b| {
            helper::file(b, "/bin/busybox", b"bb", 0o755)?;
            helper::symlink(b, "bin/sh", "busybox")?;
            helper::hardlink(b, "bin/ls", "bin/busybox")?;
            helper::file(b, "swap", b"now a file", 0o600)?;
            helper::special(b, "run/pipe", EntryType::Fifo)?;
            helper::special(b, "dev/null", EntryType::Char)?;
            helper::dir(b, "ro", 0o555)?;
            helper::file(b, "ro/inside", b"i", 0o444)?;
            Ok(())
        })?;

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        io::Write::write_all(&mut gz, &tar)?;
        let stats = apply_archive(Cursor::new(gz.finish()?), root, "gz").await?;

        assert_eq!(*stats.get_skipped(), 1);
        assert_eq!(fs::read(root.join("bin/busybox"))?, b"bb");
        assert_eq!(fs::read_link(root.join("bin/sh"))?, PathBuf::from("busybox"));
        assert_eq!(fs::read(root.join("bin/ls"))?, b"bb");
        assert_eq!(fs::read_to_string(root.join("swap"))?, "now a file");
        assert!(fs::symlink_metadata(root.join("run/pipe"))?.file_type().is_fifo());
        assert!(!root.join("dev/null").exists());
        assert_eq!(
            fs::metadata(root.join("ro"))?.permissions().mode() & 0o7777,
            0o555
        );

        fs::set_permissions(root.join("ro"), fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_stays_inside_root() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("root");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside)?;

        let tar = helper::archive(|b| {
            helper::symlink(b, "escape", "/../../outside")?;
            helper::file(b, "escape/owned", b"x", 0o644)?;
            Ok(())
        })?;
        apply_archive(Cursor::new(tar), &root, "symlinks").await?;

        assert!(!outside.join("owned").exists());
        assert!(root.join("outside/owned").exists());

        let tar = helper::raw_archive(|b| {
            helper::raw_file(b, "../evil", b"x")?;
            Ok(())
        })?;
        let result = apply_archive(Cursor::new(tar), &root, "traversal").await;
        assert!(matches!(
            result,
            Err(DlrootfsError::LayerApply { ref layer, .. }) if layer == "traversal"
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_rejects_garbage() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let garbage = Cursor::new(vec![0x1f, 0x8b, 1, 2, 3]);
        let result = apply_archive(garbage, temp.path(), "bad").await;
        assert!(matches!(result, Err(DlrootfsError::LayerApply { .. })));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_archive_leaves_snapshot_metadata_alone() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let metadata = root.join(SNAPSHOT_METADATA_DIR);
        fs::create_dir_all(&metadata)?;
        fs::write(metadata.join("HEAD"), "layer_0")?;
        fs::write(root.join("lower"), "l")?;

        let tar = helper::archive(|b| {
            helper::file(b, ".wh..wh..opq", b"", 0o644)?;
            helper::file(b, ".wh..dlrootfs-snapshots", b"", 0o644)?;
            helper::file(b, ".dlrootfs-snapshots/HEAD", b"bogus", 0o644)?;
            helper::symlink(b, "meta", ".dlrootfs-snapshots")?;
            helper::file(b, "meta/HEAD", b"bogus", 0o644)?;
            helper::file(b, "upper", b"u", 0o644)?;
            Ok(())
        })?;
        let stats = apply_archive(Cursor::new(tar), root, "hostile").await?;

        assert_eq!(*stats.get_skipped(), 3);
        assert_eq!(fs::read_to_string(metadata.join("HEAD"))?, "layer_0");
        assert!(!root.join("lower").exists());
        assert!(root.join("upper").exists());
        assert!(fs::symlink_metadata(root.join("meta"))?.file_type().is_symlink());

        Ok(())
    }

    pub(crate) mod helper {
        use tar::{Builder, Header};

        use super::*;

        pub(crate) fn archive(
            build: impl FnOnce(&mut Builder<Vec<u8>>) -> io::Result<()>,
        ) -> io::Result<Vec<u8>> {
            let mut builder = Builder::new(Vec::new());
            build(&mut builder)?;
            builder.into_inner()
        }

        pub(crate) fn raw_archive(
            build: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
        ) -> io::Result<Vec<u8>> {
            let mut bytes = Vec::new();
            build(&mut bytes)?;
            bytes.extend_from_slice(&[0; 1024]);
            Ok(bytes)
        }

        fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
            let mut header = Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_mode(mode);
            header.set_size(size);
            header
        }

        pub(crate) fn dir(b: &mut Builder<Vec<u8>>, path: &str, mode: u32) -> io::Result<()> {
            let mut h = header(EntryType::Directory, mode, 0);
            b.append_data(&mut h, path, io::empty())
        }

        pub(crate) fn file(
            b: &mut Builder<Vec<u8>>,
            path: &str,
            content: &[u8],
            mode: u32,
        ) -> io::Result<()> {
            let mut h = header(EntryType::Regular, mode, content.len() as u64);
            b.append_data(&mut h, path.trim_start_matches('/'), content)
        }

        pub(crate) fn symlink(
            b: &mut Builder<Vec<u8>>,
            path: &str,
            target: &str,
        ) -> io::Result<()> {
            let mut h = header(EntryType::Symlink, 0o777, 0);
            b.append_link(&mut h, path, target)
        }

        pub(crate) fn hardlink(
            b: &mut Builder<Vec<u8>>,
            path: &str,
            target: &str,
        ) -> io::Result<()> {
            let mut h = header(EntryType::Link, 0o644, 0);
            b.append_link(&mut h, path, target)
        }

        pub(crate) fn special(
            b: &mut Builder<Vec<u8>>,
            path: &str,
            entry_type: EntryType,
        ) -> io::Result<()> {
            let mut h = header(entry_type, 0o644, 0);
            b.append_data(&mut h, path, io::empty())
        }

        /// Writes a header block by hand, bypassing the builder's path checks.
        pub(crate) fn raw_file(out: &mut Vec<u8>, path: &str, content: &[u8]) -> io::Result<()> {
            let mut h = header(EntryType::Regular, 0o644, content.len() as u64);
            let name = &mut h.as_old_mut().name;
            name[..path.len()].copy_from_slice(path.as_bytes());
            h.set_cksum();

            out.extend_from_slice(h.as_bytes());
            out.extend_from_slice(content);
            out.resize(out.len().div_ceil(512) * 512, 0);
            Ok(())
        }
    }
}
