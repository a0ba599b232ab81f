use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    utils::{
        HEAD_FILENAME, OBJECTS_SUBDIR, SNAPSHOTS_SUBDIR, SNAPSHOT_METADATA_DIR,
        SNAPSHOT_ORDER_FILENAME,
    },
    DlrootfsError, DlrootfsResult, RepositoryError,
};

use super::{checkout, ObjectHash, ObjectStore, Tree};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A versioned working directory holding one line of commits per snapshot.
///
/// Snapshot metadata lives in a hidden directory inside the root, which is never part of
/// a recorded tree. Content is stored by hash, commits point at their parent, and each
/// snapshot records the commit it started from and its latest commit.
///
/// Only one writer may use a repository path at a time; nothing here takes a lock.
///
/// ## Examples
///
/// ```no_run
/// use dlrootfs::snapshot::SnapshotRepository;
///
/// # async fn example() -> dlrootfs::DlrootfsResult<()> {
/// let mut repo = SnapshotRepository::open("./rootfs").await?;
/// repo.switch_or_create("layer_0").await?;
/// std::fs::write(repo.root().join("hello"), "world")?;
/// repo.commit_all("layer 0").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SnapshotRepository {
    layout: Layout,
    active: Option<String>,
}

/// A recorded state of the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Commit {
    /// The recorded tree.
    tree: ObjectHash,

    /// The previous commit, if any.
    parent: Option<ObjectHash>,

    /// The snapshot this commit was made on.
    snapshot: String,

    /// The commit message.
    message: String,

    /// When the commit was made.
    created_at: DateTime<Utc>,
}

/// What the repository knows about one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotInfo {
    /// The snapshot name.
    name: String,

    /// The commit the snapshot started from.
    base: Option<ObjectHash>,

    /// The latest commit made on the snapshot itself.
    tip: Option<ObjectHash>,

    /// Number of commits made on the snapshot.
    commits: usize,

    /// When the snapshot was created.
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Layout {
    root: PathBuf,
    meta_dir: PathBuf,
    store: ObjectStore,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotRepository {
    /// Opens the repository rooted at `path`, initializing it if needed.
    ///
    /// The directory is created when missing. An existing repository keeps its snapshots and
    /// its active snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> DlrootfsResult<Self> {
        let root = path.into();
        let layout = Layout::new(root);

        let (layout, active) = blocking(move || {
            layout.init()?;
            let active = layout.read_head()?;
            Ok((layout, active))
        })
        .await?;

        tracing::debug!(
            "opened snapshot repository at {} (active: {:?})",
            layout.root.display(),
            active
        );

        Ok(Self { layout, active })
    }

    /// The working tree root.
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// The metadata directory inside the root.
    pub fn metadata_dir(&self) -> &Path {
        &self.layout.meta_dir
    }

    /// The name of the checked out snapshot, if any.
    pub fn active_snapshot(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub(crate) fn store(&self) -> &ObjectStore {
        &self.layout.store
    }

    /// Switches to snapshot `name`, creating it when it does not exist.
    ///
    /// A new snapshot starts from the latest commit of the active snapshot and leaves the
    /// working tree as it is. Switching to an existing snapshot checks out its latest commit
    /// and is refused while the working tree has uncommitted changes.
    ///
    /// Returns whether the snapshot was newly created.
    pub async fn switch_or_create(&mut self, name: &str) -> DlrootfsResult<bool> {
        validate_snapshot_name(name)?;

        if self.active.as_deref() == Some(name) {
            return Ok(false);
        }

        let layout = self.layout.clone();
        let active = self.active.clone();
        let name = name.to_string();
        let switched = name.clone();

        let created = blocking(move || {
            if let Some(target) = layout.read_snapshot(&name)? {
                let current = Tree::scan(&layout.root, None)?;
                let expected = match &active {
                    Some(active) => layout.snapshot_tree(&layout.require_snapshot(active)?)?,
                    None => Tree::default(),
                };

                if current != expected {
                    return Err(RepositoryError::DirtyWorkingTree(name).into());
                }

                let wanted = layout.snapshot_tree(&target)?;
                checkout::checkout(&layout.root, &current, &wanted, &layout.store)?;
                layout.write_head(&name)?;

                return Ok(false);
            }

            let base = match &active {
                Some(active) => layout.require_snapshot(active)?.head().cloned(),
                None => None,
            };

            let info = SnapshotInfo {
                name: name.clone(),
                base,
                tip: None,
                commits: 0,
                created_at: Utc::now(),
            };

            layout.write_snapshot(&info)?;
            layout.append_order(&name)?;
            layout.write_head(&name)?;

            Ok(true)
        })
        .await?;

        if created {
            tracing::info!("created snapshot {switched}");
        } else {
            tracing::info!("switched to snapshot {switched}");
        }

        self.active = Some(switched);
        Ok(created)
    }

    /// Checks out the latest state of snapshot `name`, or the empty tree for `None`, and makes
    /// it the active snapshot. Uncommitted changes in the working tree are discarded.
    pub async fn reset_working_tree(&mut self, name: Option<&str>) -> DlrootfsResult<()> {
        let layout = self.layout.clone();
        let target = name.map(str::to_string);
        let active = target.clone();

        blocking(move || {
            let wanted = match &target {
                Some(name) => layout.snapshot_tree(&layout.require_snapshot(name)?)?,
                None => Tree::default(),
            };

            let current = Tree::scan(&layout.root, None)?;
            checkout::checkout(&layout.root, &current, &wanted, &layout.store)?;
            layout.write_head(target.as_deref().unwrap_or_default())
        })
        .await?;

        tracing::info!("reset working tree to {}", name.unwrap_or("the empty tree"));
        self.active = active;
        Ok(())
    }

    /// Starts snapshot `name` over from the latest state of the active snapshot and makes it
    /// active, dropping whatever it recorded before. The working tree is left as it is.
    ///
    /// Restarting the active snapshot keeps its base. A snapshot that does not exist yet is
    /// created.
    pub async fn restart_snapshot(&mut self, name: &str) -> DlrootfsResult<()> {
        validate_snapshot_name(name)?;

        let layout = self.layout.clone();
        let active = self.active.clone();
        let name = name.to_string();
        let restarted = name.clone();

        blocking(move || {
            let existing = layout.read_snapshot(&name)?;
            let base = match (&active, &existing) {
                (Some(active), Some(existing)) if *active == name => existing.base.clone(),
                (Some(active), _) => layout.require_snapshot(active)?.head().cloned(),
                (None, _) => None,
            };
            let existed = existing.is_some();

            let info = SnapshotInfo {
                name: name.clone(),
                base,
                tip: None,
                commits: 0,
                created_at: Utc::now(),
            };

            layout.write_snapshot(&info)?;
            if !existed {
                layout.append_order(&name)?;
            }

            layout.write_head(&name)
        })
        .await?;

        tracing::info!("restarted snapshot {restarted}");
        self.active = Some(restarted);
        Ok(())
    }

    /// Records every change in the working tree, deletions included, as a commit on the
    /// active snapshot.
    ///
    /// When nothing changed since the snapshot's latest state no commit is recorded and
    /// `None` is returned.
    pub async fn commit_all(&mut self, message: &str) -> DlrootfsResult<Option<ObjectHash>> {
        let active = self
            .active
            .clone()
            .ok_or(RepositoryError::NoActiveSnapshot)?;
        let layout = self.layout.clone();
        let message = message.to_string();

        blocking(move || {
            let mut info = layout.require_snapshot(&active)?;
            let previous = info.head().cloned();
            let previous_tree = match &previous {
                Some(hash) => layout.commit_tree(hash)?,
                None => Tree::default(),
            };

            let tree = Tree::scan(&layout.root, None)?;
            if tree == previous_tree {
                tracing::debug!("nothing to commit on {active}");
                return Ok(None);
            }

            tree.store_contents(&layout.root, &layout.store)?;
            let tree_hash = layout.store.write_json(&tree)?;

            let commit = Commit {
                tree: tree_hash,
                parent: previous,
                snapshot: active.clone(),
                message,
                created_at: Utc::now(),
            };
            let hash = layout.store.write_json(&commit)?;

            info.tip = Some(hash.clone());
            info.commits += 1;
            layout.write_snapshot(&info)?;

            tracing::info!("committed {} on {active} ({} paths)", hash.short(), tree.len());
            Ok(Some(hash))
        })
        .await
    }

    /// Lists snapshot names in creation order.
    pub async fn snapshots(&self) -> DlrootfsResult<Vec<String>> {
        let layout = self.layout.clone();
        blocking(move || layout.read_order()).await
    }

    /// Returns what is recorded about snapshot `name`.
    pub async fn snapshot_info(&self, name: &str) -> DlrootfsResult<SnapshotInfo> {
        let layout = self.layout.clone();
        let name = name.to_string();
        blocking(move || layout.require_snapshot(&name)).await
    }

    /// Reads the commit with `hash`.
    pub async fn read_commit(&self, hash: &ObjectHash) -> DlrootfsResult<Commit> {
        let layout = self.layout.clone();
        let hash = hash.clone();
        blocking(move || layout.read_commit(&hash)).await
    }

    /// Returns the tree recorded by `commit`, or the empty tree for `None`.
    pub async fn tree_at(&self, commit: Option<&ObjectHash>) -> DlrootfsResult<Tree> {
        let Some(commit) = commit.cloned() else {
            return Ok(Tree::default());
        };

        let layout = self.layout.clone();
        blocking(move || layout.commit_tree(&commit)).await
    }

    /// Records the current working tree without storing anything.
    pub async fn scan_working_tree(&self) -> DlrootfsResult<Tree> {
        let root = self.layout.root.clone();
        blocking(move || Tree::scan(&root, None)).await
    }

    /// Deletes the metadata directory, leaving the working tree as a plain directory.
    pub async fn remove_metadata(self) -> DlrootfsResult<()> {
        let meta_dir = self.layout.meta_dir;
        tokio::fs::remove_dir_all(&meta_dir)
            .await
            .map_err(|e| RepositoryError::io("failed to remove snapshot metadata", e))?;

        tracing::debug!("removed snapshot metadata {}", meta_dir.display());
        Ok(())
    }
}

impl SnapshotInfo {
    /// The latest state of the snapshot: its tip, or the commit it started from.
    pub fn head(&self) -> Option<&ObjectHash> {
        self.tip.as_ref().or(self.base.as_ref())
    }
}

impl Layout {
    fn new(root: PathBuf) -> Self {
        let meta_dir = root.join(SNAPSHOT_METADATA_DIR);
        let store = ObjectStore::new(meta_dir.join(OBJECTS_SUBDIR));
        Self {
            root,
            meta_dir,
            store,
        }
    }

    fn init(&self) -> DlrootfsResult<()> {
        match fs::metadata(&self.root) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(RepositoryError::Unusable(self.root.clone()).into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => return Err(RepositoryError::Unusable(self.root.clone()).into()),
        }

        fs::create_dir_all(self.meta_dir.join(OBJECTS_SUBDIR))
            .and_then(|_| fs::create_dir_all(self.meta_dir.join(SNAPSHOTS_SUBDIR)))
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::NotADirectory => {
                    DlrootfsError::from(RepositoryError::Unusable(self.root.clone()))
                }
                _ => RepositoryError::io("failed to initialize repository", e).into(),
            })
    }

    fn read_head(&self) -> DlrootfsResult<Option<String>> {
        match fs::read_to_string(self.meta_dir.join(HEAD_FILENAME)) {
            Ok(head) => {
                let head = head.trim();
                Ok((!head.is_empty()).then(|| head.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepositoryError::io("failed to read HEAD", e).into()),
        }
    }

    fn write_head(&self, name: &str) -> DlrootfsResult<()> {
        self.write_atomic(HEAD_FILENAME.as_ref(), name.as_bytes())
    }

    fn read_order(&self) -> DlrootfsResult<Vec<String>> {
        match fs::read_to_string(self.meta_dir.join(SNAPSHOT_ORDER_FILENAME)) {
            Ok(order) => Ok(order.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RepositoryError::io("failed to read snapshot order", e).into()),
        }
    }

    fn append_order(&self, name: &str) -> DlrootfsResult<()> {
        let mut order = self.read_order()?;
        order.push(name.to_string());

        let mut contents = order.join("\n");
        contents.push('\n');
        self.write_atomic(SNAPSHOT_ORDER_FILENAME.as_ref(), contents.as_bytes())
    }

    fn snapshot_record_path(&self, name: &str) -> PathBuf {
        Path::new(SNAPSHOTS_SUBDIR).join(format!("{name}.json"))
    }

    fn read_snapshot(&self, name: &str) -> DlrootfsResult<Option<SnapshotInfo>> {
        let path = self.meta_dir.join(self.snapshot_record_path(name));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepositoryError::io(format!("failed to read snapshot {name}"), e).into()),
        }
    }

    fn require_snapshot(&self, name: &str) -> DlrootfsResult<SnapshotInfo> {
        self.read_snapshot(name)?
            .ok_or_else(|| RepositoryError::SnapshotNotFound(name.to_string()).into())
    }

    fn write_snapshot(&self, info: &SnapshotInfo) -> DlrootfsResult<()> {
        let bytes = serde_json::to_vec_pretty(info)?;
        self.write_atomic(&self.snapshot_record_path(&info.name), &bytes)
    }

    fn read_commit(&self, hash: &ObjectHash) -> DlrootfsResult<Commit> {
        self.store.read_json(hash)
    }

    fn commit_tree(&self, hash: &ObjectHash) -> DlrootfsResult<Tree> {
        let commit = self.read_commit(hash)?;
        self.store.read_json(&commit.tree)
    }

    fn snapshot_tree(&self, info: &SnapshotInfo) -> DlrootfsResult<Tree> {
        match info.head() {
            Some(hash) => self.commit_tree(hash),
            None => Ok(Tree::default()),
        }
    }

    fn write_atomic(&self, relative: &Path, bytes: &[u8]) -> DlrootfsResult<()> {
        use std::io::Write;

        let dest = self.meta_dir.join(relative);
        let context = format!("failed to write {}", dest.display());
        let dir = dest.parent().unwrap_or(&self.meta_dir);

        let mut staged =
            NamedTempFile::new_in(dir).map_err(|e| RepositoryError::io(context.clone(), e))?;
        staged
            .write_all(bytes)
            .map_err(|e| RepositoryError::io(context.clone(), e))?;
        staged
            .persist(&dest)
            .map_err(|e| RepositoryError::io(context, e.error))?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `name` can be used as a snapshot name.
///
/// ## Examples
///
/// ```
/// use dlrootfs::snapshot::validate_snapshot_name;
///
/// assert!(validate_snapshot_name("layer_0_sha256_abc").is_ok());
/// assert!(validate_snapshot_name("a/b").is_err());
/// assert!(validate_snapshot_name("..").is_err());
/// ```
pub fn validate_snapshot_name(name: &str) -> DlrootfsResult<()> {
    let invalid = name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']);
    if invalid {
        return Err(RepositoryError::InvalidSnapshotName(name.to_string()).into());
    }

    Ok(())
}

async fn blocking<T, F>(f: F) -> DlrootfsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DlrootfsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_open_is_idempotent() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("rootfs");

        let mut repo = SnapshotRepository::open(&root).await?;
        assert!(root.join(SNAPSHOT_METADATA_DIR).is_dir());
        assert_eq!(repo.active_snapshot(), None);

        assert!(repo.switch_or_create("layer_0").await?);
        drop(repo);

        let repo = SnapshotRepository::open(&root).await?;
        assert_eq!(repo.active_snapshot(), Some("layer_0"));
        assert_eq!(repo.snapshots().await?, vec!["layer_0"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_open_rejects_file() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("not-a-dir");
        fs::write(&file, "")?;

        let result = SnapshotRepository::open(&file).await;
        assert!(matches!(
            result,
            Err(DlrootfsError::Repository(RepositoryError::Unusable(_)))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_commit_all_tracks_deletions() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;

        repo.switch_or_create("s0").await?;
        fs::write(temp.path().join("a"), "a")?;
        fs::write(temp.path().join("b"), "b")?;
        let first = repo.commit_all("add a and b").await?.expect("first commit");

        fs::remove_file(temp.path().join("b"))?;
        let second = repo.commit_all("remove b").await?.expect("second commit");

        let commit = repo.read_commit(&second).await?;
        assert_eq!(commit.get_parent(), &Some(first));
        assert_eq!(commit.get_snapshot(), "s0");

        let tree = repo.tree_at(Some(&second)).await?;
        assert!(tree.get("a").is_some());
        assert!(tree.get("b").is_none());

        let info = repo.snapshot_info("s0").await?;
        assert_eq!(*info.get_commits(), 2);
        assert_eq!(info.get_tip(), &Some(second));
        assert_eq!(info.get_base(), &None);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_empty_commit_is_noop() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;

        repo.switch_or_create("s0").await?;
        assert_eq!(repo.commit_all("nothing").await?, None);

        fs::write(temp.path().join("a"), "a")?;
        assert!(repo.commit_all("add a").await?.is_some());
        assert_eq!(repo.commit_all("again").await?, None);

        repo.switch_or_create("s1").await?;
        assert_eq!(repo.commit_all("inherits s0").await?, None);

        assert_eq!(*repo.snapshot_info("s0").await?.get_commits(), 1);
        assert_eq!(*repo.snapshot_info("s1").await?.get_commits(), 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_empty_commit_stores_nothing() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;
        let objects = temp.path().join(SNAPSHOT_METADATA_DIR).join(OBJECTS_SUBDIR);

        repo.switch_or_create("s0").await?;
        fs::write(temp.path().join("a"), "a")?;
        repo.commit_all("add a").await?;
        let stored = helper::count_files(&objects)?;

        assert_eq!(repo.commit_all("again").await?, None);
        repo.switch_or_create("s1").await?;
        assert_eq!(repo.commit_all("inherits s0").await?, None);
        assert_eq!(helper::count_files(&objects)?, stored);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_reset_discards_uncommitted() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let mut repo = SnapshotRepository::open(root).await?;

        repo.switch_or_create("s0").await?;
        fs::write(root.join("f0"), "zero")?;
        repo.commit_all("f0").await?;

        repo.switch_or_create("s1").await?;
        fs::write(root.join("f0"), "half written")?;
        fs::write(root.join("partial"), "")?;

        repo.reset_working_tree(Some("s0")).await?;
        assert_eq!(repo.active_snapshot(), Some("s0"));
        assert_eq!(fs::read_to_string(root.join("f0"))?, "zero");
        assert!(!root.join("partial").exists());

        repo.reset_working_tree(None).await?;
        assert_eq!(repo.active_snapshot(), None);
        assert!(!root.join("f0").exists());
        assert!(root.join(SNAPSHOT_METADATA_DIR).is_dir());

        let repo = SnapshotRepository::open(root).await?;
        assert_eq!(repo.active_snapshot(), None);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_restart_drops_commits() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let mut repo = SnapshotRepository::open(root).await?;

        repo.switch_or_create("s0").await?;
        fs::write(root.join("f0"), "zero")?;
        let s0 = repo.commit_all("f0").await?;

        repo.switch_or_create("s1").await?;
        fs::write(root.join("f1"), "stale")?;
        repo.commit_all("stale f1").await?;

        repo.reset_working_tree(Some("s0")).await?;
        repo.restart_snapshot("s1").await?;

        let info = repo.snapshot_info("s1").await?;
        assert_eq!(repo.active_snapshot(), Some("s1"));
        assert_eq!(*info.get_commits(), 0);
        assert_eq!(info.get_base(), &s0);
        assert_eq!(info.get_tip(), &None);
        assert!(!root.join("f1").exists());

        repo.restart_snapshot("s2").await?;
        assert_eq!(repo.snapshots().await?, vec!["s0", "s1", "s2"]);
        assert_eq!(repo.snapshot_info("s2").await?.get_base(), &s0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_commit_requires_active_snapshot() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;

        let result = repo.commit_all("orphan").await;
        assert!(matches!(
            result,
            Err(DlrootfsError::Repository(RepositoryError::NoActiveSnapshot))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_switch_checks_out_existing() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let mut repo = SnapshotRepository::open(root).await?;

        assert!(repo.switch_or_create("s0").await?);
        fs::write(root.join("f0"), "zero")?;
        repo.commit_all("f0").await?;

        assert!(repo.switch_or_create("s1").await?);
        assert_eq!(
            repo.snapshot_info("s1").await?.get_base(),
            repo.snapshot_info("s0").await?.get_tip()
        );
        fs::write(root.join("f1"), "one")?;
        fs::write(root.join("f0"), "changed")?;
        repo.commit_all("f1").await?;

        assert!(!repo.switch_or_create("s0").await?);
        assert_eq!(repo.active_snapshot(), Some("s0"));
        assert_eq!(fs::read_to_string(root.join("f0"))?, "zero");
        assert!(!root.join("f1").exists());

        assert!(!repo.switch_or_create("s1").await?);
        assert_eq!(fs::read_to_string(root.join("f0"))?, "changed");
        assert_eq!(fs::read_to_string(root.join("f1"))?, "one");

        assert_eq!(repo.snapshots().await?, vec!["s0", "s1"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_switch_refuses_dirty_tree() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let mut repo = SnapshotRepository::open(root).await?;

        repo.switch_or_create("s0").await?;
        repo.switch_or_create("s1").await?;
        fs::write(root.join("uncommitted"), "")?;

        let result = repo.switch_or_create("s0").await;
        assert!(matches!(
            result,
            Err(DlrootfsError::Repository(RepositoryError::DirtyWorkingTree(_)))
        ));
        assert_eq!(repo.active_snapshot(), Some("s1"));

        // New snapshots carry uncommitted edits over.
        assert!(repo.switch_or_create("s2").await?);
        assert!(root.join("uncommitted").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_rejects_bad_names() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;

        for name in ["", ".", "..", "a/b", "nul\0"] {
            let result = repo.switch_or_create(name).await;
            assert!(matches!(
                result,
                Err(DlrootfsError::Repository(RepositoryError::InvalidSnapshotName(_)))
            ));
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_repository_remove_metadata() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mut repo = SnapshotRepository::open(temp.path()).await?;
        repo.switch_or_create("s0").await?;
        fs::write(temp.path().join("kept"), "")?;
        repo.commit_all("kept").await?;

        repo.remove_metadata().await?;
        assert!(!temp.path().join(SNAPSHOT_METADATA_DIR).exists());
        assert!(temp.path().join("kept").exists());

        Ok(())
    }

    mod helper {
        use super::*;

        pub(super) fn count_files(dir: &Path) -> anyhow::Result<usize> {
            let mut count = 0;
            for entry in walkdir::WalkDir::new(dir) {
                if entry?.file_type().is_file() {
                    count += 1;
                }
            }

            Ok(count)
        }
    }
}
