use crate::{
    snapshot::{SnapshotRepository, Tree},
    DlrootfsError, DlrootfsResult, RepositoryError,
};

use super::{diff_trees, ChangeEntry, ChangesetStream, ContentSource};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Computes the changes a snapshot or the live working tree introduces and serializes them as
/// tar archives with union filesystem whiteouts.
///
/// The exporter holds nothing but a reference to the repository.
#[derive(Debug, Clone, Copy)]
pub struct ChangesetExporter<'a> {
    repo: &'a SnapshotRepository,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a> ChangesetExporter<'a> {
    /// Creates an exporter over `repo`.
    pub fn new(repo: &'a SnapshotRepository) -> Self {
        Self { repo }
    }

    /// The changes snapshot `name` made on top of the commit it started from.
    ///
    /// A snapshot without a parent commit is compared against the empty tree.
    pub async fn snapshot_changes(&self, name: &str) -> DlrootfsResult<Vec<ChangeEntry>> {
        let info = self.repo.snapshot_info(name).await.map_err(resolve_error)?;

        let old = self
            .repo
            .tree_at(info.get_base().as_ref())
            .await
            .map_err(resolve_error)?;
        let new = self.repo.tree_at(info.head()).await.map_err(resolve_error)?;

        Ok(diff_trees(&old, &new, ContentSource::Store(self.repo.store())))
    }

    /// The changes in the working tree, committed or not, relative to the latest commit of
    /// the active snapshot.
    pub async fn working_tree_changes(&self) -> DlrootfsResult<Vec<ChangeEntry>> {
        let active = self
            .repo
            .active_snapshot()
            .ok_or_else(|| resolve_error(RepositoryError::NoActiveSnapshot.into()))?;

        let info = self.repo.snapshot_info(active).await.map_err(resolve_error)?;
        let old: Tree = self.repo.tree_at(info.head()).await.map_err(resolve_error)?;
        let new = self.repo.scan_working_tree().await?;

        Ok(diff_trees(
            &old,
            &new,
            ContentSource::WorkingTree(self.repo.root()),
        ))
    }

    /// Streams the changeset of snapshot `name` as a tar archive.
    pub async fn export_snapshot_changeset(&self, name: &str) -> DlrootfsResult<ChangesetStream> {
        let changes = self.snapshot_changes(name).await?;
        tracing::debug!("exporting {} changes of snapshot {name}", changes.len());
        Ok(ChangesetStream::spawn(changes))
    }

    /// Streams the working tree changeset as a tar archive.
    pub async fn export_working_tree_changeset(&self) -> DlrootfsResult<ChangesetStream> {
        let changes = self.working_tree_changes().await?;
        tracing::debug!("exporting {} working tree changes", changes.len());
        Ok(ChangesetStream::spawn(changes))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Turns a failure to resolve one side of a diff into a [`DlrootfsError::Diff`].
fn resolve_error(error: DlrootfsError) -> DlrootfsError {
    match error {
        DlrootfsError::Diff(_) => error,
        other => DlrootfsError::Diff(other.to_string()),
    }
}
