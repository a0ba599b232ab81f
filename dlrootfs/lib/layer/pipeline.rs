use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use getset::Getters;
use tokio::{fs, io::AsyncWriteExt, sync::mpsc};
use tokio_util::task::AbortOnDropHandle;
use typed_builder::TypedBuilder;

use crate::{
    changeset::ChangesetExporter,
    snapshot::{SnapshotInfo, SnapshotRepository},
    utils::{self, CHANGESET_EXTENSION, LAYER_STAGING_DIR},
    DlrootfsError, DlrootfsResult, RepositoryError,
};

use super::{apply_archive, LayerId, LayerReader, LayerSource};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many layers are downloaded ahead of the one being applied, by default.
pub const DEFAULT_PREFETCH_DEPTH: usize = 2;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a [`LayerPipeline`] builds the rootfs.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PipelineConfig {
    /// Where the rootfs is produced.
    #[builder(setter(into))]
    rootfs_dir: PathBuf,

    /// Whether every layer is recorded as its own snapshot. Without layering, layers are
    /// applied directly and nothing is tracked.
    #[builder(default)]
    layering: bool,

    /// Where to write the changeset of every layer, as `<snapshot>.tar`. Needs layering.
    #[builder(default, setter(into))]
    changeset_dir: Option<PathBuf>,

    /// How many layers to download ahead of the one being applied. Zero streams each layer
    /// straight from the source while applying it.
    #[builder(default = DEFAULT_PREFETCH_DEPTH)]
    prefetch: usize,

    /// Whether to keep the snapshot metadata inside the rootfs after a successful run.
    #[builder(default = true)]
    keep_repository: bool,
}

/// Where a [`LayerPipeline`] is. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started.
    Idle,

    /// Creating the snapshot of layer `index`.
    CreateSnapshot {
        /// Position of the layer, base layer first.
        index: usize,
    },

    /// Extracting layer `index` into the working tree.
    ApplyLayerContent {
        /// Position of the layer, base layer first.
        index: usize,
    },

    /// Committing layer `index`.
    Commit {
        /// Position of the layer, base layer first.
        index: usize,
    },

    /// Writing the changeset of layer `index`.
    ExportChangeset {
        /// Position of the layer, base layer first.
        index: usize,
    },

    /// All layers applied; the working tree is the rootfs.
    Done,
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PipelineReport {
    /// The produced rootfs.
    rootfs: PathBuf,

    /// The applied layers, base layer first.
    layers: Vec<LayerId>,

    /// One snapshot per layer when layering was on.
    snapshots: Vec<String>,

    /// The exported changeset archives.
    changesets: Vec<PathBuf>,
}

/// How far a layering run matches what the repository already recorded.
#[derive(Debug, Default)]
struct Resume {
    /// The last layer snapshot taken over from an earlier run.
    parent: Option<String>,

    /// Set once a layer has to be applied; later layers are always applied too.
    diverged: bool,
}

/// Builds a rootfs by applying the layers of a [`LayerSource`] one after the other.
///
/// With layering on, every layer gets its own snapshot: the snapshot is created, the layer is
/// extracted into the working tree, and the result is committed before the next layer starts.
/// Downloads may run ahead but application is strictly sequential.
///
/// A failure stops the run and leaves the rootfs as it was at that point. Running again over the
/// same repository takes over the layers already recorded on the same chain, without checking
/// them out, and applies the rest on top of the last of them.
#[derive(Debug)]
pub struct LayerPipeline<S> {
    source: Arc<S>,
    config: PipelineConfig,
    state: PipelineState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> LayerPipeline<S>
where
    S: LayerSource + 'static,
{
    /// Creates a pipeline reading layers from `source`.
    pub fn new(source: S, config: PipelineConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            state: PipelineState::Idle,
        }
    }

    /// Where the pipeline is, or where it stopped.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Applies every layer and returns what was produced.
    pub async fn run(&mut self) -> DlrootfsResult<PipelineReport> {
        let ids = self.source.layer_ids().await?;
        let rootfs = self.config.rootfs_dir.clone();
        tracing::info!("building {} from {} layers", rootfs.display(), ids.len());

        fs::create_dir_all(&rootfs).await?;

        let mut repo = if self.config.layering {
            Some(SnapshotRepository::open(&rootfs).await?)
        } else {
            None
        };

        let changeset_dir = match (&self.config.changeset_dir, &repo) {
            (Some(dir), Some(_)) => {
                fs::create_dir_all(dir).await?;
                Some(dir.clone())
            }
            (Some(dir), None) => {
                tracing::warn!(
                    "ignoring changeset directory {} without layering",
                    dir.display()
                );
                None
            }
            (None, _) => None,
        };

        let staging = if self.config.prefetch > 0 {
            Some(
                tempfile::Builder::new()
                    .prefix(LAYER_STAGING_DIR)
                    .tempdir_in(staging_parent(&rootfs))?,
            )
        } else {
            None
        };

        let mut prefetched = staging
            .as_ref()
            .map(|dir| self.spawn_prefetch(ids.clone(), dir.path().to_path_buf()));

        let mut report = PipelineReport {
            rootfs: rootfs.clone(),
            layers: Vec::with_capacity(ids.len()),
            snapshots: Vec::new(),
            changesets: Vec::new(),
        };

        let mut resume = Resume::default();

        for (index, id) in ids.iter().enumerate() {
            let (reader, staged): (LayerReader, Option<PathBuf>) = match &mut prefetched {
                Some((rx, _)) => {
                    let path = rx.recv().await.ok_or_else(|| {
                        DlrootfsError::custom(anyhow::anyhow!("prefetch of layer {id} stopped"))
                    })??;
                    let reader: LayerReader = Box::pin(fs::File::open(&path).await?);
                    (reader, Some(path))
                }
                None => (self.source.fetch_layer(id).await?, None),
            };

            let layer = (index, id);
            match repo.as_mut() {
                Some(repo) => {
                    let dir = changeset_dir.as_deref();
                    self.record_layer(layer, reader, repo, &mut resume, dir, &mut report)
                        .await?
                }
                None => self.apply_layer(layer, reader, &mut report).await?,
            }

            if let Some(path) = staged {
                fs::remove_file(&path).await?;
            }
        }

        drop(prefetched);

        if let Some(mut repo) = repo {
            // Every layer was taken over; the working tree may still be elsewhere.
            if !resume.diverged && repo.active_snapshot() != resume.parent.as_deref() {
                repo.reset_working_tree(resume.parent.as_deref()).await?;
            }

            if !self.config.keep_repository {
                repo.remove_metadata().await?;
            }
        }

        self.state = PipelineState::Done;
        tracing::info!("rootfs ready at {}", rootfs.display());

        Ok(report)
    }

    async fn apply_layer(
        &mut self,
        (index, id): (usize, &LayerId),
        reader: LayerReader,
        report: &mut PipelineReport,
    ) -> DlrootfsResult<()> {
        self.state = PipelineState::ApplyLayerContent { index };
        tracing::info!("applying layer {index} ({id})");
        apply_archive(reader, &self.config.rootfs_dir, id.as_str()).await?;

        report.layers.push(id.clone());
        Ok(())
    }

    async fn record_layer(
        &mut self,
        (index, id): (usize, &LayerId),
        reader: LayerReader,
        repo: &mut SnapshotRepository,
        resume: &mut Resume,
        changeset_dir: Option<&Path>,
        report: &mut PipelineReport,
    ) -> DlrootfsResult<()> {
        self.state = PipelineState::CreateSnapshot { index };
        let name = snapshot_name(index, id);
        let existing = match repo.snapshot_info(&name).await {
            Ok(info) => Some(info),
            Err(DlrootfsError::Repository(RepositoryError::SnapshotNotFound(_))) => None,
            Err(e) => return Err(e),
        };

        if !resume.diverged {
            if is_recorded_on(repo, existing.as_ref(), resume.parent.as_deref()).await? {
                tracing::info!("layer {index} ({id}) already recorded in {name}, skipping");
                drain(reader).await?;
                return self
                    .finish_layer((index, id), name, repo, resume, changeset_dir, report)
                    .await;
            }

            resume.diverged = true;
            if repo.active_snapshot().is_some() || resume.parent.is_some() {
                repo.reset_working_tree(resume.parent.as_deref()).await?;
            }
        }

        if existing.is_some() {
            repo.restart_snapshot(&name).await?;
        } else {
            repo.switch_or_create(&name).await?;
        }

        self.state = PipelineState::ApplyLayerContent { index };
        tracing::info!("applying layer {index} ({id}) as {name}");
        apply_archive(reader, repo.root(), id.as_str()).await?;

        self.state = PipelineState::Commit { index };
        repo.commit_all(&format!("layer {index}: {id}")).await?;

        self.finish_layer((index, id), name, repo, resume, changeset_dir, report)
            .await
    }

    async fn finish_layer(
        &mut self,
        (index, id): (usize, &LayerId),
        name: String,
        repo: &SnapshotRepository,
        resume: &mut Resume,
        changeset_dir: Option<&Path>,
        report: &mut PipelineReport,
    ) -> DlrootfsResult<()> {
        if let Some(dir) = changeset_dir {
            self.state = PipelineState::ExportChangeset { index };
            let path = dir.join(format!("{name}.{CHANGESET_EXTENSION}"));
            export_changeset(repo, &name, &path).await?;
            report.changesets.push(path);
        }

        resume.parent = Some(name.clone());
        report.layers.push(id.clone());
        report.snapshots.push(name);
        Ok(())
    }

    /// Downloads layers into `staging` ahead of the applier, keeping at most `prefetch`
    /// finished downloads waiting.
    fn spawn_prefetch(
        &self,
        ids: Vec<LayerId>,
        staging: PathBuf,
    ) -> (mpsc::Receiver<DlrootfsResult<PathBuf>>, AbortOnDropHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.prefetch.max(1));
        let source = Arc::clone(&self.source);

        let handle = tokio::spawn(async move {
            for (index, id) in ids.into_iter().enumerate() {
                let path = staging.join(format!("{index}.layer"));
                let result = stage_layer(source.as_ref(), &id, &path).await;
                let failed = result.is_err();

                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        (rx, AbortOnDropHandle::new(handle))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The snapshot name of layer `id` at position `index`.
///
/// ## Examples
///
/// ```
/// use dlrootfs::layer::{snapshot_name, LayerId};
///
/// assert_eq!(
///     snapshot_name(0, &LayerId::new("sha256:abc")),
///     "layer_0_sha256_abc"
/// );
/// ```
pub fn snapshot_name(index: usize, id: &LayerId) -> String {
    format!("layer_{index}_{}", utils::sanitize_name_for_path(id.as_str()))
}

async fn stage_layer<S: LayerSource + ?Sized>(
    source: &S,
    id: &LayerId,
    path: &Path,
) -> DlrootfsResult<PathBuf> {
    tracing::debug!("prefetching layer {id}");
    let mut reader = source.fetch_layer(id).await?;
    let mut file = fs::File::create(path).await?;
    tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;

    Ok(path.to_path_buf())
}

async fn export_changeset(
    repo: &SnapshotRepository,
    name: &str,
    path: &Path,
) -> DlrootfsResult<()> {
    let mut stream = ChangesetExporter::new(repo)
        .export_snapshot_changeset(name)
        .await?;
    let entries = stream.len();

    let mut file = fs::File::create(path).await?;
    tokio::io::copy(&mut stream, &mut file)
        .await
        .map_err(DlrootfsError::ArchiveWrite)?;
    file.flush().await?;
    stream.finish().await?;

    tracing::info!(
        "wrote changeset of {name} ({entries} entries) to {}",
        path.display()
    );
    Ok(())
}

/// Whether `existing` holds a finished layer stacked on the latest state of `parent`.
async fn is_recorded_on(
    repo: &SnapshotRepository,
    existing: Option<&SnapshotInfo>,
    parent: Option<&str>,
) -> DlrootfsResult<bool> {
    let Some(existing) = existing else {
        return Ok(false);
    };

    let expected_base = match parent {
        Some(parent) => repo.snapshot_info(parent).await?.head().cloned(),
        None => None,
    };

    Ok(*existing.get_commits() > 0 && *existing.get_base() == expected_base)
}

async fn drain(mut reader: LayerReader) -> DlrootfsResult<()> {
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(())
}

/// Staged downloads go next to the rootfs, never inside it.
fn staging_parent(rootfs: &Path) -> PathBuf {
    match rootfs.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
