use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use thiserror::Error;

use crate::oci::DockerRegistryResponseError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a dlrootfs-related operation.
pub type DlrootfsResult<T> = Result<T, DlrootfsError>;

/// An error that occurred while reconstructing a rootfs.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DlrootfsError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// Snapshot creation, switch or commit failed.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A tree reference needed for a diff could not be resolved.
    #[error("diff error: {0}")]
    Diff(String),

    /// Writing a changeset archive to its stream failed.
    #[error("archive write error: {0}")]
    ArchiveWrite(#[source] std::io::Error),

    /// A layer payload could not be applied to the working tree.
    #[error("failed to apply layer {layer}: {reason}")]
    LayerApply {
        /// The layer being applied.
        layer: String,

        /// What was wrong with the payload.
        reason: String,
    },

    /// An error from the shared utilities.
    #[error("utils error: {0}")]
    Utils(#[from] dlutils::DlutilsError),

    /// An error that occurred while (de)serializing json.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred during a Docker registry operation.
    #[error("docker registry error: {0}")]
    DockerRegistry(#[from] DockerRegistryResponseError),

    /// No manifest matched the host platform.
    #[error("manifest not found")]
    ManifestNotFound,

    /// The image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// A layer identifier was requested that the source does not know.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// An error raised by the snapshot repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The repository root exists but cannot be used as a working directory.
    #[error("path is unusable as a working directory: {0}")]
    Unusable(PathBuf),

    /// The snapshot name cannot be used.
    #[error("invalid snapshot name: {0:?}")]
    InvalidSnapshotName(String),

    /// The snapshot does not exist.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// An operation needed an active snapshot but none is checked out.
    #[error("no active snapshot")]
    NoActiveSnapshot,

    /// Switching snapshots would discard uncommitted changes.
    #[error("working tree has uncommitted changes, cannot switch to {0}")]
    DirtyWorkingTree(String),

    /// A stored object is missing or unreadable.
    #[error("corrupt object {hash}: {reason}")]
    CorruptObject {
        /// Hash of the object.
        hash: String,

        /// What went wrong.
        reason: String,
    },

    /// An I/O failure touching the repository.
    #[error("{context}: {source}")]
    Io {
        /// What the repository was doing.
        context: String,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DlrootfsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> DlrootfsError {
        DlrootfsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a `LayerApply` error for `layer`.
    pub fn layer_apply(layer: impl Into<String>, reason: impl Display) -> DlrootfsError {
        DlrootfsError::LayerApply {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }
}

impl RepositoryError {
    /// Wraps an I/O error with what the repository was doing when it happened.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> RepositoryError {
        RepositoryError::Io {
            context: context.into(),
            source,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `DlrootfsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> DlrootfsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
