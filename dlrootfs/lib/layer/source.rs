use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::{utils, DlrootfsError, DlrootfsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The content of one layer: a plain or gzip-compressed tar stream.
pub type LayerReader = Pin<Box<dyn AsyncRead + Send>>;

/// The unique identifier of a layer, usually its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

/// Layer archives read from local files, in the order they were added.
#[derive(Debug, Default, Clone)]
pub struct ArchiveLayerSource {
    layers: Vec<(LayerId, PathBuf)>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Something that knows the ordered layers of an image and can stream each one.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Lists the layer identifiers, base layer first.
    async fn layer_ids(&self) -> DlrootfsResult<Vec<LayerId>>;

    /// Opens the content of layer `id`.
    async fn fetch_layer(&self, id: &LayerId) -> DlrootfsResult<LayerReader>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerId {
    /// Creates a new layer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ArchiveLayerSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer archive under `id`.
    pub fn push(&mut self, id: LayerId, path: impl Into<PathBuf>) {
        self.layers.push((id, path.into()));
    }

    /// Creates a source from archive files, identifying each by the sha256 of its content.
    pub async fn from_paths(
        paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> DlrootfsResult<Self> {
        let mut source = Self::new();
        for path in paths {
            let path = path.as_ref().to_path_buf();
            let hashed = path.clone();
            let digest = tokio::task::spawn_blocking(move || utils::get_file_hash(&hashed)).await??;

            source.push(LayerId::new(format!("sha256:{digest}")), path);
        }

        Ok(source)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[async_trait]
impl LayerSource for ArchiveLayerSource {
    async fn layer_ids(&self) -> DlrootfsResult<Vec<LayerId>> {
        Ok(self.layers.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn fetch_layer(&self, id: &LayerId) -> DlrootfsResult<LayerReader> {
        let (_, path) = self
            .layers
            .iter()
            .find(|(layer, _)| layer == id)
            .ok_or_else(|| DlrootfsError::LayerNotFound(id.to_string()))?;

        let file = tokio::fs::File::open(path).await?;
        Ok(Box::pin(file))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
