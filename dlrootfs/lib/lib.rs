//! `dlrootfs` reconstructs the root filesystem of a container image layer by layer.
//!
//! # Overview
//!
//! Every layer of an image is a tar archive describing changes on top of the layers below
//! it, with deletions encoded as `.wh.` whiteout entries. `dlrootfs` applies those layers in
//! order to produce a plain directory tree and, optionally, records every layer as a
//! snapshot so the changes of each layer can be exported again later.
//!
//! The crate is built from three parts:
//!
//! - [`snapshot`]: a working directory with content-addressed history, one snapshot per layer
//! - [`changeset`]: the difference between two tree states, streamed as a whiteout archive
//! - [`layer`]: layer sources and the pipeline that applies them
//!
//! Images are fetched from Docker Hub through [`oci::DockerRegistry`].
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use dlrootfs::{
//!     layer::{LayerPipeline, PipelineConfig},
//!     oci::DockerRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = DockerRegistry::new("alpine:3.20".parse()?, None);
//!     let config = PipelineConfig::builder()
//!         .rootfs_dir("./alpine")
//!         .layering(true)
//!         .build();
//!
//!     let report = LayerPipeline::new(registry, config).run().await?;
//!     println!("snapshots: {:?}", report.get_snapshots());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod error;

pub mod changeset;
pub mod cli;
pub mod layer;
pub mod oci;
pub mod snapshot;
pub mod utils;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
