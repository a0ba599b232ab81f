use std::path::PathBuf;

use clap::Parser;

use crate::{
    cli::styles,
    layer::DEFAULT_PREFETCH_DEPTH,
    oci::{Credentials, ImageReference},
    utils::DEFAULT_ROOTFS_DIR,
};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `dlrootfs` downloads the layers of a Docker Hub image and reconstructs its root filesystem
#[derive(Debug, Parser)]
#[command(name = "dlrootfs", author, disable_version_flag = true, styles=styles::styles())]
pub struct DlrootfsArgs {
    /// Image to download, e.g. `ubuntu:22.04` or `library/alpine`
    #[arg(short, long, value_name = "IMAGE")]
    pub image: Option<ImageReference>,

    /// Directory the rootfs is reconstructed in
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_ROOTFS_DIR)]
    pub destination: PathBuf,

    /// Docker Hub credentials as `<username>:<password>`
    #[arg(short = 'u', long, value_name = "USER:PASS")]
    pub credentials: Option<Credentials>,

    /// Record every layer as a snapshot
    #[arg(short = 'g', long)]
    pub layering: bool,

    /// Write the changeset of every layer snapshot to this directory, requires `--layering`
    #[arg(long, value_name = "DIR", requires = "layering")]
    pub export_changesets: Option<PathBuf>,

    /// Number of layers downloaded ahead of the one being applied, 0 disables prefetching
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PREFETCH_DEPTH)]
    pub prefetch: usize,

    /// Remove the snapshot repository once the rootfs is complete
    #[arg(long, requires = "layering")]
    pub discard_snapshots: bool,

    /// Enable verbose logging
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Show version
    #[arg(short = 'v', long)]
    pub version: bool,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
