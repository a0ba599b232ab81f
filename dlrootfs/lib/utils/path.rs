//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory inside a repository root where snapshot metadata is kept.
///
/// Everything under it is invisible to diffs and changesets.
pub const SNAPSHOT_METADATA_DIR: &str = ".dlrootfs-snapshots";

/// The sub directory of the metadata directory holding content-addressed objects.
pub const OBJECTS_SUBDIR: &str = "objects";

/// The sub directory of the metadata directory holding one record per snapshot.
pub const SNAPSHOTS_SUBDIR: &str = "snapshots";

/// The file naming the active snapshot.
pub const HEAD_FILENAME: &str = "HEAD";

/// The file listing snapshot names in creation order.
pub const SNAPSHOT_ORDER_FILENAME: &str = "order";

/// The sub directory of a destination where prefetched layers are staged.
pub const LAYER_STAGING_DIR: &str = ".dlrootfs-staging";

/// Default destination of the produced rootfs.
pub const DEFAULT_ROOTFS_DIR: &str = "./rootfs";

/// The extension used for exported changeset archives.
pub const CHANGESET_EXTENSION: &str = "tar";

/// The prefix marking a union filesystem whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The whiteout that hides every lower-layer entry of its directory.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Replaces characters that are awkward in file names (`:` and `/`) with `_`.
///
/// ## Examples
///
/// ```
/// use dlrootfs::utils::sanitize_name_for_path;
///
/// assert_eq!(sanitize_name_for_path("sha256:abc"), "sha256_abc");
/// assert_eq!(sanitize_name_for_path("library/alpine"), "library_alpine");
/// ```
pub fn sanitize_name_for_path(name: &str) -> String {
    name.replace([':', '/'], "_")
}

/// Returns the whiteout name that deletes `path`: its parent joined with `.wh.<basename>`.
///
/// ## Examples
///
/// ```
/// use dlrootfs::utils::whiteout_path;
///
/// assert_eq!(whiteout_path("etc/motd"), "etc/.wh.motd");
/// assert_eq!(whiteout_path("f1"), ".wh.f1");
/// ```
pub fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, name)) => format!("{parent}/{WHITEOUT_PREFIX}{name}"),
        None => format!("{WHITEOUT_PREFIX}{path}"),
    }
}
