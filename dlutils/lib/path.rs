//! `dlutils::path` is a module containing path utilities for the dlrootfs project.

use std::path::Path;

use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

use crate::{DlutilsError, DlutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes the name of an archive member into a path relative to the extraction root.
///
/// Rules:
/// - A leading `/` is dropped; archive members always land under the extraction root
/// - `.` components and redundant separators are removed
/// - `..` resolves against the components seen so far and may not climb above the root
/// - The root itself normalizes to an empty path
///
/// ## Examples
///
/// ```
/// use dlutils::normalize_archive_path;
///
/// assert_eq!(normalize_archive_path("./etc//passwd").unwrap().as_str(), "etc/passwd");
/// assert_eq!(normalize_archive_path("/usr/lib/../bin/").unwrap().as_str(), "usr/bin");
/// assert!(normalize_archive_path("../etc/passwd").is_err());
/// ```
pub fn normalize_archive_path(path: &str) -> DlutilsResult<Utf8UnixPathBuf> {
    if path.is_empty() {
        return Err(DlutilsError::PathValidation(
            "archive member name cannot be empty".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(DlutilsError::PathValidation(format!(
            "archive member name contains a NUL byte: {path:?}"
        )));
    }

    let mut normalized: Vec<&str> = Vec::new();
    for component in Utf8UnixPath::new(path).components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::ParentDir => {
                if normalized.pop().is_none() {
                    return Err(DlutilsError::PathEscapesRoot(path.to_string()));
                }
            }
            Utf8UnixComponent::Normal(c) => {
                if !c.is_empty() {
                    normalized.push(c);
                }
            }
        }
    }

    Ok(Utf8UnixPathBuf::from(normalized.join("/")))
}

/// Returns a path relative to `root` as a forward-slash separated UTF-8 string.
///
/// Fails if `path` is not inside `root` or is not valid UTF-8.
pub fn relative_utf8_path(root: &Path, path: &Path) -> DlutilsResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| DlutilsError::PathEscapesRoot(path.display().to_string()))?;

    let mut segments = Vec::new();
    for component in relative.components() {
        let segment = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| DlutilsError::NonUtf8Path(path.display().to_string()))?;
        segments.push(segment);
    }

    Ok(segments.join("/"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
