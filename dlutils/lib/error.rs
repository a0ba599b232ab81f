//! `dlutils::error` is a module containing error utilities for the dlrootfs project.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a dlutils-related operation.
pub type DlutilsResult<T> = Result<T, DlutilsError>;

/// An error raised by one of the shared utilities.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DlutilsError {
    /// The path is empty or otherwise malformed.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// The path climbs above the directory it is supposed to stay in.
    #[error("path escapes its root: {0}")]
    PathEscapesRoot(String),

    /// The path cannot be represented as UTF-8.
    #[error("path is not valid utf-8: {0}")]
    NonUtf8Path(String),

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
