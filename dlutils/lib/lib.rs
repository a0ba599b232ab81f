//! `dlutils` is a library containing general utilities for the dlrootfs project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod path;
pub mod term;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use path::*;
pub use term::*;
