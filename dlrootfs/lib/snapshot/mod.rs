//! Snapshot repository: a working directory with one line of commits per layer.

mod checkout;
mod object;
mod repo;
mod tree;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use object::*;
pub use repo::*;
pub use tree::*;
