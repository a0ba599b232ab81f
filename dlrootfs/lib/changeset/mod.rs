//! Changesets: the path-level differences between two tree states, serialized as tar
//! archives where deletions are encoded as `.wh.` whiteout entries.

mod diff;
mod export;
mod stream;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use diff::*;
pub use export::*;
pub use stream::*;
