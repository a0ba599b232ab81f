//! Layers: where they come from, how one is applied onto a tree, and the pipeline that
//! applies them all in order.

mod apply;
mod pipeline;
mod source;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use apply::*;
pub use pipeline::*;
pub use source::*;
