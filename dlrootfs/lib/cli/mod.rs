//! Command line interface of `dlrootfs`.

mod args;
/// Terminal styles for help output and messages.
pub mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
