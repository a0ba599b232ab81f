//! Image references and the Docker Hub registry client.

mod docker;
mod reference;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use docker::*;
pub use reference::*;
