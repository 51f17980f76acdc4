//! Progress reporting module
//!
//! Draws the snapshots of running operations and renders their final
//! outcome as text.

mod reporter;
mod summary;

pub use reporter::*;
pub use summary::*;
