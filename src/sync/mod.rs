//! Directory synchronization
//!
//! Provides the merge-diff sync between a local tree and a remote prefix:
//! - Per-step decisions from the sorted local and remote sequences
//! - A session that runs both producers and dispatches transfers and deletes

mod comparator;
mod session;

pub use comparator::*;
pub use session::*;
