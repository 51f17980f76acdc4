//! File system module
//!
//! Provides the local tree walk with content hashing and the small set of
//! filesystem operations the transfer layer needs.

mod operations;
mod scanner;

pub use operations::*;
pub use scanner::*;
