//! Object transfers
//!
//! Provides single-object movement between local files and the store:
//! - Single-request and multipart uploads with per-part retry
//! - Streaming downloads verified against the store checksum
//! - Batched deletes of key lists and whole prefixes

mod delete;
mod download;
mod executor;
mod task;
mod upload;

pub use delete::*;
pub use executor::TransferExecutor;
pub use task::*;
