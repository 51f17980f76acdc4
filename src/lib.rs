//! # BucketSync - Directory-to-Bucket Synchronization
//!
//! BucketSync keeps a local directory and an object-storage prefix in step.
//! Both sides are enumerated as sorted streams and merged, so transfers
//! start while the scan is still running.
//!
//! ## Features
//!
//! - **Checksum comparison**: Local files are hashed the way the store
//!   computes ETags, including multipart ETags with unknown part sizes
//! - **Multipart transfers**: Large uploads are split into parts that are
//!   retried independently
//! - **Verified downloads**: Every download is checked against the store's
//!   checksum before it replaces the destination file
//! - **Batched deletes**: Removed files are deleted remotely in batches of
//!   up to 1000 keys
//! - **Observable tasks**: Every operation returns a handle that reports
//!   progress, can be cancelled, and yields one terminal outcome
//!
//! ## Quick Start
//!
//! ```no_run
//! use bucketsync::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo(store: Arc<dyn ObjectStore>) -> bucketsync::Result<()> {
//! let client = SyncClient::new(store, ClientConfig::default())?;
//!
//! let handle = client.sync_up(
//!     "./site",
//!     "my-bucket",
//!     "site/",
//!     SyncOptions::new().delete_removed(true),
//! );
//! println!("{:?}", handle.progress());
//!
//! let summary = handle.wait().await?;
//! println!("Uploaded {} files", summary.uploaded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Per-file parameters
//!
//! ```no_run
//! use bucketsync::prelude::*;
//!
//! let options = SyncOptions::new().params_hook(|path, item| {
//!     if path.extension().is_some_and(|ext| ext == "tmp") {
//!         return Ok(None);
//!     }
//!     let content_type = item.key().ends_with(".html").then(|| "text/html".to_string());
//!     Ok(Some(ObjectParams { content_type, ..Default::default() }))
//! });
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod fs;
pub mod hash;
pub mod progress;
pub mod storage;
pub mod sync;
pub mod transfer;

// Re-export commonly used types
pub use client::SyncClient;
pub use config::{ClientConfig, ObjectParams, SyncOptions};
pub use error::{Result, SyncError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use bucketsync::prelude::*;
    //! ```

    pub use crate::client::SyncClient;
    pub use crate::config::{ClientConfig, ObjectParams, SyncOptions};
    pub use crate::core::{CancelFlag, Observable, TaskHandle};
    pub use crate::error::{ErrorKind, Result, SyncError};
    pub use crate::hash::{MultipartDigest, Verification};
    pub use crate::storage::{MemoryStore, ObjectStore, RemoteObjectRecord};
    pub use crate::sync::{SyncItem, SyncSummary};
    pub use crate::transfer::{DeleteSummary, Direction, TransferOutcome};
}
