//! Object storage module
//!
//! Defines the [`ObjectStore`] seam, an in-memory implementation, the
//! listing enumerator, and the native S3 backend behind the `native_s3`
//! feature.

mod listing;
mod memory;
mod object_store;
mod url;

#[cfg(feature = "native_s3")]
mod native_s3;

pub use listing::*;
pub use memory::*;
pub use object_store::*;
pub use url::*;

#[cfg(feature = "native_s3")]
pub use native_s3::*;
