//! Content digests and checksum verification
//!
//! Object-store checksums are MD5 based and, for multipart objects, depend
//! on a part size the store does not report. This module reproduces them
//! from a single streaming pass.

mod multipart;

pub use multipart::*;
