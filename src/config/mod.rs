//! Configuration module for BucketSync
//!
//! Provides client-wide settings, per-operation options, CLI arguments,
//! and config file loading.

mod settings;

pub use settings::*;
