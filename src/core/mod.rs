//! Execution primitives shared by every remote operation
//!
//! - [`BoundedRetryExecutor`]: global concurrency cap plus fixed-delay retry
//! - [`CancelFlag`]: cooperative cancellation observed at suspension points
//! - [`TaskHandle`]: observable handle returned by every public operation

mod cancel;
mod executor;
mod handle;

pub use cancel::*;
pub use executor::*;
pub use handle::*;
