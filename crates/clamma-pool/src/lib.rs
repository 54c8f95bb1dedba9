//! Process-wide matmul worker pool (spec component D): a bounded job ring
//! drained by a fixed number of persistent OS threads, with row-band
//! dispatch and per-call completion sync.

mod error;
mod job;
mod pool;

pub use error::{PoolError, Result};
pub use pool::{DispatchHandle, WorkerPool};
