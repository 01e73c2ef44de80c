//! Concurrency primitives shared by the agents: per-tenant lock table,
//! retry backoff and process shutdown.

pub mod backoff;
pub mod keyed_lock;
pub mod shutdown;

pub use backoff::Backoff;
pub use keyed_lock::{KeyGuard, KeyedLocks};
pub use shutdown::Shutdown;
