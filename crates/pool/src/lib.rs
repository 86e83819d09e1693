//! Concurrency primitives shared by the autoscheduler and the builder:
//! a worker pool with a priority lane, fulfill-once futures, and the
//! append-mode log sinks the session components write to.

pub mod future;
pub mod log;
pub mod pool;

pub use future::*;
pub use log::*;
pub use pool::*;
