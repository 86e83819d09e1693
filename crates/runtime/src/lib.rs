//! The graphforge runtime: tuning sessions that hide schedule search,
//! compilation, and measurement behind execution.

pub mod config;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod tables;

pub use config::*;
pub use registry::*;
pub use session::*;
pub use tables::*;
