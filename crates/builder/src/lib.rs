//! Compilation stage for graphforge: turns realized schedules into
//! loadable modules, either synchronously or on a pooled builder with
//! priority lanes.

pub mod builder;
pub mod codegen;
pub mod module;

pub use builder::*;
pub use codegen::*;
pub use module::*;
