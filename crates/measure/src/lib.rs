//! Measurement stage for graphforge: scoring candidate schedules and
//! timing built modules on the target device.

pub mod evaluate;
pub mod measure;

pub use evaluate::*;
pub use measure::*;
