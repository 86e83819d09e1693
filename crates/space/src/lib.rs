//! Schedule search space for graphforge: entities, sampling, and the
//! interpreter that realizes an entity into a loop plan.

pub mod entity;
pub mod feature;
pub mod interpret;
pub mod space;

pub use entity::*;
pub use feature::*;
pub use interpret::*;
pub use space::*;
