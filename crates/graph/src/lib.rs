//! Graph data model for graphforge: tensors, subgraph bodies, and the
//! partitioned multi-graph the tuning pipeline walks.

pub mod multigraph;
pub mod subgraph;
pub mod target;
pub mod tensor;

pub use multigraph::*;
pub use subgraph::*;
pub use target::*;
pub use tensor::*;
