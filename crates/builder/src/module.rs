//! Loadable modules and their entry functions.

use anyhow::Result;
use graphforge_graph::TensorBuffer;
use std::sync::Arc;

/// An entry function: binds tensor buffers positionally in the
/// subgraph's canonical argument order.
pub type Callable = Arc<dyn Fn(&[Arc<TensorBuffer>]) -> Result<()> + Send + Sync>;

/// A compiled module exposing one named entry function.
#[derive(Clone)]
pub struct Module {
    name: String,
    entry: Callable,
}

impl Module {
    pub fn new(name: impl Into<String>, entry: Callable) -> Self {
        Self {
            name: name.into(),
            entry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the entry function by name. A miss means the pipeline
    /// asked for a function the module does not export.
    pub fn get_function(&self, name: &str) -> Option<Callable> {
        (self.name == name).then(|| Arc::clone(&self.entry))
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("name", &self.name).finish()
    }
}
