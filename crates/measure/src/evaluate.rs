//! Timing a built module against live session buffers.

use graphforge_builder::Module;
use graphforge_graph::TensorBuffer;
use std::sync::Arc;
use std::time::Instant;

/// Run `module`'s entry function once over `buffers` and return the
/// elapsed wall time in milliseconds. Any failure (missing function,
/// kernel error) returns a non-positive sentinel so callers can treat
/// the artifact as unrunnable.
pub fn evaluate_performance(module: &Module, name: &str, buffers: &[Arc<TensorBuffer>]) -> f64 {
    let Some(func) = module.get_function(name) else {
        tracing::warn!(%name, module = %module.name(), "module has no such function");
        return -1.0;
    };
    let start = Instant::now();
    match func(buffers) {
        Ok(()) => {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
            // Clamp to a representable positive duration; a sub-tick
            // elapsed time must not read as failure.
            elapsed_ms.max(1e-6)
        }
        Err(error) => {
            tracing::debug!(%name, %error, "evaluation run failed");
            -1.0
        }
    }
}
