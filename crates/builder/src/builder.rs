//! The pooled function builder.

use crate::codegen::Codegen;
use crate::module::Module;
use anyhow::Result;
use graphforge_graph::Target;
use graphforge_pool::{LogSink, Priority, SharedFuture, WorkerPool};
use graphforge_space::RealizedSchedule;
use std::sync::Arc;

/// Thread-pool-backed compiler front end.
///
/// `build_for` queues compilation and returns a future; emergency
/// priority jumps the pool's queue head. `build_func` is the blocking
/// variant used when a session preloads reference schedules.
pub struct FunctionBuilder {
    pool: WorkerPool,
    codegen: Arc<dyn Codegen>,
    log: Option<Arc<LogSink>>,
}

impl FunctionBuilder {
    pub fn new(parallel: usize, codegen: Arc<dyn Codegen>, log: Option<Arc<LogSink>>) -> Self {
        Self {
            pool: WorkerPool::new("build", parallel),
            codegen,
            log,
        }
    }

    pub fn build_for(
        &self,
        schedule: RealizedSchedule,
        target_device: Target,
        _target_host: Target,
        name: String,
        priority: Priority,
    ) -> (RealizedSchedule, SharedFuture<Module>) {
        let codegen = Arc::clone(&self.codegen);
        let log = self.log.clone();
        let job_schedule = schedule.clone();
        let future = self.pool.submit(priority, move || {
            if let Some(log) = &log {
                log.line(format!("build {name} for {target_device}"));
            }
            let result = codegen.compile(&job_schedule, &target_device, &name);
            if let Err(error) = &result {
                if let Some(log) = &log {
                    log.line(format!("build {name} failed: {error:#}"));
                }
                tracing::debug!(%name, %error, "compile failed");
            }
            result
        });
        (schedule, future)
    }

    /// Compile synchronously on the caller's thread.
    pub fn build_func(
        &self,
        schedule: &RealizedSchedule,
        target_device: &Target,
        _target_host: &Target,
        name: &str,
    ) -> Result<Module> {
        if let Some(log) = &self.log {
            log.line(format!("build {name} for {target_device} (blocking)"));
        }
        self.codegen.compile(schedule, target_device, name)
    }

    pub fn pending(&self) -> usize {
        self.pool.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::NativeCodegen;
    use graphforge_graph::{ComputeStep, DataType, Subgraph, TensorId, TensorMeta};
    use graphforge_space::{interpret, ScheduleEntity};

    fn realized() -> RealizedSchedule {
        let metas = vec![
            TensorMeta::new("x", &[2, 2], DataType::F32),
            TensorMeta::new("y", &[2, 2], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "relu".into(),
            steps: vec![ComputeStep::Relu {
                src: TensorId(0),
                dst: TensorId(1),
            }],
            inputs: vec![TensorId(0)],
            labels: vec![],
            outputs: vec![TensorId(1)],
            weights: vec![],
            loss: None,
            gradients: vec![],
            lr: None,
            updates: vec![],
            tag: String::new(),
            gflop: 0.0,
        };
        sg.tag = sg.compute_tag(&metas);
        let entity = ScheduleEntity {
            tile_m: 1,
            tile_n: 1,
            tile_k: 1,
            vector_width: 1,
            unroll: 1,
            fuse: false,
        };
        interpret(&sg, &metas, &Target::llvm(0), &entity).unwrap()
    }

    #[test]
    fn test_build_for_resolves_module() {
        let builder = FunctionBuilder::new(2, Arc::new(NativeCodegen), None);
        let (schedule, future) = builder.build_for(
            realized(),
            Target::llvm(0),
            Target::llvm(0),
            "subgraph_3".into(),
            Priority::Normal,
        );
        let module = future.wait().unwrap();
        assert_eq!(module.name(), "subgraph_3");
        assert_eq!(schedule.plan.steps.len(), 1);
    }

    #[test]
    fn test_build_func_blocking() {
        let builder = FunctionBuilder::new(1, Arc::new(NativeCodegen), None);
        let module = builder
            .build_func(&realized(), &Target::llvm(0), &Target::llvm(0), "sg")
            .unwrap();
        assert!(module.get_function("sg").is_some());
    }
}
