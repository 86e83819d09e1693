//! Batch scoring of candidate schedules.

use anyhow::Result;
use graphforge_builder::Codegen;
use graphforge_graph::{DeviceCtx, Target, TensorBuffer};
use graphforge_space::RealizedSchedule;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Scores a batch of realized schedules. One score per schedule, higher
/// is better (GFLOPS for the profiling client); a non-positive score
/// marks that schedule as failed.
pub trait MeasureClient: Send + Sync {
    fn measure(
        &self,
        schedules: &[RealizedSchedule],
        target: &Target,
        ctx: &DeviceCtx,
        gflop: f64,
    ) -> Result<Vec<f64>>;
}

/// Compile-and-time measurement against scratch buffers.
pub struct ProfileMeasure {
    codegen: Arc<dyn Codegen>,
    warmup_runs: usize,
    timing_runs: usize,
}

impl ProfileMeasure {
    pub fn new(codegen: Arc<dyn Codegen>) -> Self {
        Self {
            codegen,
            warmup_runs: 1,
            timing_runs: 3,
        }
    }

    pub fn with_runs(mut self, warmup_runs: usize, timing_runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.timing_runs = timing_runs.max(1);
        self
    }

    fn time_one(
        &self,
        schedule: &RealizedSchedule,
        target: &Target,
        ctx: &DeviceCtx,
        gflop: f64,
    ) -> Result<f64> {
        let module = self.codegen.compile(schedule, target, "measure")?;
        let func = module
            .get_function("measure")
            .ok_or_else(|| anyhow::anyhow!("measure module lost its entry function"))?;
        let buffers: Vec<Arc<TensorBuffer>> = schedule
            .tensors
            .iter()
            .map(|meta| Arc::new(TensorBuffer::zeros(meta.clone())))
            .collect();

        for _ in 0..self.warmup_runs {
            func(&buffers)?;
        }
        let mut best_ms = f64::INFINITY;
        for _ in 0..self.timing_runs {
            let start = Instant::now();
            func(&buffers)?;
            ctx.stream_sync();
            best_ms = best_ms.min(start.elapsed().as_secs_f64() * 1e3);
        }
        Ok(gflop / (best_ms / 1e3 + 1e-8))
    }
}

impl MeasureClient for ProfileMeasure {
    fn measure(
        &self,
        schedules: &[RealizedSchedule],
        target: &Target,
        ctx: &DeviceCtx,
        gflop: f64,
    ) -> Result<Vec<f64>> {
        Ok(schedules
            .iter()
            .map(|schedule| match self.time_one(schedule, target, ctx, gflop) {
                Ok(score) => score,
                Err(error) => {
                    tracing::debug!(%error, "candidate measurement failed");
                    0.0
                }
            })
            .collect())
    }
}

/// Sampling fallback: uniform scores in [0, 1). Used by the `random`
/// autoschedule policy and by tests that must not depend on wall time.
pub struct RandomMeasure {
    rng: Mutex<fastrand::Rng>,
}

impl RandomMeasure {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomMeasure {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasureClient for RandomMeasure {
    fn measure(
        &self,
        schedules: &[RealizedSchedule],
        _target: &Target,
        _ctx: &DeviceCtx,
        _gflop: f64,
    ) -> Result<Vec<f64>> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.iter().map(|_| rng.f64()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphforge_builder::NativeCodegen;
    use graphforge_graph::{ComputeStep, DataType, Subgraph, TensorId, TensorMeta};
    use graphforge_space::{interpret, ScheduleEntity};

    fn realized() -> RealizedSchedule {
        let metas = vec![
            TensorMeta::new("x", &[4, 4], DataType::F32),
            TensorMeta::new("w", &[4, 4], DataType::F32),
            TensorMeta::new("y", &[4, 4], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "mm".into(),
            steps: vec![ComputeStep::MatMul {
                lhs: TensorId(0),
                rhs: TensorId(1),
                dst: TensorId(2),
            }],
            inputs: vec![TensorId(0)],
            labels: vec![],
            outputs: vec![TensorId(2)],
            weights: vec![TensorId(1)],
            loss: None,
            gradients: vec![],
            lr: None,
            updates: vec![],
            tag: String::new(),
            gflop: 0.0,
        };
        sg.tag = sg.compute_tag(&metas);
        let entity = ScheduleEntity {
            tile_m: 2,
            tile_n: 2,
            tile_k: 2,
            vector_width: 4,
            unroll: 1,
            fuse: false,
        };
        interpret(&sg, &metas, &Target::llvm(0), &entity).unwrap()
    }

    #[test]
    fn test_profile_measure_scores_positive() {
        let measurer = ProfileMeasure::new(Arc::new(NativeCodegen)).with_runs(0, 1);
        let target = Target::llvm(0);
        let scores = measurer
            .measure(&[realized()], &target, &target.device_ctx(), 1e-6)
            .unwrap();
        assert_eq!(scores.len(), 1);
        assert!(scores[0] > 0.0);
    }

    #[test]
    fn test_random_measure_is_seedable() {
        let target = Target::llvm(0);
        let schedules = vec![realized(), realized(), realized()];
        let a = RandomMeasure::with_seed(9)
            .measure(&schedules, &target, &target.device_ctx(), 1.0)
            .unwrap();
        let b = RandomMeasure::with_seed(9)
            .measure(&schedules, &target, &target.device_ctx(), 1.0)
            .unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|s| (0.0..1.0).contains(s)));
    }
}
