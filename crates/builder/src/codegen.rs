//! Code generation behind the builder.
//!
//! `Codegen` is the seam to the real lowering backend; `NativeCodegen`
//! is the in-process reference implementation that executes planned
//! steps with ndarray kernels, honoring the plan's tiling decisions.

use crate::module::{Callable, Module};
use anyhow::{anyhow, bail, Result};
use graphforge_graph::{Target, TensorBuffer, TensorMeta};
use graphforge_space::{ArgRef, PlannedStep, RealizedSchedule, SchedulePlan};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, ArrayView2, ArrayViewMut2};
use std::sync::Arc;

pub trait Codegen: Send + Sync {
    fn compile(&self, schedule: &RealizedSchedule, target: &Target, name: &str) -> Result<Module>;
}

/// Reference backend: compiles a plan into a closure over ndarray
/// kernels. Tiling shapes the block traversal; vector width and unroll
/// are carried in the plan but lowered by ndarray's own inner loops.
#[derive(Debug, Default)]
pub struct NativeCodegen;

impl Codegen for NativeCodegen {
    fn compile(&self, schedule: &RealizedSchedule, _target: &Target, name: &str) -> Result<Module> {
        let plan = Arc::clone(&schedule.plan);
        let args = Arc::clone(&schedule.tensors);
        for step in &plan.steps {
            validate_step(step, &args, &plan.temps)?;
        }

        let entry_args = Arc::clone(&args);
        let entry: Callable = Arc::new(move |buffers: &[Arc<TensorBuffer>]| {
            run_plan(&plan, &entry_args, buffers)
        });
        Ok(Module::new(name, entry))
    }
}

fn validate_step(step: &PlannedStep, args: &[TensorMeta], temps: &[TensorMeta]) -> Result<()> {
    let check = |arg: ArgRef| -> Result<()> {
        match arg {
            ArgRef::Arg(i) if i < args.len() => Ok(()),
            ArgRef::Temp(i) if i < temps.len() => Ok(()),
            other => bail!("plan references out-of-range operand {other:?}"),
        }
    };
    match *step {
        PlannedStep::MatMul { lhs, rhs, dst, .. } | PlannedStep::Add { lhs, rhs, dst } => {
            check(lhs)?;
            check(rhs)?;
            check(dst)
        }
        PlannedStep::Relu { src, dst } => {
            check(src)?;
            check(dst)
        }
        PlannedStep::Sgd {
            weight,
            grad,
            lr,
            dst,
        } => {
            check(weight)?;
            check(grad)?;
            if let Some(lr) = lr {
                check(lr)?;
            }
            check(dst)
        }
    }
}

/// Execution-time storage: argument buffers plus per-call scratch.
struct Workspace<'a> {
    buffers: &'a [Arc<TensorBuffer>],
    temps: Vec<Vec<f32>>,
}

impl<'a> Workspace<'a> {
    /// Snapshot an operand's current contents. Reads never hold a lock
    /// across a write, so role aliasing (updates sharing a weight
    /// buffer) cannot deadlock a kernel.
    fn read(&self, arg: ArgRef) -> Vec<f32> {
        match arg {
            ArgRef::Arg(i) => self.buffers[i].read().clone(),
            ArgRef::Temp(i) => self.temps[i].clone(),
        }
    }

    fn write(&mut self, arg: ArgRef, values: &[f32]) -> Result<()> {
        match arg {
            ArgRef::Arg(i) => self.buffers[i].fill_from(values),
            ArgRef::Temp(i) => {
                self.temps[i].copy_from_slice(values);
                Ok(())
            }
        }
    }
}

fn run_plan(
    plan: &SchedulePlan,
    args: &[TensorMeta],
    buffers: &[Arc<TensorBuffer>],
) -> Result<()> {
    if buffers.len() != args.len() {
        bail!(
            "callable expects {} arguments, got {}",
            args.len(),
            buffers.len()
        );
    }
    for (meta, buffer) in args.iter().zip(buffers) {
        if buffer.meta().elements() != meta.elements() {
            bail!(
                "argument {} has {} elements, expected {}",
                meta.name,
                buffer.meta().elements(),
                meta.elements()
            );
        }
    }

    let mut workspace = Workspace {
        buffers,
        temps: plan
            .temps
            .iter()
            .map(|meta| vec![0.0; meta.elements()])
            .collect(),
    };

    for step in &plan.steps {
        match *step {
            PlannedStep::MatMul {
                lhs,
                rhs,
                dst,
                m,
                n,
                k,
                tile_m,
                tile_n,
                tile_k,
                fused_relu,
                ..
            } => {
                let a = workspace.read(lhs);
                let b = workspace.read(rhs);
                let mut c = vec![0.0f32; m * n];
                tiled_matmul(
                    &a, &b, &mut c, m, n, k, tile_m, tile_n, tile_k, fused_relu,
                )?;
                workspace.write(dst, &c)?;
            }
            PlannedStep::Add { lhs, rhs, dst } => {
                let a = workspace.read(lhs);
                let b = workspace.read(rhs);
                if a.len() != b.len() {
                    bail!("add operand length mismatch: {} vs {}", a.len(), b.len());
                }
                let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
                workspace.write(dst, &sum)?;
            }
            PlannedStep::Relu { src, dst } => {
                let activated: Vec<f32> =
                    workspace.read(src).iter().map(|x| x.max(0.0)).collect();
                workspace.write(dst, &activated)?;
            }
            PlannedStep::Sgd {
                weight,
                grad,
                lr,
                dst,
            } => {
                let w = workspace.read(weight);
                let g = workspace.read(grad);
                if w.len() != g.len() {
                    bail!("sgd operand length mismatch: {} vs {}", w.len(), g.len());
                }
                let step_size = match lr {
                    Some(lr) => *workspace
                        .read(lr)
                        .first()
                        .ok_or_else(|| anyhow!("empty lr tensor"))?,
                    None => 1.0,
                };
                let updated: Vec<f32> = w
                    .iter()
                    .zip(&g)
                    .map(|(w, g)| w - step_size * g)
                    .collect();
                workspace.write(dst, &updated)?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn tiled_matmul(
    lhs: &[f32],
    rhs: &[f32],
    dst: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    tile_m: usize,
    tile_n: usize,
    tile_k: usize,
    fused_relu: bool,
) -> Result<()> {
    let a = ArrayView2::from_shape((m, k), lhs)?;
    let b = ArrayView2::from_shape((k, n), rhs)?;
    let mut c = ArrayViewMut2::from_shape((m, n), dst)?;
    c.fill(0.0);

    let tile_m = tile_m.max(1);
    let tile_n = tile_n.max(1);
    let tile_k = tile_k.max(1);
    for i0 in (0..m).step_by(tile_m) {
        let i1 = (i0 + tile_m).min(m);
        for l0 in (0..k).step_by(tile_k) {
            let l1 = (l0 + tile_k).min(k);
            for j0 in (0..n).step_by(tile_n) {
                let j1 = (j0 + tile_n).min(n);
                let a_block = a.slice(s![i0..i1, l0..l1]);
                let b_block = b.slice(s![l0..l1, j0..j1]);
                let mut c_block = c.slice_mut(s![i0..i1, j0..j1]);
                general_mat_mul(1.0, &a_block, &b_block, 1.0, &mut c_block);
            }
        }
    }
    if fused_relu {
        c.mapv_inplace(|x| x.max(0.0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use graphforge_graph::{ComputeStep, DataType, Subgraph, TensorId};
    use graphforge_space::{interpret, ScheduleEntity};

    fn subgraph() -> (Subgraph, Vec<TensorMeta>) {
        let metas = vec![
            TensorMeta::new("x", &[2, 3], DataType::F32),
            TensorMeta::new("w", &[3, 2], DataType::F32),
            TensorMeta::new("y", &[2, 2], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "mm".into(),
            steps: vec![
                ComputeStep::MatMul {
                    lhs: TensorId(0),
                    rhs: TensorId(1),
                    dst: TensorId(2),
                },
                ComputeStep::Relu {
                    src: TensorId(2),
                    dst: TensorId(2),
                },
            ],
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
        (sg, metas)
    }

    fn buffers(metas: &[TensorMeta], sg: &Subgraph) -> Vec<Arc<TensorBuffer>> {
        sg.arg_order()
            .into_iter()
            .map(|id| Arc::new(TensorBuffer::zeros(metas[id.0].clone())))
            .collect()
    }

    fn entity(fuse: bool, tile: usize) -> ScheduleEntity {
        ScheduleEntity {
            tile_m: tile,
            tile_n: tile,
            tile_k: tile,
            vector_width: 4,
            unroll: 1,
            fuse,
        }
    }

    #[test]
    fn test_native_matmul_matches_reference() {
        let (sg, metas) = subgraph();
        let target = Target::llvm(0);
        let realized = interpret(&sg, &metas, &target, &entity(false, 2)).unwrap();
        let module = NativeCodegen.compile(&realized, &target, "subgraph_0").unwrap();

        let args = buffers(&metas, &sg);
        // arg order: x, y, w
        args[0]
            .fill_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        args[2]
            .fill_from(&[1.0, -1.0, 0.5, 0.5, -2.0, 1.0])
            .unwrap();
        let func = module.get_function("subgraph_0").unwrap();
        func(&args).unwrap();

        // y = relu(x @ w)
        let y = args[1].read();
        assert_abs_diff_eq!(y[0], 0.0);
        assert_abs_diff_eq!(y[1], 3.0);
        assert_abs_diff_eq!(y[2], 0.0);
        assert_abs_diff_eq!(y[3], 4.5);
    }

    #[test]
    fn test_fused_plan_matches_unfused() {
        let (sg, metas) = subgraph();
        let target = Target::llvm(0);
        let input = [0.5, -1.5, 2.0, -0.5, 1.0, 3.0];
        let weight = [1.0, 2.0, -1.0, 0.5, 0.25, -0.75];

        let mut results = Vec::new();
        for fuse in [false, true] {
            let realized = interpret(&sg, &metas, &target, &entity(fuse, 1)).unwrap();
            let module = NativeCodegen.compile(&realized, &target, "sg").unwrap();
            let args = buffers(&metas, &sg);
            args[0].fill_from(&input).unwrap();
            args[2].fill_from(&weight).unwrap();
            module.get_function("sg").unwrap()(&args).unwrap();
            results.push(args[1].read().clone());
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_callable_rejects_wrong_arity() {
        let (sg, metas) = subgraph();
        let target = Target::llvm(0);
        let realized = interpret(&sg, &metas, &target, &entity(false, 2)).unwrap();
        let module = NativeCodegen.compile(&realized, &target, "sg").unwrap();
        let func = module.get_function("sg").unwrap();
        assert!(func(&[]).is_err());
    }

    #[test]
    fn test_sgd_with_aliased_update_buffer() {
        let metas = vec![
            TensorMeta::new("w", &[2, 2], DataType::F32),
            TensorMeta::new("g", &[2, 2], DataType::F32),
            TensorMeta::new("lr", &[1], DataType::F32),
            TensorMeta::new("u", &[2, 2], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "sgd".into(),
            steps: vec![ComputeStep::Sgd {
                weight: TensorId(0),
                grad: TensorId(1),
                lr: Some(TensorId(2)),
                dst: TensorId(3),
            }],
            inputs: vec![],
            labels: vec![],
            outputs: vec![],
            weights: vec![TensorId(0)],
            loss: None,
            gradients: vec![TensorId(1)],
            lr: Some(TensorId(2)),
            updates: vec![TensorId(3)],
            tag: String::new(),
            gflop: 0.0,
        };
        sg.tag = sg.compute_tag(&metas);

        let target = Target::llvm(0);
        let realized = interpret(&sg, &metas, &target, &entity(false, 2)).unwrap();
        let module = NativeCodegen.compile(&realized, &target, "sg").unwrap();

        // The update argument shares the weight's buffer, as the session
        // aliases them.
        let weight = Arc::new(TensorBuffer::zeros(metas[0].clone()));
        weight.fill_from(&[1.0, 1.0, 1.0, 1.0]).unwrap();
        let grad = Arc::new(TensorBuffer::zeros(metas[1].clone()));
        grad.fill_from(&[0.5, 0.5, 0.5, 0.5]).unwrap();
        let lr = Arc::new(TensorBuffer::zeros(metas[2].clone()));
        lr.fill_from(&[0.1]).unwrap();
        let args = vec![
            Arc::clone(&weight),
            Arc::clone(&grad),
            lr,
            Arc::clone(&weight),
        ];

        module.get_function("sg").unwrap()(&args).unwrap();
        let updated = weight.read();
        assert_abs_diff_eq!(updated[0], 0.95, epsilon = 1e-6);
    }
}
