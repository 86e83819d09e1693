//! The schedule interpreter: entity × subgraph → realized loop plan.

use crate::entity::ScheduleEntity;
use anyhow::{bail, Result};
use graphforge_graph::{ComputeStep, Subgraph, Target, TensorId, TensorMeta};
use std::sync::Arc;

/// Operand of a planned step: canonical argument position or scratch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRef {
    Arg(usize),
    Temp(usize),
}

/// One step of a realized schedule with its loop decisions applied.
#[derive(Debug, Clone)]
pub enum PlannedStep {
    MatMul {
        lhs: ArgRef,
        rhs: ArgRef,
        dst: ArgRef,
        m: usize,
        n: usize,
        k: usize,
        tile_m: usize,
        tile_n: usize,
        tile_k: usize,
        vector_width: usize,
        unroll: usize,
        fused_relu: bool,
    },
    Add {
        lhs: ArgRef,
        rhs: ArgRef,
        dst: ArgRef,
    },
    Relu {
        src: ArgRef,
        dst: ArgRef,
    },
    Sgd {
        weight: ArgRef,
        grad: ArgRef,
        lr: Option<ArgRef>,
        dst: ArgRef,
    },
}

impl PlannedStep {
    /// Depth of the loop nest the step lowers to.
    pub fn loop_depth(&self) -> usize {
        match self {
            PlannedStep::MatMul { .. } => 6,
            PlannedStep::Add { .. } | PlannedStep::Relu { .. } | PlannedStep::Sgd { .. } => 1,
        }
    }
}

/// The opaque schedule IR: planned steps plus scratch buffer shapes.
#[derive(Debug)]
pub struct SchedulePlan {
    pub steps: Vec<PlannedStep>,
    pub temps: Vec<TensorMeta>,
}

/// A materialized schedule: immutable after construction.
///
/// `tensors` is the canonical-order argument metadata the compiled
/// callable binds positionally; `entity` is the point that produced the
/// plan, carried along for feedback and reference files.
#[derive(Debug, Clone)]
pub struct RealizedSchedule {
    pub plan: Arc<SchedulePlan>,
    pub tensors: Arc<Vec<TensorMeta>>,
    pub entity: ScheduleEntity,
}

/// Realize `entity` against `subgraph`, producing the loop plan.
///
/// Tile sizes are clamped to the step's own dimensions (a subgraph may
/// contain matmuls smaller than the dominant one that sized the space).
/// A degenerate entity is a transient error: the candidate is dropped.
pub fn interpret(
    subgraph: &Subgraph,
    metas: &[TensorMeta],
    _target: &Target,
    entity: &ScheduleEntity,
) -> Result<RealizedSchedule> {
    if entity.tile_m == 0 || entity.tile_n == 0 || entity.tile_k == 0 {
        bail!("degenerate tile sizes in {entity}");
    }
    if entity.vector_width == 0 || entity.unroll == 0 {
        bail!("degenerate vectorization in {entity}");
    }
    subgraph.validate(metas)?;

    let args = subgraph.arg_order();
    let mut temps: Vec<TensorId> = Vec::new();
    let mut resolve = |id: TensorId| -> ArgRef {
        if let Some(pos) = args.iter().position(|a| *a == id) {
            ArgRef::Arg(pos)
        } else {
            let pos = match temps.iter().position(|t| *t == id) {
                Some(pos) => pos,
                None => {
                    temps.push(id);
                    temps.len() - 1
                }
            };
            ArgRef::Temp(pos)
        }
    };

    let mut steps = Vec::with_capacity(subgraph.steps.len());
    let mut skip_next = false;
    for (idx, step) in subgraph.steps.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        match *step {
            ComputeStep::MatMul { lhs, rhs, dst } => {
                let (m, k) = metas[lhs.0].dims2();
                let (_, n) = metas[rhs.0].dims2();
                // In-place relu directly after the matmul fuses into it.
                let fused_relu = entity.fuse
                    && matches!(
                        subgraph.steps.get(idx + 1),
                        Some(&ComputeStep::Relu { src, dst: rdst }) if src == dst && rdst == dst
                    );
                skip_next = fused_relu;
                steps.push(PlannedStep::MatMul {
                    lhs: resolve(lhs),
                    rhs: resolve(rhs),
                    dst: resolve(dst),
                    m,
                    n,
                    k,
                    tile_m: entity.tile_m.min(m),
                    tile_n: entity.tile_n.min(n),
                    tile_k: entity.tile_k.min(k),
                    vector_width: entity.vector_width.min(n),
                    unroll: entity.unroll,
                    fused_relu,
                });
            }
            ComputeStep::Add { lhs, rhs, dst } => steps.push(PlannedStep::Add {
                lhs: resolve(lhs),
                rhs: resolve(rhs),
                dst: resolve(dst),
            }),
            ComputeStep::Relu { src, dst } => steps.push(PlannedStep::Relu {
                src: resolve(src),
                dst: resolve(dst),
            }),
            ComputeStep::Sgd {
                weight,
                grad,
                lr,
                dst,
            } => steps.push(PlannedStep::Sgd {
                weight: resolve(weight),
                grad: resolve(grad),
                lr: lr.map(&mut resolve),
                dst: resolve(dst),
            }),
        }
    }

    let temp_metas = temps.into_iter().map(|id| metas[id.0].clone()).collect();
    Ok(RealizedSchedule {
        plan: Arc::new(SchedulePlan {
            steps,
            temps: temp_metas,
        }),
        tensors: Arc::new(subgraph.arg_metas(metas)),
        entity: entity.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphforge_graph::DataType;

    fn mm_relu_subgraph() -> (Subgraph, Vec<TensorMeta>) {
        let metas = vec![
            TensorMeta::new("x", &[8, 16], DataType::F32),
            TensorMeta::new("w", &[16, 4], DataType::F32),
            TensorMeta::new("y", &[8, 4], DataType::F32),
        ];
        let mut sg = Subgraph {
            name: "mm_relu".into(),
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

    fn entity(fuse: bool) -> ScheduleEntity {
        ScheduleEntity {
            tile_m: 4,
            tile_n: 4,
            tile_k: 8,
            vector_width: 4,
            unroll: 2,
            fuse,
        }
    }

    #[test]
    fn test_interpret_resolves_canonical_args() {
        let (sg, metas) = mm_relu_subgraph();
        let target = Target::llvm(0);
        let realized = interpret(&sg, &metas, &target, &entity(false)).unwrap();
        assert_eq!(realized.plan.steps.len(), 2);
        assert!(realized.plan.temps.is_empty());
        // arg order: x (input), y (output), w (weight)
        match realized.plan.steps[0] {
            PlannedStep::MatMul { lhs, rhs, dst, .. } => {
                assert_eq!(lhs, ArgRef::Arg(0));
                assert_eq!(rhs, ArgRef::Arg(2));
                assert_eq!(dst, ArgRef::Arg(1));
            }
            ref other => panic!("expected matmul, got {other:?}"),
        }
    }

    #[test]
    fn test_fuse_absorbs_inplace_relu() {
        let (sg, metas) = mm_relu_subgraph();
        let target = Target::llvm(0);
        let realized = interpret(&sg, &metas, &target, &entity(true)).unwrap();
        assert_eq!(realized.plan.steps.len(), 1);
        match realized.plan.steps[0] {
            PlannedStep::MatMul { fused_relu, .. } => assert!(fused_relu),
            ref other => panic!("expected matmul, got {other:?}"),
        }
    }

    #[test]
    fn test_tiles_clamped_to_dims() {
        let (sg, metas) = mm_relu_subgraph();
        let target = Target::llvm(0);
        let big = ScheduleEntity {
            tile_m: 128,
            tile_n: 128,
            tile_k: 128,
            vector_width: 16,
            unroll: 1,
            fuse: false,
        };
        let realized = interpret(&sg, &metas, &target, &big).unwrap();
        match realized.plan.steps[0] {
            PlannedStep::MatMul {
                tile_m,
                tile_n,
                tile_k,
                ..
            } => {
                assert_eq!((tile_m, tile_n, tile_k), (8, 4, 16));
            }
            ref other => panic!("expected matmul, got {other:?}"),
        }
    }

    #[test]
    fn test_degenerate_entity_is_rejected() {
        let (sg, metas) = mm_relu_subgraph();
        let target = Target::llvm(0);
        let mut bad = entity(false);
        bad.tile_m = 0;
        assert!(interpret(&sg, &metas, &target, &bad).is_err());
    }
}
