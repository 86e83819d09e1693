//! Loop-nest features for the profile feedback log.

use crate::interpret::{ArgRef, PlannedStep, RealizedSchedule};
use graphforge_graph::Target;
use serde::Serialize;

/// Flat feature vector for one planned step. The final component is the
/// loop-nest depth, which the profile log reports separately.
#[derive(Debug, Clone, Serialize)]
pub struct Feature {
    pub values: Vec<f64>,
}

fn ref_elements(schedule: &RealizedSchedule, arg: ArgRef) -> f64 {
    let meta = match arg {
        ArgRef::Arg(i) => &schedule.tensors[i],
        ArgRef::Temp(i) => &schedule.plan.temps[i],
    };
    meta.elements() as f64
}

/// Extract one feature vector per planned step.
pub fn feature_extract(schedule: &RealizedSchedule, _target: &Target) -> Vec<Feature> {
    schedule
        .plan
        .steps
        .iter()
        .map(|step| {
            let values = match *step {
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
                    vector_width,
                    unroll,
                    ..
                } => {
                    let flops = 2.0 * m as f64 * n as f64 * k as f64;
                    let footprint = ref_elements(schedule, lhs)
                        + ref_elements(schedule, rhs)
                        + ref_elements(schedule, dst);
                    vec![
                        flops,
                        footprint,
                        tile_m as f64,
                        tile_n as f64,
                        tile_k as f64,
                        vector_width as f64,
                        unroll as f64,
                        step.loop_depth() as f64,
                    ]
                }
                PlannedStep::Add { lhs, rhs, dst } => {
                    let footprint = ref_elements(schedule, lhs)
                        + ref_elements(schedule, rhs)
                        + ref_elements(schedule, dst);
                    vec![
                        ref_elements(schedule, dst),
                        footprint,
                        step.loop_depth() as f64,
                    ]
                }
                PlannedStep::Relu { src, dst } | PlannedStep::Sgd {
                    weight: src, dst, ..
                } => {
                    let footprint = ref_elements(schedule, src) + ref_elements(schedule, dst);
                    vec![
                        ref_elements(schedule, dst),
                        footprint,
                        step.loop_depth() as f64,
                    ]
                }
            };
            Feature { values }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ScheduleEntity;
    use crate::interpret::interpret;
    use graphforge_graph::{ComputeStep, DataType, Subgraph, TensorId, TensorMeta};

    #[test]
    fn test_features_cover_all_steps() {
        let metas = vec![
            TensorMeta::new("x", &[4, 8], DataType::F32),
            TensorMeta::new("w", &[8, 2], DataType::F32),
            TensorMeta::new("y", &[4, 2], DataType::F32),
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

        let entity = ScheduleEntity {
            tile_m: 2,
            tile_n: 2,
            tile_k: 4,
            vector_width: 2,
            unroll: 1,
            fuse: false,
        };
        let realized = interpret(&sg, &metas, &Target::llvm(0), &entity).unwrap();
        let features = feature_extract(&realized, &Target::llvm(0));
        assert_eq!(features.len(), 2);
        // matmul flops = 2 * 4 * 2 * 8
        assert_eq!(features[0].values[0], 128.0);
        assert_eq!(*features[0].values.last().unwrap(), 6.0);
        assert_eq!(*features[1].values.last().unwrap(), 1.0);
    }
}
