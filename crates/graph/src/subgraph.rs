//! Subgraph bodies: compute steps, canonical argument order, tags.

use crate::tensor::{TensorId, TensorMeta};
use anyhow::{bail, Result};

/// One operation of a subgraph body.
///
/// Operands index into the owning graph's tensor table. `MatMul` expects
/// `lhs: [m, k]`, `rhs: [k, n]`, `dst: [m, n]`; the elementwise steps
/// expect matching shapes; `Sgd` computes `dst = weight - lr * grad`
/// (step size 1.0 when no lr tensor is bound).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComputeStep {
    MatMul {
        lhs: TensorId,
        rhs: TensorId,
        dst: TensorId,
    },
    Add {
        lhs: TensorId,
        rhs: TensorId,
        dst: TensorId,
    },
    Relu {
        src: TensorId,
        dst: TensorId,
    },
    Sgd {
        weight: TensorId,
        grad: TensorId,
        lr: Option<TensorId>,
        dst: TensorId,
    },
}

impl ComputeStep {
    pub fn operands(&self) -> Vec<TensorId> {
        match *self {
            ComputeStep::MatMul { lhs, rhs, dst } | ComputeStep::Add { lhs, rhs, dst } => {
                vec![lhs, rhs, dst]
            }
            ComputeStep::Relu { src, dst } => vec![src, dst],
            ComputeStep::Sgd {
                weight,
                grad,
                lr,
                dst,
            } => {
                let mut ops = vec![weight, grad];
                ops.extend(lr);
                ops.push(dst);
                ops
            }
        }
    }

    pub fn flops(&self, metas: &[TensorMeta]) -> f64 {
        let elems = |id: TensorId| metas[id.0].elements() as f64;
        match *self {
            ComputeStep::MatMul { lhs, rhs, .. } => {
                let (m, k) = metas[lhs.0].dims2();
                let (_, n) = metas[rhs.0].dims2();
                2.0 * m as f64 * n as f64 * k as f64
            }
            ComputeStep::Add { dst, .. } | ComputeStep::Relu { dst, .. } => elems(dst),
            ComputeStep::Sgd { dst, .. } => 2.0 * elems(dst),
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            ComputeStep::MatMul { .. } => "mm",
            ComputeStep::Add { .. } => "add",
            ComputeStep::Relu { .. } => "relu",
            ComputeStep::Sgd { .. } => "sgd",
        }
    }
}

/// A partitioned compute fragment: role-classified tensors plus body.
///
/// The role lists define the canonical callable argument order; `tag` is
/// content-addressed over the body and shapes, so subgraphs with equal
/// tags can share compiled artifacts.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub name: String,
    pub steps: Vec<ComputeStep>,
    pub inputs: Vec<TensorId>,
    pub labels: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub weights: Vec<TensorId>,
    pub loss: Option<TensorId>,
    pub gradients: Vec<TensorId>,
    pub lr: Option<TensorId>,
    pub updates: Vec<TensorId>,
    pub tag: String,
    pub gflop: f64,
}

impl Subgraph {
    /// Canonical argument order: inputs, labels, outputs, weights,
    /// loss, gradients, lr, updates.
    pub fn arg_order(&self) -> Vec<TensorId> {
        let mut order = Vec::new();
        order.extend(&self.inputs);
        order.extend(&self.labels);
        order.extend(&self.outputs);
        order.extend(&self.weights);
        order.extend(self.loss);
        order.extend(&self.gradients);
        order.extend(self.lr);
        order.extend(&self.updates);
        order
    }

    /// Metadata for the canonical arguments, in order.
    pub fn arg_metas(&self, metas: &[TensorMeta]) -> Vec<TensorMeta> {
        self.arg_order()
            .into_iter()
            .map(|id| metas[id.0].clone())
            .collect()
    }

    pub fn validate(&self, metas: &[TensorMeta]) -> Result<()> {
        for step in &self.steps {
            for id in step.operands() {
                if id.0 >= metas.len() {
                    bail!("subgraph {} references unknown tensor {id}", self.name);
                }
            }
            if let ComputeStep::MatMul { lhs, rhs, dst } = *step {
                let (m, k) = metas[lhs.0].dims2();
                let (k2, n) = metas[rhs.0].dims2();
                let (dm, dn) = metas[dst.0].dims2();
                if k != k2 || dm != m || dn != n {
                    bail!(
                        "subgraph {}: matmul shape mismatch [{m}x{k}] x [{k2}x{n}] -> [{dm}x{dn}]",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Content-addressed tag over body steps and operand shapes.
    ///
    /// Operands are renamed to their position in the canonical argument
    /// order (`a<i>`) or to a scratch index (`s<i>`) so that tags do not
    /// depend on global tensor ids.
    pub fn compute_tag(&self, metas: &[TensorMeta]) -> String {
        let args = self.arg_order();
        let mut scratch: Vec<TensorId> = Vec::new();
        let mut local = |id: TensorId| -> String {
            if let Some(pos) = args.iter().position(|a| *a == id) {
                format!("a{pos}")
            } else {
                let pos = match scratch.iter().position(|s| *s == id) {
                    Some(pos) => pos,
                    None => {
                        scratch.push(id);
                        scratch.len() - 1
                    }
                };
                format!("s{pos}")
            }
        };
        let mut parts = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let operands: Vec<String> = step
                .operands()
                .into_iter()
                .map(|id| {
                    let shape: Vec<String> =
                        metas[id.0].shape.iter().map(|d| d.to_string()).collect();
                    format!("{}[{}]", local(id), shape.join("x"))
                })
                .collect();
            parts.push(format!("{}({})", step.mnemonic(), operands.join(",")));
        }
        parts.join(";")
    }

    pub fn compute_gflop(&self, metas: &[TensorMeta]) -> f64 {
        self.steps.iter().map(|s| s.flops(metas)).sum::<f64>() / 1e9
    }

    /// Shape of the dominant matmul, if any; drives the candidate space.
    pub fn dominant_matmul(&self, metas: &[TensorMeta]) -> Option<(usize, usize, usize)> {
        self.steps
            .iter()
            .filter_map(|step| match *step {
                ComputeStep::MatMul { lhs, rhs, .. } => {
                    let (m, k) = metas[lhs.0].dims2();
                    let (_, n) = metas[rhs.0].dims2();
                    Some((m, n, k))
                }
                _ => None,
            })
            .max_by_key(|(m, n, k)| m * n * k)
    }
}
