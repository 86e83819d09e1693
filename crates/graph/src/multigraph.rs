//! Graph construction and the subgraph partitioner.

use crate::subgraph::{ComputeStep, Subgraph};
use crate::tensor::{DataType, TensorId, TensorMeta};
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Dense identifier assigned to a subgraph by the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgraphKey(pub usize);

impl std::fmt::Display for SubgraphKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical unit of a computation graph before partitioning.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
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
}

/// A computation graph: tensor table plus logical nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub tensors: Vec<TensorMeta>,
    pub nodes: Vec<NodeSpec>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    fn role_union(&self, pick: impl Fn(&NodeSpec) -> &[TensorId]) -> Vec<TensorId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for node in &self.nodes {
            for &id in pick(node) {
                if seen.insert(id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Graph-level weights in node order (deduplicated).
    pub fn weights(&self) -> Vec<TensorId> {
        self.role_union(|n| &n.weights)
    }

    pub fn gradients(&self) -> Vec<TensorId> {
        self.role_union(|n| &n.gradients)
    }

    pub fn updates(&self) -> Vec<TensorId> {
        self.role_union(|n| &n.updates)
    }

    pub fn loss(&self) -> Option<TensorId> {
        self.nodes.iter().find_map(|n| n.loss)
    }

    pub fn meta(&self, id: TensorId) -> Result<&TensorMeta> {
        self.tensors
            .get(id.0)
            .with_context(|| format!("unknown tensor {id}"))
    }
}

/// Incremental graph construction, teacher to the runtime tests.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    tensors: Vec<TensorMeta>,
    nodes: Vec<NodeSpec>,
}

impl GraphBuilder {
    pub fn tensor(&mut self, name: impl Into<String>, shape: &[usize], dtype: DataType) -> TensorId {
        self.tensors.push(TensorMeta::new(name, shape, dtype));
        TensorId(self.tensors.len() - 1)
    }

    pub fn add_node(&mut self, node: NodeSpec) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            tensors: self.tensors,
            nodes: self.nodes,
        }
    }
}

/// Per-node traversal attributes of a [`MultiGraph`].
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub predecessor_count: usize,
    pub successors: BTreeSet<SubgraphKey>,
}

/// The partitioned DAG the tuning pipeline operates on.
#[derive(Debug, Clone)]
pub struct MultiGraph {
    pub tensors: Arc<Vec<TensorMeta>>,
    pub subgraphs: BTreeMap<SubgraphKey, Arc<Subgraph>>,
    pub attrs: BTreeMap<SubgraphKey, NodeAttrs>,
}

impl MultiGraph {
    pub fn num_subgraphs(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn subgraph(&self, key: SubgraphKey) -> Result<&Arc<Subgraph>> {
        self.subgraphs
            .get(&key)
            .with_context(|| format!("unknown subgraph {key}"))
    }

    pub fn attrs(&self, key: SubgraphKey) -> Result<&NodeAttrs> {
        self.attrs
            .get(&key)
            .with_context(|| format!("missing attributes for subgraph {key}"))
    }

    /// Keys with no predecessors, in key order.
    pub fn roots(&self) -> Vec<SubgraphKey> {
        self.attrs
            .iter()
            .filter(|(_, a)| a.predecessor_count == 0)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Deterministic topological order (Kahn over sorted free sets).
    pub fn topo_order(&self) -> Vec<SubgraphKey> {
        let mut remaining: BTreeMap<SubgraphKey, usize> = self
            .attrs
            .iter()
            .map(|(k, a)| (*k, a.predecessor_count))
            .collect();
        let mut free: BTreeSet<SubgraphKey> = remaining
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.subgraphs.len());
        while let Some(&key) = free.iter().next() {
            free.remove(&key);
            order.push(key);
            for succ in &self.attrs[&key].successors {
                let count = remaining.get_mut(succ).expect("successor attrs");
                *count -= 1;
                if *count == 0 {
                    free.insert(*succ);
                }
            }
        }
        order
    }
}

/// Partition a graph into a [`MultiGraph`] of single-node subgraphs with
/// dataflow edges derived from output/input tensor sharing.
pub fn partition(graph: &Graph) -> Result<MultiGraph> {
    if graph.nodes.is_empty() {
        bail!("cannot partition an empty graph");
    }

    let mut producer: HashMap<TensorId, usize> = HashMap::new();
    for (idx, node) in graph.nodes.iter().enumerate() {
        for &out in &node.outputs {
            if let Some(prev) = producer.insert(out, idx) {
                bail!(
                    "tensor {out} produced by both {} and {}",
                    graph.nodes[prev].name,
                    node.name
                );
            }
        }
    }

    let mut subgraphs = BTreeMap::new();
    let mut attrs: BTreeMap<SubgraphKey, NodeAttrs> = BTreeMap::new();
    for idx in 0..graph.nodes.len() {
        attrs.insert(SubgraphKey(idx), NodeAttrs::default());
    }

    for (idx, node) in graph.nodes.iter().enumerate() {
        let key = SubgraphKey(idx);
        let mut sg = Subgraph {
            name: if node.name.is_empty() {
                format!("node_{idx}")
            } else {
                node.name.clone()
            },
            steps: node.steps.clone(),
            inputs: node.inputs.clone(),
            labels: node.labels.clone(),
            outputs: node.outputs.clone(),
            weights: node.weights.clone(),
            loss: node.loss,
            gradients: node.gradients.clone(),
            lr: node.lr,
            updates: node.updates.clone(),
            tag: String::new(),
            gflop: 0.0,
        };
        sg.validate(&graph.tensors)?;
        sg.tag = sg.compute_tag(&graph.tensors);
        sg.gflop = sg.compute_gflop(&graph.tensors);
        subgraphs.insert(key, Arc::new(sg));

        let mut preds = BTreeSet::new();
        for &input in &node.inputs {
            if let Some(&src) = producer.get(&input) {
                if src != idx {
                    preds.insert(SubgraphKey(src));
                }
            }
        }
        attrs.get_mut(&key).expect("attrs").predecessor_count = preds.len();
        for pred in preds {
            attrs.get_mut(&pred).expect("attrs").successors.insert(key);
        }
    }

    let multi = MultiGraph {
        tensors: Arc::new(graph.tensors.clone()),
        subgraphs,
        attrs,
    };

    if multi.topo_order().len() != multi.num_subgraphs() {
        bail!("graph partition produced a cycle");
    }
    Ok(multi)
}
