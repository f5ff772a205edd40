pub mod builder;
pub mod layer;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::ops::Value;

pub use builder::GraphBuilder;
pub use layer::{copy_layer, get_kernel, Layer, LayerKind, LayerRef, NodeRecord};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of a symbolic tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(u64);

impl TensorId {
    /// Mint a handle that has never been handed out before
    pub fn fresh() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Opaque identity of a layer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LayerId(u64);

impl LayerId {
    pub(crate) fn fresh() -> Self {
        LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// One application of a layer inside a model
#[derive(Debug, Clone)]
pub struct Node {
    pub layer: LayerRef,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// A computation graph of layer applications with designated inputs and outputs
#[derive(Debug)]
pub struct Model {
    name: String,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    nodes: Vec<Node>,
    /// Node indices grouped by their distance from the sinks of the graph
    nodes_by_depth: BTreeMap<usize, Vec<usize>>,
    layers: Vec<LayerRef>,
}

impl Model {
    pub(crate) fn from_parts(
        name: String,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        nodes: Vec<Node>,
        nodes_by_depth: BTreeMap<usize, Vec<usize>>,
    ) -> Self {
        let mut model = Self {
            name,
            inputs,
            outputs,
            nodes,
            nodes_by_depth,
            layers: Vec::new(),
        };

        let mut seen = HashSet::new();
        let layers = model
            .execution_order()
            .into_iter()
            .filter(|node| seen.insert(node.layer.id()))
            .map(|node| Arc::clone(&node.layer))
            .collect();
        model.layers = layers;
        model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Distinct layers directly used by this model, in execution order
    pub fn layers(&self) -> &[LayerRef] {
        &self.layers
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn nodes_by_depth(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.nodes_by_depth
    }

    /// Nodes ordered from the inputs towards the outputs.
    ///
    /// Depths count the distance from the sinks, so walking the depth index in
    /// ascending order and reversing the result yields a topological order.
    pub fn execution_order(&self) -> Vec<&Node> {
        let mut order: Vec<&Node> = self
            .nodes_by_depth
            .values()
            .flat_map(|indices| indices.iter().map(|&i| &self.nodes[i]))
            .collect();
        order.reverse();
        order
    }

    /// Number of nodes in this model consuming an output of `layer`
    pub fn outbound_count(&self, layer: &Layer) -> usize {
        let produced: HashSet<TensorId> = self
            .nodes
            .iter()
            .filter(|node| node.layer.id() == layer.id())
            .flat_map(|node| node.outputs.iter().copied())
            .collect();

        self.nodes
            .iter()
            .filter(|node| !node.layer.is_input())
            .filter(|node| node.inputs.iter().any(|x| produced.contains(x)))
            .count()
    }

    /// Evaluate the model numerically. Nested models are evaluated recursively.
    pub fn evaluate(&self, inputs: &[Value]) -> Result<Vec<Value>> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::InvalidGraph(format!(
                "Model '{}' expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                inputs.len()
            )));
        }

        let mut values: HashMap<TensorId, Value> = self
            .inputs
            .iter()
            .copied()
            .zip(inputs.iter().cloned())
            .collect();

        for node in self.execution_order() {
            if node.layer.is_input() {
                continue;
            }

            let xs = node
                .inputs
                .iter()
                .map(|x| {
                    values.get(x).ok_or_else(|| {
                        Error::GraphIntegrity(format!(
                            "Tensor {} consumed by layer '{}' has no value",
                            x,
                            node.layer.name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let ys = node.layer.forward(&xs)?;
            values.extend(node.outputs.iter().copied().zip(ys));
        }

        self.outputs
            .iter()
            .map(|y| {
                values.remove(y).ok_or_else(|| {
                    Error::GraphIntegrity(format!("Model output {} was not computed", y))
                })
            })
            .collect()
    }

    /// Symbolically apply the model to `inputs`.
    ///
    /// Every layer call mints fresh output handles. Input layers are invoked
    /// only when `call_input_layers` is set; nested models bind their inputs
    /// directly to the caller's tensors instead.
    pub(crate) fn call_symbolic(
        &self,
        inputs: &[TensorId],
        call_input_layers: bool,
    ) -> Result<Vec<TensorId>> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::InvalidGraph(format!(
                "Model '{}' expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                inputs.len()
            )));
        }

        let mut bound: HashMap<TensorId, TensorId> = self
            .inputs
            .iter()
            .copied()
            .zip(inputs.iter().copied())
            .collect();

        for node in self.execution_order() {
            if node.layer.is_input() && !call_input_layers {
                continue;
            }

            let xs = node
                .inputs
                .iter()
                .map(|x| {
                    bound.get(x).copied().ok_or_else(|| {
                        Error::GraphIntegrity(format!(
                            "Tensor {} consumed by layer '{}' is not bound in model '{}'",
                            x,
                            node.layer.name(),
                            self.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let ys = node.layer.call(&xs)?;
            if ys.len() != node.outputs.len() {
                return Err(Error::GraphIntegrity(format!(
                    "Layer '{}' produced {} outputs, expected {}",
                    node.layer.name(),
                    ys.len(),
                    node.outputs.len()
                )));
            }
            bound.extend(node.outputs.iter().copied().zip(ys));
        }

        self.outputs
            .iter()
            .map(|y| {
                bound.get(y).copied().ok_or_else(|| {
                    Error::GraphIntegrity(format!(
                        "Output {} of model '{}' was not produced",
                        y, self.name
                    ))
                })
            })
            .collect()
    }
}
