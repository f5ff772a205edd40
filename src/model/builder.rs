use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{Layer, LayerRef, Model, Node, TensorId};
use crate::error::{Error, Result};

/// Builder recording layer applications into a model
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    /// Index of the node producing each tensor
    producers: HashMap<TensorId, usize>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            producers: HashMap::new(),
        }
    }

    /// Declare a graph input and return its tensor
    pub fn input(&mut self, name: impl Into<String>) -> Result<TensorId> {
        let layer = Layer::input(name);
        let tensor = TensorId::fresh();
        let outputs = layer.call(&[tensor])?;
        self.push_node(layer, vec![tensor], outputs)?;
        Ok(tensor)
    }

    /// Apply a layer to tensors already known to this builder
    pub fn apply(&mut self, layer: &LayerRef, inputs: &[TensorId]) -> Result<Vec<TensorId>> {
        if layer.is_input() {
            return Err(Error::InvalidGraph(format!(
                "Input layer '{}' cannot be applied, use GraphBuilder::input",
                layer.name()
            )));
        }

        for x in inputs {
            if !self.producers.contains_key(x) {
                return Err(Error::InvalidGraph(format!(
                    "Tensor {} passed to layer '{}' is not part of graph '{}'",
                    x,
                    layer.name(),
                    self.name
                )));
            }
        }

        let outputs = layer.call(inputs)?;
        self.push_node(Arc::clone(layer), inputs.to_vec(), outputs.clone())?;
        Ok(outputs)
    }

    /// Apply a layer producing exactly one output
    pub fn apply_one(&mut self, layer: &LayerRef, inputs: &[TensorId]) -> Result<TensorId> {
        let outputs = self.apply(layer, inputs)?;
        match outputs.as_slice() {
            [y] => Ok(*y),
            _ => Err(Error::InvalidGraph(format!(
                "Layer '{}' produced {} outputs, expected 1",
                layer.name(),
                outputs.len()
            ))),
        }
    }

    fn push_node(
        &mut self,
        layer: LayerRef,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<()> {
        let index = self.nodes.len();

        // A container whose inner model returns one of its inputs passes the
        // outer tensor through; that tensor keeps its original producer.
        let passes_through = |y: &TensorId| layer.is_container() && inputs.contains(y);

        for y in outputs.iter().filter(|y| !passes_through(*y)) {
            if self.producers.contains_key(y) {
                return Err(Error::GraphIntegrity(format!(
                    "Tensor {} produced by layer '{}' already has a producer",
                    y,
                    layer.name()
                )));
            }
        }
        for y in outputs.iter().filter(|y| !passes_through(*y)) {
            self.producers.insert(*y, index);
        }

        self.nodes.push(Node {
            layer,
            inputs,
            outputs,
        });
        Ok(())
    }

    /// Finish the graph with the given model inputs and outputs
    pub fn build(self, inputs: &[TensorId], outputs: &[TensorId]) -> Result<Model> {
        for x in inputs {
            match self.producers.get(x) {
                Some(&i) if self.nodes[i].layer.is_input() => {}
                _ => {
                    return Err(Error::InvalidGraph(format!(
                        "Model input {} is not produced by an input layer",
                        x
                    )))
                }
            }
        }

        for y in outputs {
            if !self.producers.contains_key(y) {
                return Err(Error::InvalidGraph(format!(
                    "Model output {} is not produced in graph '{}'",
                    y, self.name
                )));
            }
        }

        let nodes_by_depth = self.compute_depths();
        Ok(Model::from_parts(
            self.name,
            inputs.to_vec(),
            outputs.to_vec(),
            self.nodes,
            nodes_by_depth,
        ))
    }

    /// Group node indices by their longest distance to a sink.
    ///
    /// Nodes are recorded after their producers, so walking them backward
    /// visits every consumer before its producer.
    fn compute_depths(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut consumers: HashMap<TensorId, Vec<usize>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.layer.is_input() {
                continue;
            }
            for x in &node.inputs {
                consumers.entry(*x).or_default().push(i);
            }
        }

        let mut depths = vec![0usize; self.nodes.len()];
        for i in (0..self.nodes.len()).rev() {
            depths[i] = self.nodes[i]
                .outputs
                .iter()
                .filter_map(|y| consumers.get(y))
                .flatten()
                .filter(|&&c| c != i)
                .map(|&c| depths[c] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut nodes_by_depth: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, depth) in depths.into_iter().enumerate() {
            nodes_by_depth.entry(depth).or_default().push(i);
        }
        nodes_by_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tracer::{trace_model_execution, TraceOptions};
    use crate::ops::{Activation, ActivationKind, Add};
    use ndarray::arr2;

    #[test]
    fn test_depths_follow_distance_to_output() {
        let mut b = GraphBuilder::new("chain");
        let x = b.input("x").unwrap();
        let relu = Layer::new("relu", Activation::new(ActivationKind::Relu));
        let tanh = Layer::new("tanh", Activation::new(ActivationKind::Tanh));
        let h = b.apply_one(&relu, &[x]).unwrap();
        let y = b.apply_one(&tanh, &[h]).unwrap();
        let model = b.build(&[x], &[y]).unwrap();

        let depths = model.nodes_by_depth();
        assert_eq!(depths[&0], vec![2]);
        assert_eq!(depths[&1], vec![1]);
        assert_eq!(depths[&2], vec![0]);

        let order: Vec<&str> = model
            .execution_order()
            .iter()
            .map(|n| n.layer.name())
            .collect();
        assert_eq!(order, vec!["x", "relu", "tanh"]);
    }

    #[test]
    fn test_apply_rejects_unknown_tensor() {
        let mut b = GraphBuilder::new("g");
        let relu = Layer::new("relu", Activation::default());
        let stranger = TensorId::fresh();
        assert!(matches!(
            b.apply(&relu, &[stranger]),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_build_validates_inputs_and_outputs() {
        let mut b = GraphBuilder::new("g");
        let x = b.input("x").unwrap();
        let add = Layer::new("add", Add);
        let y = b.apply_one(&add, &[x, x]).unwrap();
        assert!(GraphBuilder::new("other").build(&[x], &[y]).is_err());

        let mut b2 = GraphBuilder::new("g2");
        let x2 = b2.input("x").unwrap();
        let y2 = b2.apply_one(&add, &[x2]).unwrap();
        // A non-input tensor cannot be a model input
        assert!(b2.build(&[y2], &[y2]).is_err());
    }

    #[test]
    fn test_layers_are_listed_once() {
        let mut b = GraphBuilder::new("shared");
        let x = b.input("x").unwrap();
        let relu = Layer::new("relu", Activation::new(ActivationKind::Relu));
        let h = b.apply_one(&relu, &[x]).unwrap();
        let y = b.apply_one(&relu, &[h]).unwrap();
        let model = b.build(&[x], &[y]).unwrap();

        assert_eq!(model.layers().len(), 2);
        assert_eq!(relu.inbound_count(), 2);
        assert_eq!(model.outbound_count(&relu), 1);
    }

    #[test]
    fn test_container_may_return_its_input() {
        let mut inner = GraphBuilder::new("identity");
        let ix = inner.input("ix").unwrap();
        let identity = inner.build(&[ix], &[ix]).unwrap();

        let mut b = GraphBuilder::new("outer");
        let x = b.input("x").unwrap();
        let block = Layer::container("block", identity);
        let passed = b.apply_one(&block, &[x]).unwrap();
        assert_eq!(passed, x);
        let relu = Layer::new("relu", Activation::new(ActivationKind::Relu));
        let y = b.apply_one(&relu, &[passed]).unwrap();
        let model = b.build(&[x], &[y]).unwrap();

        let order: Vec<&str> = model
            .execution_order()
            .iter()
            .map(|n| n.layer.name())
            .collect();
        assert_eq!(order, vec!["x", "block", "relu"]);

        let input = arr2(&[[-1.0, 2.0]]).into_dyn();
        let outputs = model.evaluate(&[input]).unwrap();
        assert_eq!(outputs, vec![arr2(&[[0.0, 2.0]]).into_dyn()]);

        let trace = trace_model_execution(&model, &TraceOptions::default()).unwrap();
        let names: Vec<&str> = trace
            .steps
            .iter()
            .filter(|s| !s.is_input())
            .map(|s| s.layer.name())
            .collect();
        assert_eq!(names, vec!["relu"]);
        assert_eq!(trace.steps.last().unwrap().inputs, vec![x]);
    }

    #[test]
    fn test_second_producer_is_rejected() {
        let mut b = GraphBuilder::new("g");
        let x = b.input("x").unwrap();
        let relu = Layer::new("relu", Activation::new(ActivationKind::Relu));
        let y = b.apply_one(&relu, &[x]).unwrap();

        let tanh = Layer::new("tanh", Activation::new(ActivationKind::Tanh));
        assert!(matches!(
            b.push_node(tanh, vec![x], vec![y]),
            Err(Error::GraphIntegrity(_))
        ));
        assert_eq!(b.producers[&y], 1);
    }
}
