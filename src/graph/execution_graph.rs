use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use super::tracer::{trace_model_execution, ExecutionStep, TraceOptions};
use crate::error::{Error, Result};
use crate::model::{LayerRef, Model, TensorId};

/// Identifier of a non-input node in execution order
pub type NodeId = usize;

/// A traced node together with its neighbourhood
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// `None` for input nodes
    pub nid: Option<NodeId>,
    pub layer: LayerRef,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Node producing each input, `None` when it is a graph input
    pub input_nids: Vec<Option<NodeId>>,
    /// Nodes consuming each output
    pub output_nids: Vec<Vec<NodeId>>,
    /// Layers producing the inputs that have a producing node
    pub input_layers: Vec<LayerRef>,
    /// Layers consuming each output
    pub output_layers: Vec<Vec<LayerRef>>,
}

/// Serializable summary of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub nid: Option<NodeId>,
    pub layer: String,
    pub class_name: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub input_nids: Vec<Option<NodeId>>,
    pub output_nids: Vec<Vec<NodeId>>,
}

impl From<&GraphNode> for NodeSummary {
    fn from(node: &GraphNode) -> Self {
        Self {
            nid: node.nid,
            layer: node.layer.name().to_string(),
            class_name: node.layer.class_name().to_string(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            input_nids: node.input_nids.clone(),
            output_nids: node.output_nids.clone(),
        }
    }
}

/// Id-keyed view of a traced execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
    input_nodes: Vec<GraphNode>,
    producers: HashMap<TensorId, Option<NodeId>>,
    consumers: HashMap<TensorId, Vec<NodeId>>,
}

impl ExecutionGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, nid: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&nid)
    }

    /// Non-input nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Input nodes, only populated when input layers are kept
    pub fn input_nodes(&self) -> &[GraphNode] {
        &self.input_nodes
    }

    /// Node producing `tensor`, `None` for graph inputs and unknown tensors
    pub fn producer_of(&self, tensor: TensorId) -> Option<NodeId> {
        self.producers.get(&tensor).copied().flatten()
    }

    pub fn consumers_of(&self, tensor: TensorId) -> &[NodeId] {
        self.consumers.get(&tensor).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dependency graph between non-input nodes, edges weighted by the tensor
    pub fn to_digraph(&self) -> DiGraph<NodeId, TensorId> {
        let mut graph = DiGraph::new();
        let indices: HashMap<NodeId, NodeIndex> = self
            .nodes
            .keys()
            .map(|&nid| (nid, graph.add_node(nid)))
            .collect();

        for node in self.nodes.values() {
            let Some(nid) = node.nid else { continue };
            for (x, producer) in node.inputs.iter().zip(&node.input_nids) {
                if let Some(producer) = producer {
                    graph.add_edge(indices[producer], indices[&nid], *x);
                }
            }
        }
        graph
    }

    /// Check that the graph is acyclic and that ids follow dependencies
    pub fn validate(&self) -> Result<()> {
        let graph = self.to_digraph();
        toposort(&graph, None).map_err(|cycle| {
            Error::GraphIntegrity(format!(
                "Execution graph has a cycle through node {}",
                graph[cycle.node_id()]
            ))
        })?;

        for node in self.nodes.values() {
            let nid = node.nid.unwrap_or_default();
            if let Some(producer) = node.input_nids.iter().flatten().find(|&&p| p >= nid) {
                return Err(Error::GraphIntegrity(format!(
                    "Node {} consumes the output of later node {}",
                    nid, producer
                )));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> Vec<NodeSummary> {
        self.input_nodes
            .iter()
            .chain(self.nodes.values())
            .map(NodeSummary::from)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }
}

fn nids_as_str<T: fmt::Display>(nids: &[T]) -> String {
    nids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_node(f: &mut fmt::Formatter<'_>, node: &GraphNode) -> fmt::Result {
    let nid = node
        .nid
        .map(|n| n.to_string())
        .unwrap_or_else(|| "None".to_string());
    let inputs_from: Vec<String> = node
        .input_nids
        .iter()
        .map(|n| n.map(|n| n.to_string()).unwrap_or_else(|| "None".to_string()))
        .collect();
    let outputs_to: Vec<String> = node
        .output_nids
        .iter()
        .map(|nids| format!("[{}]", nids_as_str(nids)))
        .collect();

    writeln!(
        f,
        "  [NID: {:>4}] [Layer: {:>20}] [Inputs from: {:>20}] [Outputs to: {:>20}]",
        nid,
        node.layer.name(),
        nids_as_str(&inputs_from),
        nids_as_str(&outputs_to)
    )
}

impl fmt::Display for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.input_nodes.is_empty() {
            writeln!(f, "Graph input layers:")?;
            for node in &self.input_nodes {
                fmt_node(f, node)?;
            }
        }

        writeln!(f, "Graph nodes:")?;
        for node in self.nodes.values() {
            fmt_node(f, node)?;
        }
        Ok(())
    }
}

/// Builds an [`ExecutionGraph`] from a traced execution
pub struct ExecutionGraphBuilder;

impl ExecutionGraphBuilder {
    /// Trace `model` and build its execution graph
    pub fn build(model: &Model, keep_input_layers: bool) -> Result<ExecutionGraph> {
        let trace = trace_model_execution(model, &TraceOptions::default())?;
        Self::from_steps(&trace.steps, keep_input_layers)
    }

    /// Build the graph for steps in execution order
    pub fn from_steps(steps: &[ExecutionStep], keep_input_layers: bool) -> Result<ExecutionGraph> {
        let nids = Self::assign_ids(steps);
        let producers = Self::build_producer_map(steps, &nids)?;
        let consumers = Self::build_consumer_map(steps, &nids, &producers)?;

        let layer_of: HashMap<NodeId, LayerRef> = steps
            .iter()
            .zip(&nids)
            .filter_map(|(step, nid)| nid.map(|nid| (nid, Arc::clone(&step.layer))))
            .collect();

        let mut graph = ExecutionGraph {
            nodes: BTreeMap::new(),
            input_nodes: Vec::new(),
            producers,
            consumers,
        };

        for (step, &nid) in steps.iter().zip(&nids) {
            let input_nids: Vec<Option<NodeId>> = if step.is_input() {
                Vec::new()
            } else {
                step.inputs
                    .iter()
                    .map(|x| graph.producer_of(*x))
                    .collect()
            };
            let output_nids: Vec<Vec<NodeId>> = step
                .outputs
                .iter()
                .map(|y| graph.consumers_of(*y).to_vec())
                .collect();

            let input_layers = input_nids
                .iter()
                .flatten()
                .map(|nid| Arc::clone(&layer_of[nid]))
                .collect();
            let output_layers = output_nids
                .iter()
                .map(|nids| nids.iter().map(|nid| Arc::clone(&layer_of[nid])).collect())
                .collect();

            let node = GraphNode {
                nid,
                layer: Arc::clone(&step.layer),
                inputs: step.inputs.clone(),
                outputs: step.outputs.clone(),
                input_nids,
                output_nids,
                input_layers,
                output_layers,
            };

            match nid {
                Some(nid) => {
                    graph.nodes.insert(nid, node);
                }
                None if keep_input_layers => graph.input_nodes.push(node),
                None => {}
            }
        }

        Ok(graph)
    }

    /// Sequential ids for non-input steps, `None` for input steps
    fn assign_ids(steps: &[ExecutionStep]) -> Vec<Option<NodeId>> {
        let mut next = 0;
        steps
            .iter()
            .map(|step| {
                if step.is_input() {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect()
    }

    /// Map every produced tensor to its producing node. Input steps map their
    /// tensor to `None`.
    fn build_producer_map(
        steps: &[ExecutionStep],
        nids: &[Option<NodeId>],
    ) -> Result<HashMap<TensorId, Option<NodeId>>> {
        let mut producers = HashMap::new();
        for (step, nid) in steps.iter().zip(nids) {
            for y in &step.outputs {
                if producers.insert(*y, *nid).is_some() {
                    return Err(Error::GraphIntegrity(format!(
                        "Tensor {} has more than one producing node (layer '{}')",
                        y,
                        step.layer.name()
                    )));
                }
            }
        }
        Ok(producers)
    }

    fn build_consumer_map(
        steps: &[ExecutionStep],
        nids: &[Option<NodeId>],
        producers: &HashMap<TensorId, Option<NodeId>>,
    ) -> Result<HashMap<TensorId, Vec<NodeId>>> {
        let mut consumers: HashMap<TensorId, Vec<NodeId>> = HashMap::new();
        for (step, nid) in steps.iter().zip(nids) {
            let Some(nid) = nid else { continue };
            for x in &step.inputs {
                if !producers.contains_key(x) {
                    return Err(Error::GraphIntegrity(format!(
                        "Tensor {} consumed by node {} has no producing node",
                        x, nid
                    )));
                }
                consumers.entry(*x).or_default().push(*nid);
            }
        }
        Ok(consumers)
    }
}

/// Trace `model` and return its execution graph
pub fn build_execution_graph(model: &Model, keep_input_layers: bool) -> Result<ExecutionGraph> {
    ExecutionGraphBuilder::build(model, keep_input_layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphBuilder, Layer};
    use crate::ops::{Activation, ActivationKind, Add};

    fn diamond() -> Model {
        let mut b = GraphBuilder::new("diamond");
        let x = b.input("x").unwrap();
        let left = Layer::new("left", Activation::new(ActivationKind::Relu));
        let right = Layer::new("right", Activation::new(ActivationKind::Tanh));
        let merge = Layer::new("merge", Add);
        let l = b.apply_one(&left, &[x]).unwrap();
        let r = b.apply_one(&right, &[x]).unwrap();
        let y = b.apply_one(&merge, &[l, r]).unwrap();
        b.build(&[x], &[y]).unwrap()
    }

    #[test]
    fn test_ids_and_links() {
        let model = diamond();
        let graph = build_execution_graph(&model, false).unwrap();

        assert_eq!(graph.len(), 3);
        assert!(graph.input_nodes().is_empty());
        graph.validate().unwrap();

        let merge = graph.node(2).unwrap();
        assert_eq!(merge.layer.name(), "merge");
        let mut from = merge.input_nids.clone();
        from.sort();
        assert_eq!(from, vec![Some(0), Some(1)]);
        assert_eq!(merge.output_nids, vec![Vec::<NodeId>::new()]);

        let x = model.inputs()[0];
        let mut consumers = graph.consumers_of(x).to_vec();
        consumers.sort();
        assert_eq!(consumers, vec![0, 1]);
        assert_eq!(graph.producer_of(x), None);
        assert_eq!(graph.producer_of(merge.outputs[0]), Some(2));
    }

    #[test]
    fn test_keep_input_layers_and_dump() {
        let model = diamond();
        let graph = build_execution_graph(&model, true).unwrap();

        assert_eq!(graph.input_nodes().len(), 1);
        assert_eq!(graph.input_nodes()[0].nid, None);
        assert_eq!(graph.input_nodes()[0].output_nids.len(), 1);

        let dump = graph.to_string();
        assert!(dump.starts_with("Graph input layers:"));
        assert!(dump.contains("Graph nodes:"));
        assert!(dump.contains("merge"));

        let json = graph.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_duplicate_producer_is_rejected() {
        let layer = Layer::new("relu", Activation::default());
        let input = Layer::input("x");
        let x = TensorId::fresh();
        let y = TensorId::fresh();
        let steps = vec![
            ExecutionStep { layer: input, inputs: vec![x], outputs: vec![x] },
            ExecutionStep { layer: layer.clone(), inputs: vec![x], outputs: vec![y] },
            ExecutionStep { layer, inputs: vec![x], outputs: vec![y] },
        ];

        assert!(matches!(
            ExecutionGraphBuilder::from_steps(&steps, false),
            Err(Error::GraphIntegrity(_))
        ));
    }

    #[test]
    fn test_consumed_tensor_without_producer_is_rejected() {
        let layer = Layer::new("relu", Activation::default());
        let steps = vec![ExecutionStep {
            layer,
            inputs: vec![TensorId::fresh()],
            outputs: vec![TensorId::fresh()],
        }];

        assert!(ExecutionGraphBuilder::from_steps(&steps, false).is_err());
    }
}
