use std::collections::{HashMap, HashSet};

use log::trace;

use super::tracer::ExecutionStep;
use crate::model::TensorId;

/// Tensors through which all forward information has to pass.
///
/// Walks the steps forward while tracking the set of open connections, the
/// produced tensors still waiting for their producer to run. When a step
/// closes the last open connection and has a single input, its input and its
/// first output are bottlenecks. Steps with several inputs are never marked,
/// even when they close the set.
pub fn get_bottleneck_tensors(
    inputs: &[TensorId],
    outputs: &[TensorId],
    steps: &[ExecutionStep],
) -> HashSet<TensorId> {
    let mut forward_connections: HashMap<TensorId, Vec<TensorId>> = HashMap::new();
    for step in steps.iter().filter(|step| !step.is_input()) {
        for x in &step.inputs {
            forward_connections
                .entry(*x)
                .or_default()
                .extend(step.outputs.iter().copied());
        }
    }

    let outputs: HashSet<TensorId> = outputs.iter().copied().collect();
    let mut open: HashSet<TensorId> = inputs
        .iter()
        .filter_map(|x| forward_connections.get(x))
        .flatten()
        .copied()
        .collect();

    let mut bottlenecks = HashSet::new();
    for step in steps.iter().filter(|step| !step.is_input()) {
        for y in &step.outputs {
            if !open.remove(y) {
                trace!("Tensor {} closed without being open", y);
            }
        }

        if open.is_empty() && step.inputs.len() == 1 {
            bottlenecks.insert(step.inputs[0]);
            if let Some(y) = step.outputs.first() {
                bottlenecks.insert(*y);
            }
        }

        for y in step.outputs.iter().filter(|y| !outputs.contains(y)) {
            if let Some(next) = forward_connections.get(y) {
                open.extend(next.iter().copied());
            }
        }
    }

    bottlenecks
}
