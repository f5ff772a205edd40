use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use super::instrument::{with_instrumentation, RecordedCall};
use crate::error::{Error, Result};
use crate::model::{Layer, LayerId, LayerRef, Model, TensorId};

/// One node of a linearized execution
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub layer: LayerRef,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl ExecutionStep {
    /// Whether this step only introduces a graph input
    pub fn is_input(&self) -> bool {
        self.layer.is_input()
    }
}

/// Result of tracing a model
#[derive(Debug, Clone)]
pub struct ModelTrace {
    /// Every layer reachable from the model, containers included
    pub layers: Vec<LayerRef>,
    /// Steps in a valid execution order
    pub steps: Vec<ExecutionStep>,
    /// Model outputs as they appear in `steps`
    pub outputs: Vec<TensorId>,
}

impl ModelTrace {
    /// Number of steps that are not input steps
    pub fn non_input_count(&self) -> usize {
        self.steps.iter().filter(|step| !step.is_input()).count()
    }
}

/// Options controlling how a model's execution is traced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceOptions {
    /// Replay on copies of the layers so the originals keep their node history
    pub reapply_on_copied_operators: bool,
    /// Replay even when the native depth index would suffice
    pub force_replay: bool,
}

impl TraceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reapply_on_copied_operators(mut self, enable: bool) -> Self {
        self.reapply_on_copied_operators = enable;
        self
    }

    pub fn force_replay(mut self, enable: bool) -> Self {
        self.force_replay = enable;
        self
    }
}

/// Collect all layers of a model, descending into containers.
///
/// Layers are listed in pre-order and only once, even when shared.
pub fn get_model_layers(model: &Model) -> Vec<LayerRef> {
    fn collect(model: &Model, seen: &mut HashSet<LayerId>, out: &mut Vec<LayerRef>) {
        for layer in model.layers() {
            if !seen.insert(layer.id()) {
                continue;
            }
            out.push(Arc::clone(layer));
            if let Some(inner) = layer.container_model() {
                collect(inner, seen, out);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut layers = Vec::new();
    collect(model, &mut seen, &mut layers);
    layers
}

/// Layers of the model matching `condition`
pub fn model_contains<F>(model: &Model, condition: F) -> Vec<LayerRef>
where
    F: Fn(&Layer) -> bool,
{
    get_model_layers(model)
        .into_iter()
        .filter(|layer| condition(layer))
        .collect()
}

/// Layers of the model matching each condition, one list per condition
pub fn model_contains_all(model: &Model, conditions: &[&dyn Fn(&Layer) -> bool]) -> Vec<Vec<LayerRef>> {
    let layers = get_model_layers(model);
    conditions
        .iter()
        .map(|condition| {
            layers
                .iter()
                .filter(|layer| condition(layer))
                .cloned()
                .collect()
        })
        .collect()
}

/// Linearize the execution of a model and its nested containers
pub fn trace_model_execution(model: &Model, options: &TraceOptions) -> Result<ModelTrace> {
    let layers = get_model_layers(model);
    let contains_container = layers.iter().any(|layer| layer.is_container());

    let (layers, steps, outputs) = if contains_container || options.force_replay {
        debug!(
            "Tracing model '{}' by replay ({} layers, containers: {})",
            model.name(),
            layers.len(),
            contains_container
        );
        trace_by_replay(model, layers, options)?
    } else {
        debug!("Tracing model '{}' from its depth index", model.name());
        let (steps, outputs) = trace_from_depth_index(model);
        (layers, steps, outputs)
    };

    let traced = steps.len();
    let steps = prune_unreachable(steps, &outputs);
    debug!(
        "Traced {} steps for model '{}', {} unreachable dropped",
        steps.len(),
        model.name(),
        traced - steps.len()
    );

    Ok(ModelTrace {
        layers,
        steps,
        outputs,
    })
}

fn trace_from_depth_index(model: &Model) -> (Vec<ExecutionStep>, Vec<TensorId>) {
    let steps = model
        .execution_order()
        .into_iter()
        .map(|node| ExecutionStep {
            layer: Arc::clone(&node.layer),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        })
        .collect();

    (steps, model.outputs().to_vec())
}

fn trace_by_replay(
    model: &Model,
    layers: Vec<LayerRef>,
    options: &TraceOptions,
) -> Result<(Vec<LayerRef>, Vec<ExecutionStep>, Vec<TensorId>)> {
    let (shadow_outputs, calls) =
        with_instrumentation(&layers, || model.call_symbolic(model.inputs(), true))?;

    let mut layer_mapping: HashMap<LayerId, LayerRef> = HashMap::with_capacity(layers.len());
    for layer in &layers {
        let mapped = if options.reapply_on_copied_operators
            && !layer.is_input()
            && !layer.is_container()
        {
            layer.copy()?
        } else {
            Arc::clone(layer)
        };
        layer_mapping.insert(layer.id(), mapped);
    }

    let mut substitution: HashMap<TensorId, TensorId> =
        model.inputs().iter().map(|&x| (x, x)).collect();
    let steps = reapply_calls(&calls, &layer_mapping, &mut substitution)?;

    let outputs = shadow_outputs
        .iter()
        .map(|y| lookup(&substitution, y))
        .collect::<Result<Vec<_>>>()?;
    let layers = layers
        .iter()
        .map(|layer| Arc::clone(&layer_mapping[&layer.id()]))
        .collect();

    Ok((layers, steps, outputs))
}

/// Re-apply recorded calls on fresh tensors.
///
/// Input calls pass through unchanged. Container calls are inlined: the calls
/// recorded inside them already bound their outputs.
fn reapply_calls(
    calls: &[RecordedCall],
    layer_mapping: &HashMap<LayerId, LayerRef>,
    substitution: &mut HashMap<TensorId, TensorId>,
) -> Result<Vec<ExecutionStep>> {
    let mut steps = Vec::with_capacity(calls.len());

    for call in calls {
        let layer = layer_mapping.get(&call.layer).ok_or_else(|| {
            Error::GraphIntegrity(format!("Recorded call of unknown layer {}", call.layer))
        })?;

        if layer.is_container() {
            continue;
        }

        let (inputs, outputs) = if layer.is_input() {
            (call.inputs.clone(), call.outputs.clone())
        } else {
            let inputs = call
                .inputs
                .iter()
                .map(|x| lookup(substitution, x))
                .collect::<Result<Vec<_>>>()?;
            let outputs = layer.call(&inputs)?;
            (inputs, outputs)
        };

        if outputs.len() != call.outputs.len() {
            return Err(Error::GraphIntegrity(format!(
                "Layer '{}' produced {} outputs on replay, expected {}",
                layer.name(),
                outputs.len(),
                call.outputs.len()
            )));
        }
        substitution.extend(call.outputs.iter().copied().zip(outputs.iter().copied()));

        steps.push(ExecutionStep {
            layer: Arc::clone(layer),
            inputs,
            outputs,
        });
    }

    Ok(steps)
}

fn lookup(substitution: &HashMap<TensorId, TensorId>, tensor: &TensorId) -> Result<TensorId> {
    substitution.get(tensor).copied().ok_or_else(|| {
        Error::GraphIntegrity(format!("Tensor {} was not produced during replay", tensor))
    })
}

/// Drop steps that do not contribute to `outputs`.
///
/// A layer applied elsewhere leaves steps whose outputs nobody needs. A step
/// is kept only when all of its outputs are needed.
pub fn prune_unreachable(steps: Vec<ExecutionStep>, outputs: &[TensorId]) -> Vec<ExecutionStep> {
    let mut needed: HashSet<TensorId> = outputs.iter().copied().collect();
    let mut kept = Vec::with_capacity(steps.len());

    for step in steps.into_iter().rev() {
        if step.outputs.iter().all(|y| needed.contains(y)) {
            needed.extend(step.inputs.iter().copied());
            kept.push(step);
        }
    }

    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GraphBuilder;
    use crate::ops::{Activation, ActivationKind};

    fn relu() -> LayerRef {
        Layer::new("relu", Activation::new(ActivationKind::Relu))
    }

    #[test]
    fn test_prune_keeps_only_needed_steps() {
        let mut b = GraphBuilder::new("g");
        let x = b.input("x").unwrap();
        let used = relu();
        let unused = relu();
        let y = b.apply_one(&used, &[x]).unwrap();
        b.apply_one(&unused, &[x]).unwrap();
        let model = b.build(&[x], &[y]).unwrap();

        let trace = trace_model_execution(&model, &TraceOptions::default()).unwrap();
        let ids: Vec<LayerId> = trace.steps.iter().map(|s| s.layer.id()).collect();
        assert_eq!(trace.steps.len(), 2);
        assert!(ids.contains(&used.id()));
        assert!(!ids.contains(&unused.id()));
    }

    #[test]
    fn test_get_model_layers_descends_into_containers() {
        let mut inner = GraphBuilder::new("inner");
        let a = inner.input("a").unwrap();
        let inner_relu = relu();
        let b_out = inner.apply_one(&inner_relu, &[a]).unwrap();
        let inner_model = inner.build(&[a], &[b_out]).unwrap();
        let container = Layer::container("block", inner_model);

        let mut outer = GraphBuilder::new("outer");
        let x = outer.input("x").unwrap();
        let y = outer.apply_one(&container, &[x]).unwrap();
        let model = outer.build(&[x], &[y]).unwrap();

        let layers = get_model_layers(&model);
        let names: Vec<&str> = layers.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["x", "block", "a", "relu"]);

        let containers = model_contains(&model, |l| l.is_container());
        assert_eq!(containers.len(), 1);

        let counts: Vec<usize> = model_contains_all(&model, &[&|l: &Layer| l.is_input(), &|l: &Layer| {
            l.class_name() == "Activation"
        }])
        .iter()
        .map(Vec::len)
        .collect();
        assert_eq!(counts, vec![2, 1]);
    }
}
