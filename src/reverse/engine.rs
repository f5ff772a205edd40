use std::collections::HashSet;

use log::debug;

use super::options::ReverseOptions;
use super::registry::{ReverseContext, ReverseMappingRegistry};
use super::tensors::{ContributionSource, PostProcessing, ReversedTensors};
use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, TensorValues};
use crate::graph::bottleneck::get_bottleneck_tensors;
use crate::graph::tracer::{trace_model_execution, ModelTrace};
use crate::model::{Model, TensorId};
use crate::ops::Value;

/// Maps the value of a model output to the value seeding its reversal
pub type HeadMapping<'a> = dyn Fn(TensorId, &Value) -> Result<Value> + 'a;

/// Outcome of a reverse propagation run
#[derive(Debug, Clone)]
pub struct ReverseResult {
    /// One reversed value per model input, in input order
    pub reversed_inputs: Vec<Value>,
    /// Every reversed tensor, when requested
    pub reversed_tensors: Option<ReversedTensors>,
}

/// Walks a traced model backwards, calling one reverse mapping per node.
///
/// Reversed values of tensors consumed by several nodes are summed before
/// they are handed on. Each run owns its reversed-tensor table.
pub struct ReverseEngine<'a> {
    model: &'a Model,
    registry: &'a ReverseMappingRegistry,
    options: ReverseOptions,
    head_mapping: Option<Box<HeadMapping<'a>>>,
}

impl<'a> ReverseEngine<'a> {
    pub fn new(model: &'a Model, registry: &'a ReverseMappingRegistry) -> Self {
        Self {
            model,
            registry,
            options: ReverseOptions::default(),
            head_mapping: None,
        }
    }

    pub fn with_options(mut self, options: ReverseOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the identity used to seed the model outputs
    pub fn with_head_mapping<F>(mut self, head_mapping: F) -> Self
    where
        F: Fn(TensorId, &Value) -> Result<Value> + 'a,
    {
        self.head_mapping = Some(Box::new(head_mapping));
        self
    }

    pub fn options(&self) -> &ReverseOptions {
        &self.options
    }

    /// Trace and evaluate the model on `input_values`, then reverse it
    pub fn run(&self, input_values: &[Value]) -> Result<ReverseResult> {
        self.options.validate()?;

        let trace = trace_model_execution(self.model, &self.options.trace)?;
        let values = ExecutionEngine::evaluate(self.model, &trace, input_values)?;
        self.run_on_trace(&trace, &values)
    }

    /// Reverse an existing trace whose forward values are already known
    pub fn run_on_trace(&self, trace: &ModelTrace, values: &TensorValues) -> Result<ReverseResult> {
        self.options.validate()?;

        let mut mappings = self.registry.initialize(&trace.layers, self.model)?;

        let bottlenecks = if self.options.bottleneck_projection.is_enabled() {
            get_bottleneck_tensors(self.model.inputs(), &trace.outputs, &trace.steps)
        } else {
            HashSet::new()
        };
        debug!(
            "Reversing model '{}': {} nodes, {} bottleneck tensors",
            self.model.name(),
            trace.non_input_count(),
            bottlenecks.len()
        );

        let mut reversed = ReversedTensors::new(PostProcessing {
            bottlenecks,
            projection: self.options.bottleneck_projection,
            clip_range: self.options.clip_range,
        })?;

        let heads = trace
            .outputs
            .iter()
            .map(|&y| {
                let value = values.get(y)?;
                match &self.head_mapping {
                    Some(head_mapping) => head_mapping(y, value),
                    None => Ok(value.clone()),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        reversed.add_contributions(ContributionSource::Head, &trace.outputs, heads)?;

        let mut nid = trace.non_input_count();
        for step in trace.steps.iter().rev() {
            if step.is_input() {
                continue;
            }
            nid -= 1;

            if step.layer.is_container() {
                return Err(Error::GraphIntegrity(format!(
                    "Container '{}' left in the trace at reverse node {}",
                    step.layer.name(),
                    nid
                )));
            }

            if !step.outputs.iter().all(|&y| reversed.contains(y)) {
                debug!(
                    "[NID: {}] Skipping layer-node {}: outputs not reached from the model outputs",
                    nid,
                    step.layer.name()
                );
                continue;
            }

            let reversed_ys = step
                .outputs
                .iter()
                .map(|&y| reversed.get_final(y))
                .collect::<Result<Vec<_>>>()?;

            debug!("[NID: {}] Reverse layer-node {}", nid, step.layer.name());
            let mapping = match mappings.get_mut(&step.layer.id()) {
                Some(Some(mapping)) => mapping,
                _ => {
                    return Err(Error::UnsupportedOperator {
                        layer: step.layer.name().to_string(),
                        class_name: step.layer.class_name().to_string(),
                        node_id: nid,
                    })
                }
            };

            let xs = values.get_all(&step.inputs)?;
            let ys = values.get_all(&step.outputs)?;
            let ctx = ReverseContext {
                reverse_node_id: nid,
                model: self.model,
                layer: &step.layer,
                inputs: &step.inputs,
                outputs: &step.outputs,
            };
            let reversed_xs = mapping.apply(&xs, &ys, &reversed_ys, &ctx)?;

            if reversed_xs.len() != step.inputs.len() {
                return Err(Error::GraphIntegrity(format!(
                    "Reverse mapping of '{}' returned {} values for {} inputs",
                    step.layer.name(),
                    reversed_xs.len(),
                    step.inputs.len()
                )));
            }
            reversed.add_contributions(ContributionSource::Node(nid), &step.inputs, reversed_xs)?;
        }

        let reversed_inputs = self
            .model
            .inputs()
            .iter()
            .map(|&x| reversed.get_final(x))
            .collect::<Result<Vec<_>>>()?;

        let reversed_tensors = if self.options.return_all_reversed_tensors {
            Some(reversed)
        } else {
            None
        };

        Ok(ReverseResult {
            reversed_inputs,
            reversed_tensors,
        })
    }
}

/// Reverse `model` on `input_values` with the mappings of `registry`
pub fn reverse_model(
    model: &Model,
    registry: &ReverseMappingRegistry,
    input_values: &[Value],
    options: ReverseOptions,
) -> Result<ReverseResult> {
    ReverseEngine::new(model, registry)
        .with_options(options)
        .run(input_values)
}
