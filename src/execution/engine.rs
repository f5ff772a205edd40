use std::collections::HashMap;

use log::debug;

use crate::error::{Error, Result};
use crate::graph::tracer::{trace_model_execution, ModelTrace, TraceOptions};
use crate::model::{Model, TensorId};
use crate::ops::Value;

/// Values of the tensors computed by a forward pass
#[derive(Debug, Clone, Default)]
pub struct TensorValues {
    values: HashMap<TensorId, Value>,
}

impl TensorValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: TensorId, value: Value) {
        self.values.insert(tensor, value);
    }

    /// Value of a tensor, failing when it was never computed
    pub fn get(&self, tensor: TensorId) -> Result<&Value> {
        self.values.get(&tensor).ok_or_else(|| {
            Error::GraphIntegrity(format!("Tensor {} has no forward value", tensor))
        })
    }

    pub fn get_all(&self, tensors: &[TensorId]) -> Result<Vec<&Value>> {
        tensors.iter().map(|&t| self.get(t)).collect()
    }

    pub fn contains(&self, tensor: TensorId) -> bool {
        self.values.contains_key(&tensor)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Value)> {
        self.values.iter()
    }
}

/// Numeric forward execution over traced models
pub struct ExecutionEngine;

impl ExecutionEngine {
    /// Evaluate every step of `trace`, binding `input_values` to the model inputs
    pub fn evaluate(model: &Model, trace: &ModelTrace, input_values: &[Value]) -> Result<TensorValues> {
        if input_values.len() != model.inputs().len() {
            return Err(Error::InvalidGraph(format!(
                "Model '{}' expects {} inputs, got {}",
                model.name(),
                model.inputs().len(),
                input_values.len()
            )));
        }

        let mut values = TensorValues::new();
        for (&x, value) in model.inputs().iter().zip(input_values) {
            values.insert(x, value.clone());
        }

        for step in &trace.steps {
            if step.is_input() {
                if let Some(x) = step.outputs.iter().find(|&&x| !values.contains(x)) {
                    return Err(Error::GraphIntegrity(format!(
                        "Input tensor {} of layer '{}' is not a model input",
                        x,
                        step.layer.name()
                    )));
                }
                continue;
            }

            if step.layer.is_container() {
                return Err(Error::GraphIntegrity(format!(
                    "Container '{}' was not flattened before evaluation",
                    step.layer.name()
                )));
            }

            let ys = {
                let xs = values.get_all(&step.inputs)?;
                step.layer.forward(&xs)?
            };
            if ys.len() != step.outputs.len() {
                return Err(Error::GraphIntegrity(format!(
                    "Layer '{}' returned {} values for {} outputs",
                    step.layer.name(),
                    ys.len(),
                    step.outputs.len()
                )));
            }
            for (&y, value) in step.outputs.iter().zip(ys) {
                values.insert(y, value);
            }
        }

        debug!("Evaluated {} tensors of model '{}'", values.len(), model.name());
        Ok(values)
    }

    /// Trace the model and return the values of its outputs
    pub fn predict(model: &Model, input_values: &[Value], options: &TraceOptions) -> Result<Vec<Value>> {
        let trace = trace_model_execution(model, options)?;
        let values = Self::evaluate(model, &trace, input_values)?;
        trace
            .outputs
            .iter()
            .map(|&y| values.get(y).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphBuilder, Layer};
    use crate::ops::{ActivationKind, Dense};
    use ndarray::arr2;

    #[test]
    fn test_predict_matches_direct_evaluation() {
        let mut b = GraphBuilder::new("mlp");
        let x = b.input("x").unwrap();
        let d1 = Layer::new(
            "d1",
            Dense::new(arr2(&[[1.0, -1.0], [0.5, 2.0]])).with_activation(ActivationKind::Relu),
        );
        let d2 = Layer::new("d2", Dense::new(arr2(&[[1.0], [1.0]])));
        let h = b.apply_one(&d1, &[x]).unwrap();
        let y = b.apply_one(&d2, &[h]).unwrap();
        let model = b.build(&[x], &[y]).unwrap();

        let input = arr2(&[[1.0, 1.0], [2.0, -1.0]]).into_dyn();
        let traced = ExecutionEngine::predict(&model, &[input.clone()], &TraceOptions::default()).unwrap();
        let direct = model.evaluate(&[input]).unwrap();

        assert_eq!(traced, direct);
        // Row 0: relu([1.5, 1.0]) -> 2.5; row 1: relu([1.5, -4.0]) -> 1.5
        assert_eq!(traced[0], arr2(&[[2.5], [1.5]]).into_dyn());
    }

    #[test]
    fn test_evaluate_checks_input_count() {
        let mut b = GraphBuilder::new("g");
        let x = b.input("x").unwrap();
        let model = b.build(&[x], &[x]).unwrap();
        let trace = trace_model_execution(&model, &TraceOptions::default()).unwrap();

        assert!(ExecutionEngine::evaluate(&model, &trace, &[]).is_err());
    }
}
