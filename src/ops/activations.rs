use std::fmt;

use ndarray::Axis;

use super::{expect_inputs, Operator, Value};
use crate::error::Result;

/// Elementwise (or, for softmax, lane-wise) activation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    /// Normalized over the last axis
    Softmax,
}

impl ActivationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Linear => "linear",
            ActivationKind::Relu => "relu",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
            ActivationKind::Softmax => "softmax",
        }
    }

    /// Apply the activation to a value
    pub fn apply(&self, x: &Value) -> Value {
        match self {
            ActivationKind::Linear => x.clone(),
            ActivationKind::Relu => x.mapv(|v| if v > 0.0 { v } else { 0.0 }),
            ActivationKind::Sigmoid => x.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            ActivationKind::Tanh => x.mapv(f32::tanh),
            ActivationKind::Softmax => softmax(x),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn softmax(x: &Value) -> Value {
    if x.ndim() == 0 {
        return x.mapv(|_| 1.0);
    }

    let mut out = x.clone();
    let axis = Axis(out.ndim() - 1);
    for mut lane in out.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Standalone activation layer
#[derive(Debug, Clone, Default)]
pub struct Activation {
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Operator for Activation {
    fn class_name(&self) -> &'static str {
        "Activation"
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.class_name(), inputs, 1)?;
        Ok(vec![self.kind.apply(inputs[0])])
    }

    fn activation(&self) -> Option<ActivationKind> {
        Some(self.kind)
    }

    fn clone_operator(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}
