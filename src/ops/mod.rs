pub mod tensor;
pub mod activations;
pub mod dense;
pub mod merge;

use std::fmt::Debug;

use crate::error::{Error, Result};

pub use activations::{Activation, ActivationKind};
pub use dense::Dense;
pub use merge::Add;
pub use tensor::Value;

/// A computation that can be applied at one or more nodes of a model
pub trait Operator: Debug + Send + Sync {
    /// Name of the operator class, used to match reverse mappings by type
    fn class_name(&self) -> &'static str;

    /// Compute the output values from the input values
    fn forward(&self, inputs: &[&Value]) -> Result<Vec<Value>>;

    /// Number of outputs produced for the given number of inputs
    fn output_count(&self, _input_count: usize) -> usize {
        1
    }

    /// Current weights, in a stable order
    fn weights(&self) -> Vec<Value> {
        Vec::new()
    }

    /// Replace the weights. The order matches [`Operator::weights`].
    fn set_weights(&mut self, weights: Vec<Value>) -> Result<()> {
        if weights.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidOperator(format!(
                "{} has no weights, got {}",
                self.class_name(),
                weights.len()
            )))
        }
    }

    /// Activation applied to the output, if the operator carries one
    fn activation(&self) -> Option<ActivationKind> {
        None
    }

    /// Build an independent copy from this operator's configuration and weights
    fn clone_operator(&self) -> Box<dyn Operator>;
}

pub(crate) fn expect_inputs(class_name: &str, inputs: &[&Value], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(Error::InvalidOperator(format!(
            "{} requires {} input(s), got {}",
            class_name,
            expected,
            inputs.len()
        )));
    }
    Ok(())
}
