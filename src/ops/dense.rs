use ndarray::{Array1, Array2, Ix1, Ix2};

use super::{expect_inputs, ActivationKind, Operator, Value};
use crate::error::{Error, Result};

/// Fully connected layer: `activation(x . kernel + bias)`
///
/// The kernel has shape `(input_dim, units)`. Inputs are rank-2 batches of
/// shape `(batch, input_dim)`.
#[derive(Debug, Clone)]
pub struct Dense {
    kernel: Array2<f32>,
    bias: Option<Array1<f32>>,
    activation: ActivationKind,
}

impl Dense {
    /// Create a dense layer without bias and with a linear activation
    pub fn new(kernel: Array2<f32>) -> Self {
        Self {
            kernel,
            bias: None,
            activation: ActivationKind::Linear,
        }
    }

    /// Attach a bias vector of length `units`
    pub fn with_bias(mut self, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != self.units() {
            return Err(Error::ShapeMismatch(format!(
                "Dense bias has {} elements, expected {}",
                bias.len(),
                self.units()
            )));
        }
        self.bias = Some(bias);
        Ok(self)
    }

    /// Set the output activation
    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn kernel(&self) -> &Array2<f32> {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn units(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }
}

impl Operator for Dense {
    fn class_name(&self) -> &'static str {
        "Dense"
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.class_name(), inputs, 1)?;

        let x = inputs[0].view().into_dimensionality::<Ix2>()?;
        if x.ncols() != self.input_dim() {
            return Err(Error::ShapeMismatch(format!(
                "Dense expects {} input features, got {}",
                self.input_dim(),
                x.ncols()
            )));
        }

        let mut y = x.dot(&self.kernel);
        if let Some(bias) = &self.bias {
            y += bias;
        }

        Ok(vec![self.activation.apply(&y.into_dyn())])
    }

    fn weights(&self) -> Vec<Value> {
        let mut weights = vec![self.kernel.clone().into_dyn()];
        if let Some(bias) = &self.bias {
            weights.push(bias.clone().into_dyn());
        }
        weights
    }

    fn set_weights(&mut self, weights: Vec<Value>) -> Result<()> {
        let expected = if self.bias.is_some() { 2 } else { 1 };
        if weights.len() != expected {
            return Err(Error::InvalidOperator(format!(
                "Dense expects {} weight arrays, got {}",
                expected,
                weights.len()
            )));
        }

        let mut weights = weights.into_iter();
        if let Some(kernel) = weights.next() {
            let kernel = kernel.into_dimensionality::<Ix2>()?;
            if kernel.dim() != self.kernel.dim() {
                return Err(Error::ShapeMismatch(format!(
                    "Dense kernel has shape {:?}, expected {:?}",
                    kernel.dim(),
                    self.kernel.dim()
                )));
            }
            self.kernel = kernel;
        }
        if let Some(bias) = weights.next() {
            let bias = bias.into_dimensionality::<Ix1>()?;
            if bias.len() != self.units() {
                return Err(Error::ShapeMismatch(format!(
                    "Dense bias has {} elements, expected {}",
                    bias.len(),
                    self.units()
                )));
            }
            self.bias = Some(bias);
        }

        Ok(())
    }

    fn activation(&self) -> Option<ActivationKind> {
        Some(self.activation)
    }

    fn clone_operator(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_dense_forward() {
        let dense = Dense::new(arr2(&[[1.0, -1.0], [2.0, 0.5]]))
            .with_bias(arr1(&[0.5, 0.0]))
            .unwrap()
            .with_activation(ActivationKind::Relu);

        let x = arr2(&[[1.0, 1.0]]).into_dyn();
        let y = dense.forward(&[&x]).unwrap();

        // [1 + 2 + 0.5, -1 + 0.5 + 0] -> relu -> [3.5, 0]
        assert_eq!(y[0], arr2(&[[3.5, 0.0]]).into_dyn());
    }

    #[test]
    fn test_dense_rejects_wrong_feature_count() {
        let dense = Dense::new(arr2(&[[1.0], [1.0]]));
        let x = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();
        assert!(matches!(dense.forward(&[&x]), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_dense_set_weights() {
        let mut dense = Dense::new(arr2(&[[1.0, 1.0]]));
        dense
            .set_weights(vec![arr2(&[[2.0, 3.0]]).into_dyn()])
            .unwrap();
        assert_eq!(dense.kernel(), &arr2(&[[2.0, 3.0]]));

        // Wrong count and wrong shape are both refused
        assert!(dense.set_weights(vec![]).is_err());
        assert!(dense
            .set_weights(vec![arr2(&[[1.0], [1.0]]).into_dyn()])
            .is_err());
    }
}
