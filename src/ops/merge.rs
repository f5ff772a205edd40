use super::{Operator, Value};
use crate::error::{Error, Result};

/// Elementwise sum of all inputs
#[derive(Debug, Clone, Default)]
pub struct Add;

impl Operator for Add {
    fn class_name(&self) -> &'static str {
        "Add"
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let (first, rest) = inputs.split_first().ok_or_else(|| {
            Error::InvalidOperator("Add requires at least 1 input, got 0".to_string())
        })?;

        let mut total = (*first).clone();
        for input in rest {
            if input.shape() != total.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "Add inputs have shapes {:?} and {:?}",
                    total.shape(),
                    input.shape()
                )));
            }
            total += *input;
        }

        Ok(vec![total])
    }

    fn clone_operator(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_add() {
        let a = arr1(&[1.0, 2.0]).into_dyn();
        let b = arr1(&[3.0, -2.0]).into_dyn();
        let y = Add.forward(&[&a, &b]).unwrap();
        assert_eq!(y[0], arr1(&[4.0, 0.0]).into_dyn());
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = arr1(&[1.0, 2.0]).into_dyn();
        let b = arr1(&[3.0]).into_dyn();
        assert!(Add.forward(&[&a, &b]).is_err());
        assert!(Add.forward(&[]).is_err());
    }
}
