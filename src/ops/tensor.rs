use ndarray::{ArrayD, Axis};
use num_traits::Float;

use crate::error::{Error, Result};

/// Numeric value carried by a tensor during evaluation and reversal
pub type Value = ArrayD<f32>;

/// Divide `a` by `b`, leaving `a` unchanged when `b` is zero
pub fn safe_divide<F: Float>(a: F, b: F) -> F {
    if b == F::zero() {
        a
    } else {
        a / b
    }
}

/// Sum values elementwise. All values must share one shape.
pub fn sum_values(values: &[Value]) -> Result<Value> {
    let (first, rest) = values.split_first().ok_or_else(|| {
        Error::ShapeMismatch("cannot sum an empty list of values".to_string())
    })?;

    let mut total = first.clone();
    for (i, value) in rest.iter().enumerate() {
        if value.shape() != total.shape() {
            return Err(Error::ShapeMismatch(format!(
                "value {} has shape {:?}, expected {:?}",
                i + 1,
                value.shape(),
                total.shape()
            )));
        }
        total += value;
    }

    Ok(total)
}

/// Clamp every element into `[lo, hi]`
pub fn clip_value(value: &Value, lo: f32, hi: f32) -> Value {
    value.mapv(|x| x.clamp(lo, hi))
}

fn abs_max<'a, I: IntoIterator<Item = &'a f32>>(values: I) -> f32 {
    values.into_iter().fold(0.0f32, |m, x| m.max(x.abs()))
}

/// Project a value into a bounded range.
///
/// Each sample (axis 0) is divided by its largest absolute element, which puts
/// it into `[-1, 1]`. Without an output range the result is clipped to
/// `[-1, 1]`; with `(a, b)` it is mapped onto `[0, 1]`, clipped, and rescaled
/// into `[a, b]`. Values of rank 0 or 1 are normalized as a whole.
pub fn project_value(value: &Value, output_range: Option<(f32, f32)>) -> Value {
    let mut projected = value.clone();

    if projected.ndim() < 2 {
        let max = abs_max(projected.iter());
        projected.mapv_inplace(|x| safe_divide(x, max));
    } else {
        for mut sample in projected.axis_iter_mut(Axis(0)) {
            let max = abs_max(sample.iter());
            sample.mapv_inplace(|x| safe_divide(x, max));
        }
    }

    match output_range {
        Some((lo, hi)) => {
            projected.mapv_inplace(|x| lo + ((x + 1.0) / 2.0).clamp(0.0, 1.0) * (hi - lo))
        }
        None => projected.mapv_inplace(|x| x.clamp(-1.0, 1.0)),
    }

    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_sum_values() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let b = arr2(&[[0.5, 0.5], [-1.0, 1.0]]).into_dyn();

        let total = sum_values(&[a.clone(), b]).unwrap();
        assert_eq!(total, arr2(&[[1.5, 2.5], [2.0, 5.0]]).into_dyn());

        // A single value passes through
        assert_eq!(sum_values(&[a.clone()]).unwrap(), a);
    }

    #[test]
    fn test_sum_values_rejects_mismatched_shapes() {
        let a = arr1(&[1.0, 2.0]).into_dyn();
        let b = arr1(&[1.0, 2.0, 3.0]).into_dyn();

        assert!(matches!(sum_values(&[a, b]), Err(Error::ShapeMismatch(_))));
        assert!(sum_values(&[]).is_err());
    }

    #[test]
    fn test_clip_value() {
        let v = arr1(&[-2.0, 0.25, 3.0]).into_dyn();
        assert_eq!(clip_value(&v, 0.0, 1.0), arr1(&[0.0, 0.25, 1.0]).into_dyn());
    }

    #[test]
    fn test_project_value_per_sample() {
        // Each row is normalized by its own absolute maximum
        let v = arr2(&[[2.0, -4.0], [0.5, 0.25]]).into_dyn();
        let projected = project_value(&v, None);
        assert_eq!(projected, arr2(&[[0.5, -1.0], [1.0, 0.5]]).into_dyn());
    }

    #[test]
    fn test_project_value_into_range() {
        let v = arr2(&[[-2.0, 0.0, 2.0]]).into_dyn();
        let projected = project_value(&v, Some((0.0, 10.0)));
        assert_eq!(projected, arr2(&[[0.0, 5.0, 10.0]]).into_dyn());
    }

    #[test]
    fn test_project_value_all_zero() {
        let v = arr2(&[[0.0, 0.0]]).into_dyn();
        assert_eq!(project_value(&v, None), v);
    }
}
