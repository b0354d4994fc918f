use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
};

use ndarray::{Array1, Array2, linalg};

use crate::orchestra::BoxError;

/// One stage of the pipeline: a pure transform of a microbatch value.
///
/// Partitions are shared between the caller and the workers and are never mutated by the
/// engine, so `apply` only borrows `self`.
pub trait Partition<T>: Send + Sync {
    /// Computes this stage's output for a single microbatch.
    ///
    /// # Arguments
    /// * `value` - The microbatch value as left by the previous partition.
    ///
    /// # Returns
    /// The new value of the microbatch or the reason the stage failed.
    fn apply(&self, value: T) -> Result<T, BoxError>;
}

impl<T, F> Partition<T> for F
where
    F: Fn(T) -> Result<T, BoxError> + Send + Sync,
{
    fn apply(&self, value: T) -> Result<T, BoxError> {
        self(value)
    }
}

/// Error returned by the stock partitions when an input doesn't fit their parameters.
#[derive(Debug)]
pub struct SizeMismatch {
    pub what: &'static str,
    pub got: usize,
    pub expected: usize,
}

impl Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size mismatch in {}: got {}, expected {}",
            self.what, self.got, self.expected
        )
    }
}

impl Error for SizeMismatch {}

/// An affine transform `x·W + b` with an optional sigmoid on top.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Array2<f32>,
    bias: Array1<f32>,
    sigmoid_amp: Option<f32>,
}

impl Dense {
    /// Creates a new `Dense` partition.
    ///
    /// # Arguments
    /// * `weight` - A `(in, out)` matrix.
    /// * `bias` - A vector of `out` elements.
    ///
    /// # Returns
    /// The new partition or a `SizeMismatch` if the bias doesn't match the weight's columns.
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, SizeMismatch> {
        if weight.ncols() != bias.len() {
            return Err(SizeMismatch {
                what: "dense bias",
                got: bias.len(),
                expected: weight.ncols(),
            });
        }

        Ok(Self {
            weight,
            bias,
            sigmoid_amp: None,
        })
    }

    /// Applies `amp / (1 + e^-z)` to the affine output.
    pub fn with_sigmoid(mut self, amp: f32) -> Self {
        self.sigmoid_amp = Some(amp);
        self
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Computes the layer's output for a batch of rows.
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>, SizeMismatch> {
        if x.ncols() != self.weight.nrows() {
            return Err(SizeMismatch {
                what: "dense input",
                got: x.ncols(),
                expected: self.weight.nrows(),
            });
        }

        let shape = (x.nrows(), self.weight.ncols());
        let mut z = Array2::from_shape_fn(shape, |(_, c)| self.bias[c]);
        linalg::general_mat_mul(1.0, x, &self.weight, 1.0, &mut z);

        let Some(amp) = self.sigmoid_amp else {
            return Ok(z);
        };

        Ok(z.mapv_into(|z| amp / (1. + (-z).exp())))
    }
}

impl Partition<Array2<f32>> for Dense {
    fn apply(&self, value: Array2<f32>) -> Result<Array2<f32>, BoxError> {
        Ok(self.forward(&value)?)
    }
}

/// Several partitions run back to back as a single pipeline stage.
pub struct Sequence<T> {
    stages: Vec<Arc<dyn Partition<T>>>,
}

impl<T> Sequence<T> {
    pub fn new<I>(stages: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Partition<T>>>,
    {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<T> Partition<T> for Sequence<T> {
    fn apply(&self, value: T) -> Result<T, BoxError> {
        self.stages
            .iter()
            .try_fold(value, |value, stage| stage.apply(value))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn partition<F>(f: F) -> Arc<dyn Partition<i64>>
    where
        F: Fn(i64) -> Result<i64, BoxError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn dense_affine() {
        let dense = Dense::new(array![[1., 2.], [3., 4.]], array![0.5, -0.5]).unwrap();
        let y = dense.apply(array![[1., 1.], [0., 2.]]).unwrap();
        assert_eq!(y, array![[4.5, 5.5], [6.5, 7.5]]);
    }

    #[test]
    fn dense_sigmoid_at_zero_is_half_amp() {
        let dense = Dense::new(Array2::zeros((2, 3)), Array1::zeros(3))
            .unwrap()
            .with_sigmoid(2.);

        let y = dense.forward(&Array2::ones((1, 2))).unwrap();
        assert!(y.iter().all(|&v| (v - 1.).abs() < 1e-6));
    }

    #[test]
    fn dense_rejects_wrong_input_width() {
        let dense = Dense::new(Array2::zeros((3, 1)), Array1::zeros(1)).unwrap();
        let err = dense.apply(Array2::zeros((1, 2))).unwrap_err();
        assert!(err.to_string().contains("dense input"));
    }

    #[test]
    fn dense_rejects_wrong_bias() {
        assert!(Dense::new(Array2::zeros((3, 2)), Array1::zeros(3)).is_err());
    }

    #[test]
    fn sequence_applies_in_order() {
        let seq = Sequence::new([partition(|x| Ok(x * 2)), partition(|x| Ok(x + 1))]);

        assert_eq!(seq.len(), 2);
        assert_eq!(seq.apply(5).unwrap(), 11);
    }

    #[test]
    fn sequence_stops_at_first_error() {
        let seq = Sequence::new([partition(|_| Err("nope".into())), partition(|x| Ok(x + 1))]);

        assert_eq!(seq.apply(1).unwrap_err().to_string(), "nope");
    }
}
