use futures::{executor, future::join_all};
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use parking_lot::Mutex;

use super::{
    error::{CollectiveErr, Result},
    group::{LocalComm, ParallelGroup},
    linear::{ColumnParallelLinear, LinearGrads, RowParallelLinear},
};
use crate::{orchestra::BoxError, partition::Partition};

enum Shards {
    Column(Vec<ColumnParallelLinear<LocalComm>>),
    Row(Vec<RowParallelLinear<LocalComm>>),
}

/// A linear transform sharded over an in-process group, usable as a single pipeline partition.
///
/// Every rank of the group is driven from the thread that applies the stage, so the pipeline
/// worker it's placed on does the work of the whole group.
pub struct TensorParallelStage {
    group: ParallelGroup,
    shards: Shards,
    // One collective sequence at a time, the ranks would pair up wrong otherwise.
    running: Mutex<()>,
}

impl TensorParallelStage {
    /// Creates a stage splitting `x·W + b` along its output features.
    ///
    /// # Arguments
    /// * `name` - The name of the group, used for observability.
    /// * `world_size` - The amount of ranks to split the transform across.
    /// * `weight` - The full `(in, out)` weight.
    /// * `bias` - The full bias, `out` elements.
    ///
    /// # Errors
    /// `Indivisible` if `out` isn't a multiple of `world_size`.
    pub fn column(
        name: &str,
        world_size: usize,
        weight: ArrayView2<f32>,
        bias: ArrayView1<f32>,
    ) -> Result<Self> {
        let group = ParallelGroup::new(name, world_size)?;
        let shards = group
            .local()
            .into_iter()
            .map(|comm| ColumnParallelLinear::from_full(comm, weight, bias))
            .collect::<Result<_>>()?;

        Ok(Self::with_shards(group, Shards::Column(shards)))
    }

    /// Creates a stage splitting `x·W + b` along its input features.
    ///
    /// # Errors
    /// `Indivisible` if `in` isn't a multiple of `world_size`.
    pub fn row(
        name: &str,
        world_size: usize,
        weight: ArrayView2<f32>,
        bias: ArrayView1<f32>,
    ) -> Result<Self> {
        let group = ParallelGroup::new(name, world_size)?;
        let shards = group
            .local()
            .into_iter()
            .map(|comm| RowParallelLinear::from_full(comm, weight, bias))
            .collect::<Result<_>>()?;

        Ok(Self::with_shards(group, Shards::Row(shards)))
    }

    fn with_shards(group: ParallelGroup, shards: Shards) -> Self {
        Self {
            group,
            shards,
            running: Mutex::new(()),
        }
    }

    pub fn group(&self) -> &ParallelGroup {
        &self.group
    }

    /// Runs the forward pass on every rank and returns the full output.
    pub async fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        debug!(
            group = self.group.name(),
            ranks = self.group.world_size();
            "tensor-parallel forward of {} row(s)",
            x.nrows()
        );

        let outputs = match &self.shards {
            Shards::Column(ranks) => join_all(ranks.iter().map(|r| r.forward(x))).await,
            Shards::Row(ranks) => join_all(ranks.iter().map(|r| r.forward(x))).await,
        };

        // Every rank ends up with the same full output.
        outputs
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .next()
            .ok_or_else(|| CollectiveErr::InvalidGroup("no rank produced an output".into()))
    }

    /// Runs the backward pass on every rank.
    ///
    /// # Returns
    /// The gradients of every rank, in rank order.
    pub async fn backward(
        &self,
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
    ) -> Result<Vec<LinearGrads>> {
        let grads = match &self.shards {
            Shards::Column(ranks) => {
                join_all(ranks.iter().map(|r| r.backward(x, grad_out.clone()))).await
            }
            Shards::Row(ranks) => {
                join_all(ranks.iter().map(|r| r.backward(x, grad_out.clone()))).await
            }
        };

        grads.into_iter().collect()
    }
}

impl Partition<Array2<f32>> for TensorParallelStage {
    fn apply(&self, value: Array2<f32>) -> std::result::Result<Array2<f32>, BoxError> {
        let _running = self.running.lock();
        Ok(executor::block_on(self.forward(&value))?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Axis, array};

    use super::*;
    use crate::partition::Dense;

    fn close(a: &Array2<f32>, b: &Array2<f32>) -> bool {
        a.dim() == b.dim() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    fn params() -> (Array2<f32>, Array1<f32>) {
        let weight = Array2::from_shape_fn((4, 6), |(r, c)| (r as f32 - c as f32) * 0.25);
        let bias = Array1::from_shape_fn(6, |c| c as f32 * 0.1);
        (weight, bias)
    }

    #[test]
    fn column_stage_matches_dense() {
        let (weight, bias) = params();
        let stage = TensorParallelStage::column("tp", 3, weight.view(), bias.view()).unwrap();
        let dense = Dense::new(weight, bias).unwrap();

        let x = array![[1., 2., 3., 4.], [-1., 0., 1., 0.5]];
        assert!(close(&stage.apply(x.clone()).unwrap(), &dense.forward(&x).unwrap()));
    }

    #[test]
    fn row_stage_matches_dense() {
        let (weight, bias) = params();
        let stage = TensorParallelStage::row("tp", 2, weight.view(), bias.view()).unwrap();
        let dense = Dense::new(weight, bias).unwrap();

        let x = array![[0.5, -2., 1., 3.]];
        assert!(close(&stage.apply(x.clone()).unwrap(), &dense.forward(&x).unwrap()));
    }

    #[test]
    fn backward_returns_every_rank() {
        let (weight, bias) = params();
        let stage = TensorParallelStage::column("tp", 2, weight.view(), bias.view()).unwrap();

        let x = Array2::ones((3, 4));
        let grad_out = Array2::ones((3, 6));
        let grads = tokio_test::block_on(stage.backward(&x, &grad_out)).unwrap();

        assert_eq!(grads.len(), 2);
        for g in &grads {
            assert_eq!(g.weight.dim(), (4, 3));
            assert_eq!(g.bias, Array1::from_elem(3, 3.));
            assert!(close(&g.input, &grad_out.dot(&weight.t())));
        }

        let full: Vec<_> = grads.iter().map(|g| g.weight.view()).collect();
        assert!(close(&ndarray::concatenate(Axis(1), &full).unwrap(), &x.t().dot(&grad_out)));
    }

    #[test]
    fn uneven_split_is_rejected() {
        let (weight, bias) = params();
        let err = TensorParallelStage::column("tp", 4, weight.view(), bias.view()).err();
        assert!(matches!(err, Some(CollectiveErr::Indivisible { len: 6, parts: 4, .. })));
    }

    #[test]
    fn wrong_input_is_a_task_error() {
        let (weight, bias) = params();
        let stage = TensorParallelStage::column("tp", 2, weight.view(), bias.view()).unwrap();

        let err = stage.apply(Array2::zeros((1, 5))).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }
}
