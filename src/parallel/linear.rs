use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, linalg};

use super::{
    collective::{Collective, shard},
    error::{CollectiveErr, Result},
    group::Communicator,
};

/// The gradients a sharded linear transform hands back on the backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrads {
    /// Gradient of this rank's weight shard.
    pub weight: Array2<f32>,
    /// Gradient of this rank's bias.
    pub bias: Array1<f32>,
    /// Gradient of the full layer input, identical on every rank.
    pub input: Array2<f32>,
}

/// `x·W + b` with `W` and `b` split along the output features.
///
/// Rank `r` of a group of `w` holds columns `r·out/w..(r+1)·out/w`. The input is replicated,
/// each rank computes its slice of the output and the slices are gathered in rank order.
#[derive(Debug)]
pub struct ColumnParallelLinear<C> {
    comm: C,
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl<C: Communicator> ColumnParallelLinear<C> {
    /// Creates a new `ColumnParallelLinear` from this rank's shard.
    ///
    /// # Arguments
    /// * `comm` - This rank's handle on its group.
    /// * `weight` - A `(in, out / w)` matrix.
    /// * `bias` - A vector of `out / w` elements.
    pub fn new(comm: C, weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.ncols() {
            return Err(CollectiveErr::ShapeMismatch {
                what: "column-parallel bias",
                got: (1, bias.len()),
                expected: (1, weight.ncols()),
            });
        }

        Ok(Self { comm, weight, bias })
    }

    /// Takes this rank's shard out of the full, unsharded parameters.
    ///
    /// # Errors
    /// `Indivisible` if the output features can't be split evenly across the group.
    pub fn from_full(comm: C, weight: ArrayView2<f32>, bias: ArrayView1<f32>) -> Result<Self> {
        let (world_size, rank) = (comm.world_size(), comm.rank());

        let weight = shard(weight, Axis(1), world_size, rank)?;
        let bias = shard(bias.insert_axis(Axis(0)), Axis(1), world_size, rank)?;

        Self::new(comm, weight, bias.remove_axis(Axis(0)))
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Computes the full layer output on this rank.
    ///
    /// Every rank of the group must call this with the same input.
    pub async fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        check_input("column-parallel input", x, self.weight.nrows())?;

        let x = Collective::Broadcast.forward(&self.comm, x.clone()).await?;
        let local = affine(&x, &self.weight, &self.bias);

        Collective::Gather(Axis(1)).forward(&self.comm, local).await
    }

    /// Propagates the gradient of the full output back through the layer.
    ///
    /// # Arguments
    /// * `x` - The input the forward pass ran on.
    /// * `grad_out` - The gradient with respect to the full `(batch, out)` output.
    pub async fn backward(&self, x: &Array2<f32>, grad_out: Array2<f32>) -> Result<LinearGrads> {
        check_input("column-parallel input", x, self.weight.nrows())?;
        check_grad(x, &grad_out, self.weight.ncols() * self.comm.world_size())?;

        let grad = Collective::Gather(Axis(1)).backward(&self.comm, grad_out).await?;

        let weight = x.t().dot(&grad);
        let bias = grad.sum_axis(Axis(0));
        let partial = grad.dot(&self.weight.t());
        let input = Collective::Broadcast.backward(&self.comm, partial).await?;

        Ok(LinearGrads {
            weight,
            bias,
            input,
        })
    }
}

/// `x·W + b` with `W` split along the input features and `b` replicated.
///
/// Rank `r` keeps rows `r·in/w..(r+1)·in/w` of the weight and the matching slice of the input,
/// the partial products are summed across the group before the bias is added.
#[derive(Debug)]
pub struct RowParallelLinear<C> {
    comm: C,
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl<C: Communicator> RowParallelLinear<C> {
    /// Creates a new `RowParallelLinear` from this rank's shard.
    ///
    /// # Arguments
    /// * `comm` - This rank's handle on its group.
    /// * `weight` - A `(in / w, out)` matrix.
    /// * `bias` - The full bias, `out` elements.
    pub fn new(comm: C, weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.ncols() {
            return Err(CollectiveErr::ShapeMismatch {
                what: "row-parallel bias",
                got: (1, bias.len()),
                expected: (1, weight.ncols()),
            });
        }

        Ok(Self { comm, weight, bias })
    }

    /// Takes this rank's shard out of the full, unsharded parameters.
    ///
    /// # Errors
    /// `Indivisible` if the input features can't be split evenly across the group.
    pub fn from_full(comm: C, weight: ArrayView2<f32>, bias: ArrayView1<f32>) -> Result<Self> {
        let weight = shard(weight, Axis(0), comm.world_size(), comm.rank())?;
        Self::new(comm, weight, bias.to_owned())
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Computes the full layer output on this rank.
    ///
    /// Every rank of the group must call this with the same, full width input.
    pub async fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let in_features = self.weight.nrows() * self.comm.world_size();
        check_input("row-parallel input", x, in_features)?;

        let local = Collective::Scatter(Axis(1)).forward(&self.comm, x.clone()).await?;
        let partial = local.dot(&self.weight);
        let mut y = Collective::Reduce.forward(&self.comm, partial).await?;
        y += &self.bias;

        Ok(y)
    }

    /// Propagates the gradient of the full output back through the layer.
    ///
    /// # Arguments
    /// * `x` - The full input the forward pass ran on.
    /// * `grad_out` - The gradient with respect to the `(batch, out)` output.
    pub async fn backward(&self, x: &Array2<f32>, grad_out: Array2<f32>) -> Result<LinearGrads> {
        let in_features = self.weight.nrows() * self.comm.world_size();
        check_input("row-parallel input", x, in_features)?;
        check_grad(x, &grad_out, self.weight.ncols())?;

        let grad = Collective::Reduce.backward(&self.comm, grad_out).await?;
        let local = shard(x.view(), Axis(1), self.comm.world_size(), self.comm.rank())?;

        let weight = local.t().dot(&grad);
        let bias = grad.sum_axis(Axis(0));
        let partial = grad.dot(&self.weight.t());
        let input = Collective::Scatter(Axis(1))
            .backward(&self.comm, partial)
            .await?;

        Ok(LinearGrads {
            weight,
            bias,
            input,
        })
    }
}

fn affine(x: &Array2<f32>, weight: &Array2<f32>, bias: &Array1<f32>) -> Array2<f32> {
    let mut z = Array2::from_shape_fn((x.nrows(), weight.ncols()), |(_, c)| bias[c]);
    linalg::general_mat_mul(1.0, x, weight, 1.0, &mut z);
    z
}

fn check_input(what: &'static str, x: &Array2<f32>, in_features: usize) -> Result<()> {
    if x.ncols() != in_features {
        return Err(CollectiveErr::ShapeMismatch {
            what,
            got: x.dim(),
            expected: (x.nrows(), in_features),
        });
    }

    Ok(())
}

/// The output gradient must cover the full `(batch, out)` output of the layer.
fn check_grad(x: &Array2<f32>, grad_out: &Array2<f32>, out_features: usize) -> Result<()> {
    if grad_out.dim() != (x.nrows(), out_features) {
        return Err(CollectiveErr::ShapeMismatch {
            what: "output gradient",
            got: grad_out.dim(),
            expected: (x.nrows(), out_features),
        });
    }

    Ok(())
}
