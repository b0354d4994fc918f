use ndarray::{Array2, ArrayView2, Axis, s};

use super::{
    error::{CollectiveErr, Result},
    group::Communicator,
};

/// A collective operation paired with the operation that carries its gradient backwards.
///
/// | op          | forward                        | backward                         |
/// |-------------|--------------------------------|----------------------------------|
/// | `Broadcast` | identity                       | sum across the group             |
/// | `Reduce`    | sum across the group           | identity                         |
/// | `Scatter`   | keep this rank's shard         | gather the shard gradients       |
/// | `Gather`    | concatenate every rank's shard | keep this rank's gradient chunk  |
///
/// The differentiation engine driving `backward` lives outside this crate, it only has to call
/// the backward of every op it recorded in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collective {
    Broadcast,
    Reduce,
    Scatter(Axis),
    Gather(Axis),
}

impl Collective {
    /// Runs the forward half of the operation on this rank.
    ///
    /// # Arguments
    /// * `comm` - This rank's handle on its group.
    /// * `x` - This rank's input.
    ///
    /// # Returns
    /// This rank's output.
    pub async fn forward<C: Communicator>(
        &self,
        comm: &C,
        x: Array2<f32>,
    ) -> Result<Array2<f32>> {
        match *self {
            Collective::Broadcast => Ok(x),
            Collective::Reduce => comm.all_reduce_sum(x).await,
            Collective::Scatter(axis) => shard(x.view(), axis, comm.world_size(), comm.rank()),
            Collective::Gather(axis) => comm.all_gather(x, axis).await,
        }
    }

    /// Runs the backward half of the operation on this rank.
    ///
    /// # Arguments
    /// * `comm` - This rank's handle on its group.
    /// * `grad` - The gradient flowing into this op's output.
    ///
    /// # Returns
    /// The gradient with respect to this op's input.
    pub async fn backward<C: Communicator>(
        &self,
        comm: &C,
        grad: Array2<f32>,
    ) -> Result<Array2<f32>> {
        match *self {
            Collective::Broadcast => comm.all_reduce_sum(grad).await,
            Collective::Reduce => Ok(grad),
            Collective::Scatter(axis) => comm.all_gather(grad, axis).await,
            Collective::Gather(axis) => {
                shard(grad.view(), axis, comm.world_size(), comm.rank())
            }
        }
    }
}

/// Cuts `x` into `parts` contiguous equally sized chunks along `axis` and returns chunk `index`.
///
/// # Errors
/// `Indivisible` if the axis length isn't a multiple of `parts`, `AxisOutOfRange` for an axis
/// other than 0 or 1.
pub fn shard(x: ArrayView2<f32>, axis: Axis, parts: usize, index: usize) -> Result<Array2<f32>> {
    if axis.index() > 1 {
        return Err(CollectiveErr::AxisOutOfRange(axis.index()));
    }

    if index >= parts {
        return Err(CollectiveErr::InvalidGroup(format!(
            "rank {index} is outside a group of {parts}"
        )));
    }

    let len = x.len_of(axis);
    if len % parts != 0 {
        return Err(CollectiveErr::Indivisible {
            axis: axis.index(),
            len,
            parts,
        });
    }

    let chunk = len / parts;
    let range = index * chunk..(index + 1) * chunk;
    let view = match axis {
        Axis(0) => x.slice(s![range, ..]),
        _ => x.slice(s![.., range]),
    };

    Ok(view.to_owned())
}
