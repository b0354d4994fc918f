use std::sync::Arc;

use ndarray::{Array2, ArrayView2, Axis};
use parking_lot::Mutex;
use tokio::sync::Barrier;

use super::error::{CollectiveErr, Result};

/// The set of ranks sharing a collective operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    name: String,
    world_size: usize,
}

impl ParallelGroup {
    /// Creates a new `ParallelGroup` of ranks `0..world_size`.
    ///
    /// # Errors
    /// `CollectiveErr::InvalidGroup` if `world_size` is 0.
    pub fn new(name: impl Into<String>, world_size: usize) -> Result<Self> {
        let name = name.into();
        if world_size == 0 {
            return Err(CollectiveErr::InvalidGroup(format!(
                "group {name} needs at least one rank"
            )));
        }

        Ok(Self { name, world_size })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Creates one in-process communicator per rank of this group.
    ///
    /// Every rank must take part in every operation, in the same order, or the others wait
    /// forever.
    pub fn local(&self) -> Vec<LocalComm> {
        let exchange = Arc::new(Exchange {
            slots: Mutex::new(vec![None; self.world_size]),
            barrier: Barrier::new(self.world_size),
        });

        (0..self.world_size)
            .map(|rank| LocalComm {
                rank,
                group: self.clone(),
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }
}

/// The transport a rank uses to run collectives with the rest of its group.
#[allow(unused)]
#[trait_variant::make(Communicator: Send)]
pub trait CommunicatorTemplate: Sync {
    /// This participant's rank inside the group.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sums `x` element-wise across the group, every rank receives the sum.
    ///
    /// # Errors
    /// `ShapeMismatch` if the ranks contributed tensors of different shapes.
    async fn all_reduce_sum(&self, x: Array2<f32>) -> Result<Array2<f32>>;

    /// Concatenates every rank's `x` along `axis` in rank order, every rank receives the result.
    ///
    /// # Errors
    /// `ShapeMismatch` if the shards don't agree on the other axis.
    async fn all_gather(&self, x: Array2<f32>, axis: Axis) -> Result<Array2<f32>>;
}

#[derive(Debug)]
struct Exchange {
    slots: Mutex<Vec<Option<Array2<f32>>>>,
    barrier: Barrier,
}

/// A rank's handle on a group whose ranks all live in this process.
#[derive(Debug, Clone)]
pub struct LocalComm {
    rank: usize,
    group: ParallelGroup,
    exchange: Arc<Exchange>,
}

impl LocalComm {
    /// Publishes `x` and collects every rank's contribution, in rank order.
    async fn exchange(&self, x: Array2<f32>) -> Result<Vec<Array2<f32>>> {
        self.exchange.slots.lock()[self.rank] = Some(x);
        self.exchange.barrier.wait().await;

        let parts: Vec<_> = self.exchange.slots.lock().iter().flatten().cloned().collect();

        // Nobody may publish the next operation's tensor until everyone has read this one.
        self.exchange.barrier.wait().await;

        if parts.len() != self.group.world_size() {
            return Err(CollectiveErr::InvalidGroup(format!(
                "group {} got {} of {} contributions",
                self.group.name(),
                parts.len(),
                self.group.world_size()
            )));
        }

        Ok(parts)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    async fn all_reduce_sum(&self, x: Array2<f32>) -> Result<Array2<f32>> {
        let shape = x.dim();
        let mut parts = self.exchange(x).await?.into_iter();

        // `exchange` always hands back one tensor per rank and groups have at least one.
        let mut sum = parts.next().unwrap_or_else(|| Array2::zeros(shape));
        for part in parts {
            if part.dim() != sum.dim() {
                return Err(CollectiveErr::ShapeMismatch {
                    what: "all-reduce contribution",
                    got: part.dim(),
                    expected: sum.dim(),
                });
            }

            sum += &part;
        }

        Ok(sum)
    }

    async fn all_gather(&self, x: Array2<f32>, axis: Axis) -> Result<Array2<f32>> {
        if axis.index() > 1 {
            return Err(CollectiveErr::AxisOutOfRange(axis.index()));
        }

        let parts = self.exchange(x).await?;
        let views: Vec<ArrayView2<f32>> = parts.iter().map(|p| p.view()).collect();

        ndarray::concatenate(axis, &views).map_err(|_| CollectiveErr::ShapeMismatch {
            what: "all-gather shard",
            got: parts.last().map(|p| p.dim()).unwrap_or_default(),
            expected: parts.first().map(|p| p.dim()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use ndarray::{Array2, Axis, array};

    use super::{Communicator, ParallelGroup};

    #[test]
    fn empty_groups_are_rejected() {
        assert!(ParallelGroup::new("tp", 0).is_err());
    }

    #[tokio::test]
    async fn all_reduce_sums_every_rank() {
        let comms = ParallelGroup::new("tp", 3).unwrap().local();

        let results = join_all(comms.iter().map(|c| {
            let x = Array2::from_elem((2, 2), c.rank() as f32 + 1.);
            c.all_reduce_sum(x)
        }))
        .await;

        for result in results {
            assert_eq!(result.unwrap(), Array2::from_elem((2, 2), 6.));
        }
    }

    #[tokio::test]
    async fn all_gather_concatenates_in_rank_order() {
        let comms = ParallelGroup::new("tp", 2).unwrap().local();

        let results = join_all(comms.iter().map(|c| {
            let x = array![[c.rank() as f32], [c.rank() as f32 + 10.]];
            c.all_gather(x, Axis(1))
        }))
        .await;

        for result in results {
            assert_eq!(result.unwrap(), array![[0., 1.], [10., 11.]]);
        }
    }

    #[tokio::test]
    async fn consecutive_operations_do_not_mix() {
        let comms = ParallelGroup::new("tp", 2).unwrap().local();

        let results = join_all(comms.iter().map(|c| async move {
            let a = c.all_reduce_sum(Array2::ones((1, 1))).await?;
            let b = c.all_reduce_sum(a * 10.).await?;
            c.all_gather(b, Axis(0)).await
        }))
        .await;

        for result in results {
            assert_eq!(result.unwrap(), array![[40.], [40.]]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ranks_on_different_threads() {
        let comms = ParallelGroup::new("tp", 2).unwrap().local();

        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                tokio::spawn(async move {
                    let x = Array2::from_elem((1, 3), c.rank() as f32);
                    c.all_reduce_sum(x).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Array2::from_elem((1, 3), 1.));
        }
    }

    #[tokio::test]
    async fn mismatched_shapes_are_reported() {
        let comms = ParallelGroup::new("tp", 2).unwrap().local();

        let results = join_all(comms.iter().map(|c| {
            let x = Array2::<f32>::zeros((1, c.rank() + 1));
            c.all_reduce_sum(x)
        }))
        .await;

        assert!(results.iter().all(|r| r.is_err()));
    }
}
