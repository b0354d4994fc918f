use std::{iter::FusedIterator, num::NonZeroUsize};

use super::task::Task;

/// The tasks that may run concurrently during one time step.
pub type ClockCycle = Vec<Task>;

/// Decides, for every time step, which `(microbatch, partition)` pairs may run.
pub trait Scheduler {
    type Cycles: Iterator<Item = ClockCycle>;

    /// Generates the clock cycles for a run.
    ///
    /// # Arguments
    /// * `microbatches` - The amount of microbatches fed through the pipeline.
    /// * `partitions` - The amount of partitions of the pipeline.
    ///
    /// # Returns
    /// A finite sequence of clock cycles covering every task exactly once.
    fn cycles(&self, microbatches: NonZeroUsize, partitions: NonZeroUsize) -> Self::Cycles;
}

/// The GPipe deterministic clock-cycle schedule: task `(i, j)` runs at cycle `i + j`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicScheduler;

impl Scheduler for DeterministicScheduler {
    type Cycles = ClockCycles;

    fn cycles(&self, microbatches: NonZeroUsize, partitions: NonZeroUsize) -> ClockCycles {
        clock_cycles(microbatches, partitions)
    }
}

/// Runs one task per cycle, finishing a microbatch before starting the next one.
///
/// There is no overlap between partitions, which makes it the reference order to compare a
/// pipelined run against.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialScheduler;

impl Scheduler for SequentialScheduler {
    type Cycles = Box<dyn Iterator<Item = ClockCycle> + Send>;

    fn cycles(&self, microbatches: NonZeroUsize, partitions: NonZeroUsize) -> Self::Cycles {
        let n = partitions.get();
        let cycles = (0..microbatches.get())
            .flat_map(move |i| (0..n).map(move |j| vec![Task::new(i, j)]));

        Box::new(cycles)
    }
}

/// Creates the deterministic clock-cycle sequence for `m` microbatches and `n` partitions.
///
/// The sequence is lazy and cloning it restarts it from the current position, the same
/// inputs always yield the same cycles.
pub fn clock_cycles(microbatches: NonZeroUsize, partitions: NonZeroUsize) -> ClockCycles {
    ClockCycles {
        microbatches: microbatches.get(),
        partitions: partitions.get(),
        clock: 0,
    }
}

/// The fraction of worker time slots spent idle, `(n - 1) / (m + n - 1)`.
pub fn bubble_fraction(microbatches: NonZeroUsize, partitions: NonZeroUsize) -> f64 {
    let (m, n) = (microbatches.get(), partitions.get());
    (n - 1) as f64 / (m + n - 1) as f64
}

/// Iterator over the deterministic clock cycles.
#[derive(Debug, Clone)]
pub struct ClockCycles {
    microbatches: usize,
    partitions: usize,
    clock: usize,
}

impl ClockCycles {
    fn total(&self) -> usize {
        self.microbatches + self.partitions - 1
    }
}

impl Iterator for ClockCycles {
    type Item = ClockCycle;

    fn next(&mut self) -> Option<ClockCycle> {
        if self.clock >= self.total() {
            return None;
        }

        let t = self.clock;
        self.clock += 1;

        // Partitions below `start` have drained every microbatch, the ones at or past `end`
        // haven't been reached by the first microbatch yet.
        let start = (t + 1).saturating_sub(self.microbatches);
        let end = (t + 1).min(self.partitions);

        Some((start..end).map(|j| Task::new(t - j, j)).collect())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total() - self.clock.min(self.total());
        (left, Some(left))
    }
}

impl ExactSizeIterator for ClockCycles {}

impl FusedIterator for ClockCycles {}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn pairs(cycle: &ClockCycle) -> Vec<(usize, usize)> {
        cycle.iter().map(|t| (t.microbatch_idx, t.partition_idx)).collect()
    }

    #[test]
    fn five_microbatches_three_partitions() {
        let cycles: Vec<_> = clock_cycles(nz(5), nz(3)).map(|c| pairs(&c)).collect();

        assert_eq!(
            cycles,
            vec![
                vec![(0, 0)],
                vec![(1, 0), (0, 1)],
                vec![(2, 0), (1, 1), (0, 2)],
                vec![(3, 0), (2, 1), (1, 2)],
                vec![(4, 0), (3, 1), (2, 2)],
                vec![(4, 1), (3, 2)],
                vec![(4, 2)],
            ]
        );
    }

    #[test]
    fn every_task_lands_once_at_its_clock() {
        for m in 1..=7 {
            for n in 1..=7 {
                let cycles: Vec<_> = clock_cycles(nz(m), nz(n)).collect();
                assert_eq!(cycles.len(), m + n - 1);

                let mut seen = HashSet::new();
                for (t, cycle) in cycles.iter().enumerate() {
                    for task in cycle {
                        assert_eq!(task.clock(), t);
                        assert!(seen.insert((task.microbatch_idx, task.partition_idx)));
                    }
                }

                assert_eq!(seen.len(), m * n);
            }
        }
    }

    #[test]
    fn tasks_within_a_cycle_are_partition_ascending() {
        for cycle in clock_cycles(nz(6), nz(4)) {
            for w in cycle.windows(2) {
                assert!(w[0].partition_idx < w[1].partition_idx);
                assert!(w[0].microbatch_idx > w[1].microbatch_idx);
            }
        }
    }

    #[test]
    fn clock_cycles_is_restartable() {
        let a: Vec<_> = clock_cycles(nz(4), nz(3)).collect();
        let b: Vec<_> = clock_cycles(nz(4), nz(3)).collect();
        assert_eq!(a, b);

        let mut it = clock_cycles(nz(4), nz(3));
        it.next();
        let rest: Vec<_> = it.clone().collect();
        assert_eq!(rest, it.collect::<Vec<_>>());
        assert_eq!(rest, a[1..]);
    }

    #[test]
    fn degenerate_shapes() {
        let single_mb: Vec<_> = clock_cycles(nz(1), nz(4)).map(|c| pairs(&c)).collect();
        assert_eq!(single_mb, vec![vec![(0, 0)], vec![(0, 1)], vec![(0, 2)], vec![(0, 3)]]);

        let single_part: Vec<_> = clock_cycles(nz(3), nz(1)).map(|c| pairs(&c)).collect();
        assert_eq!(single_part, vec![vec![(0, 0)], vec![(1, 0)], vec![(2, 0)]]);
    }

    #[test]
    fn exact_size() {
        let mut it = clock_cycles(nz(5), nz(3));
        assert_eq!(it.len(), 7);
        it.next();
        assert_eq!(it.len(), 6);
        it.by_ref().for_each(drop);
        assert_eq!(it.len(), 0);
        assert!(it.next().is_none());
    }

    #[test]
    fn sequential_is_microbatch_major() {
        let cycles: Vec<_> = SequentialScheduler
            .cycles(nz(2), nz(3))
            .map(|c| pairs(&c))
            .collect();

        assert_eq!(
            cycles,
            vec![
                vec![(0, 0)],
                vec![(0, 1)],
                vec![(0, 2)],
                vec![(1, 0)],
                vec![(1, 1)],
                vec![(1, 2)],
            ]
        );
    }

    #[test]
    fn bubble() {
        assert_eq!(bubble_fraction(nz(4), nz(1)), 0.0);
        assert_eq!(bubble_fraction(nz(5), nz(3)), 2.0 / 7.0);
    }
}
