use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{
    error::{FailureCause, PipelineErr, PipelineFailure, Result},
    metrics::RunStats,
    task::{Job, Outcome, Task},
    worker::Worker,
};
use crate::partition::Partition;

/// The workers of a single run, torn down on every exit path.
///
/// Dropping the pool never waits on a partition still computing: workers that owe results are
/// detached, see [`Worker::join`].
pub struct WorkerPool<T> {
    workers: Vec<Worker<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `count` workers named `{prefix}-{id}`.
    ///
    /// # Errors
    /// `PipelineErr::WorkerSpawn` if any thread fails to start, the ones already started are
    /// shut down before returning.
    pub fn spawn(count: usize, prefix: &str) -> Result<Self> {
        let cancel = CancellationToken::new();
        let workers = (0..count)
            .map(|id| Worker::spawn(id, format!("{prefix}-{id}"), cancel.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { workers, cancel })
    }
}

impl<T> WorkerPool<T> {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stops every worker from running the jobs still queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.signal_shutdown();
        }

        for worker in &mut self.workers {
            worker.join();
        }
    }
}

/// Owns the microbatch buffer and moves it through the pipeline one clock cycle at a time.
///
/// Values leave the buffer when their task is submitted and come back with the result, so
/// workers never touch the buffer itself.
pub struct Coordinator<T> {
    buffer: Vec<Option<T>>,
    progress: Vec<usize>,
    partitions: Vec<Arc<dyn Partition<T>>>,
    placement: Vec<usize>,
    pool: WorkerPool<T>,
    task_timeout: Option<Duration>,
    stats: RunStats,
}

impl<T> Coordinator<T> {
    /// Creates a new `Coordinator`.
    ///
    /// # Arguments
    /// * `microbatches` - The initial value of every microbatch.
    /// * `partitions` - The pipeline's partitions, in order.
    /// * `placement` - The worker id of every partition.
    /// * `pool` - The running workers.
    /// * `task_timeout` - Bound on each result wait.
    pub fn new(
        microbatches: Vec<T>,
        partitions: Vec<Arc<dyn Partition<T>>>,
        placement: Vec<usize>,
        pool: WorkerPool<T>,
        task_timeout: Option<Duration>,
    ) -> Self {
        debug_assert_eq!(partitions.len(), placement.len());

        Self {
            progress: vec![0; microbatches.len()],
            buffer: microbatches.into_iter().map(Some).collect(),
            stats: RunStats::new(pool.len()),
            partitions,
            placement,
            pool,
            task_timeout,
        }
    }

    /// Submits every task of a cycle and then writes each result back into the buffer.
    ///
    /// # Arguments
    /// * `clock` - The index of the cycle, used for reporting.
    /// * `cycle` - The tasks to run, in submission order.
    ///
    /// # Errors
    /// A `ScheduleViolation` if a task's input isn't ready, or a `Failure` once any task fails
    /// or its worker stops answering. The run is cancelled in the latter case.
    pub async fn run_cycle(&mut self, clock: usize, cycle: &[Task]) -> Result<()> {
        self.check_cycle(clock, cycle)?;

        for &task in cycle {
            let Task {
                microbatch_idx: i,
                partition_idx: j,
            } = task;

            let Some(value) = self.buffer[i].take() else {
                return Err(PipelineErr::ScheduleViolation {
                    cycle: clock,
                    task,
                    reason: "microbatch value is in flight",
                });
            };

            let job = Job {
                task,
                value,
                partition: Arc::clone(&self.partitions[j]),
            };

            let worker_id = self.placement[j];
            if let Err(cause) = self.pool.workers[worker_id].submit(job) {
                return Err(self.abort(failed(task, cause)));
            }
        }

        self.stats.bump_cycle();

        for &task in cycle {
            let worker_id = self.placement[task.partition_idx];
            let limit = self.task_timeout;

            let result = match self.pool.workers[worker_id].recv(limit).await {
                Ok(result) => result,
                Err(cause) => return Err(self.abort(failed(task, cause))),
            };

            debug_assert_eq!(result.task, task, "results must follow submission order");

            match result.outcome {
                Outcome::Done(value) => {
                    self.buffer[task.microbatch_idx] = Some(value);
                    self.progress[task.microbatch_idx] += 1;
                    self.stats.record(worker_id, task, result.elapsed);
                }
                Outcome::Failed(failure) => return Err(self.abort(failure.into())),
                Outcome::Cancelled => {
                    return Err(self.abort(failed(task, FailureCause::Cancelled)));
                }
            }
        }

        Ok(())
    }

    /// Hands back the final value of every microbatch.
    ///
    /// # Errors
    /// `IncompleteSchedule` if some microbatch didn't go through every partition.
    pub fn finish(mut self) -> Result<(Vec<T>, RunStats)> {
        let n = self.partitions.len();

        if let Some((i, &reached)) = self.progress.iter().enumerate().find(|(_, p)| **p != n) {
            return Err(PipelineErr::IncompleteSchedule {
                microbatch_idx: i,
                reached,
            });
        }

        let outputs = std::mem::take(&mut self.buffer)
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                value.ok_or(PipelineErr::IncompleteSchedule {
                    microbatch_idx: i,
                    reached: n,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((outputs, std::mem::take(&mut self.stats)))
    }

    /// Rejects tasks that would break the per-microbatch partition order.
    fn check_cycle(&self, clock: usize, cycle: &[Task]) -> Result<()> {
        let violation = |task, reason| PipelineErr::ScheduleViolation {
            cycle: clock,
            task,
            reason,
        };

        for (k, &task) in cycle.iter().enumerate() {
            if task.microbatch_idx >= self.buffer.len() {
                return Err(violation(task, "microbatch out of range"));
            }

            if task.partition_idx >= self.partitions.len() {
                return Err(violation(task, "partition out of range"));
            }

            if self.progress[task.microbatch_idx] != task.partition_idx {
                return Err(violation(task, "input is not the previous partition's output"));
            }

            if cycle[..k]
                .iter()
                .any(|t| t.microbatch_idx == task.microbatch_idx)
            {
                return Err(violation(task, "microbatch scheduled twice in one cycle"));
            }
        }

        Ok(())
    }

    fn abort(&self, failure: PipelineFailure) -> PipelineErr {
        warn!(
            microbatch = failure.microbatch_idx,
            partition = failure.stage_idx;
            "aborting run: {}", failure.cause
        );

        self.pool.cancel();
        debug!("cancelled queued tasks of {} worker(s)", self.pool.len());

        failure.into()
    }
}

fn failed(task: Task, cause: FailureCause) -> PipelineFailure {
    PipelineFailure {
        stage_idx: task.partition_idx,
        microbatch_idx: task.microbatch_idx,
        cause,
    }
}
