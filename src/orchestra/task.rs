use std::{fmt, sync::Arc, time::Duration};

use crate::{orchestra::error::TaskFailure, partition::Partition};

/// Run partition `partition_idx` on the current value of microbatch `microbatch_idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Task {
    pub microbatch_idx: usize,
    pub partition_idx: usize,
}

impl Task {
    pub fn new(microbatch_idx: usize, partition_idx: usize) -> Self {
        Self {
            microbatch_idx,
            partition_idx,
        }
    }

    /// The clock cycle this task belongs to in the deterministic schedule.
    pub fn clock(&self) -> usize {
        self.microbatch_idx + self.partition_idx
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.microbatch_idx, self.partition_idx)
    }
}

/// A task together with everything a worker needs to execute it.
pub struct Job<T> {
    pub task: Task,
    pub value: T,
    pub partition: Arc<dyn Partition<T>>,
}

/// Messages accepted by a worker's input queue.
pub enum WorkerMsg<T> {
    Run(Job<T>),
    Shutdown,
}

/// What became of a submitted task.
pub enum Outcome<T> {
    Done(T),
    Failed(TaskFailure),
    Cancelled,
}

/// A worker's answer to one job, tagged with the task it belongs to.
pub struct TaskResult<T> {
    pub task: Task,
    pub outcome: Outcome<T>,
    /// Time spent inside the partition's `apply`.
    pub elapsed: Duration,
}

impl<T> fmt::Debug for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.outcome {
            Outcome::Done(_) => "done",
            Outcome::Failed(_) => "failed",
            Outcome::Cancelled => "cancelled",
        };

        f.debug_struct("TaskResult")
            .field("task", &self.task)
            .field("outcome", &outcome)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}
