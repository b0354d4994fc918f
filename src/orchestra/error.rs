use std::{error::Error, fmt, io, time::Duration};

use super::task::Task;

/// Boxed error produced by a partition's `apply`.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The result type of the pipeline engine.
pub type Result<T> = std::result::Result<T, PipelineErr>;

/// A partition failed while computing one task.
///
/// This is what a worker publishes instead of a value, so the coordinator always gets an answer
/// for every task it submitted.
#[derive(Debug)]
pub struct TaskFailure {
    pub microbatch_idx: usize,
    pub partition_idx: usize,
    pub cause: BoxError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task (microbatch {}, partition {}) failed: {}",
            self.microbatch_idx, self.partition_idx, self.cause
        )
    }
}

impl Error for TaskFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Why a pipeline run was aborted.
#[derive(Debug)]
pub enum FailureCause {
    /// The partition returned an error or panicked.
    Task(BoxError),
    /// No result arrived from the worker within the configured bound.
    WorkerTimeout(Duration),
    /// The worker's output queue closed before the result arrived.
    WorkerLost,
    /// The task was dropped because the run had already been cancelled.
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Task(e) => write!(f, "{e}"),
            FailureCause::WorkerTimeout(waited) => {
                write!(f, "worker timed out after {}ms", waited.as_millis())
            }
            FailureCause::WorkerLost => f.write_str("worker disconnected"),
            FailureCause::Cancelled => f.write_str("task cancelled"),
        }
    }
}

/// The aggregate failure surfaced to the caller of a pipeline run.
#[derive(Debug)]
pub struct PipelineFailure {
    pub stage_idx: usize,
    pub microbatch_idx: usize,
    pub cause: FailureCause,
}

impl PipelineFailure {
    /// Returns the `(microbatch_idx, partition_idx)` pair that caused the failure.
    pub fn task(&self) -> (usize, usize) {
        (self.microbatch_idx, self.stage_idx)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, FailureCause::WorkerTimeout(_))
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline failed at stage {} (microbatch {}): {}",
            self.stage_idx, self.microbatch_idx, self.cause
        )
    }
}

impl Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            FailureCause::Task(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<TaskFailure> for PipelineFailure {
    fn from(value: TaskFailure) -> Self {
        Self {
            stage_idx: value.partition_idx,
            microbatch_idx: value.microbatch_idx,
            cause: FailureCause::Task(value.cause),
        }
    }
}

/// Every way a pipeline run can fail.
#[derive(Debug)]
pub enum PipelineErr {
    /// Invalid configuration, caught before any worker is spawned.
    InvalidConfig(String),
    /// The OS refused to start a worker thread.
    WorkerSpawn { worker_id: usize, source: io::Error },
    /// The scheduler emitted a task that can't run at that cycle.
    ScheduleViolation {
        cycle: usize,
        task: Task,
        reason: &'static str,
    },
    /// The schedule ended before a microbatch went through every partition.
    IncompleteSchedule { microbatch_idx: usize, reached: usize },
    /// A task failed or a worker stopped answering mid run.
    Failure(PipelineFailure),
}

impl PipelineErr {
    /// Returns the aggregate failure if the run was aborted by a task or a worker.
    pub fn failure(&self) -> Option<&PipelineFailure> {
        match self {
            PipelineErr::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            PipelineErr::WorkerSpawn { worker_id, source } => {
                write!(f, "failed to spawn worker {worker_id}: {source}")
            }
            PipelineErr::ScheduleViolation {
                cycle,
                task,
                reason,
            } => write!(f, "schedule violation at cycle {cycle} for task {task}: {reason}"),
            PipelineErr::IncompleteSchedule {
                microbatch_idx,
                reached,
            } => write!(
                f,
                "schedule ended with microbatch {microbatch_idx} past only {reached} partition(s)"
            ),
            PipelineErr::Failure(failure) => write!(f, "{failure}"),
        }
    }
}

impl Error for PipelineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineErr::WorkerSpawn { source, .. } => Some(source),
            PipelineErr::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<PipelineFailure> for PipelineErr {
    fn from(value: PipelineFailure) -> Self {
        Self::Failure(value)
    }
}

impl From<TaskFailure> for PipelineErr {
    fn from(value: TaskFailure) -> Self {
        Self::Failure(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_names_its_pair() {
        let failure = TaskFailure {
            microbatch_idx: 2,
            partition_idx: 1,
            cause: "boom".into(),
        };

        let err = PipelineErr::from(failure);
        let failure = err.failure().unwrap();
        assert_eq!(failure.task(), (2, 1));
        assert!(err.to_string().contains("stage 1"));
        assert!(err.to_string().contains("boom"));
    }
}
