mod config;
mod coordinator;
mod error;
mod metrics;
mod pipeline;
mod scheduler;
mod task;
mod worker;

pub use config::PipelineConfig;
pub use coordinator::{Coordinator, WorkerPool};
pub use error::{BoxError, FailureCause, PipelineErr, PipelineFailure, Result, TaskFailure};
pub use metrics::RunStats;
pub use pipeline::Pipeline;
pub use scheduler::{
    ClockCycle, ClockCycles, DeterministicScheduler, Scheduler, SequentialScheduler,
    bubble_fraction, clock_cycles,
};
pub use task::{Job, Outcome, Task, TaskResult, WorkerMsg};
pub use worker::Worker;
