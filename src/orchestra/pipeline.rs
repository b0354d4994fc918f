use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use log::{debug, info};

use super::{
    config::PipelineConfig,
    coordinator::{Coordinator, WorkerPool},
    error::{PipelineErr, Result},
    metrics::RunStats,
    scheduler::{DeterministicScheduler, Scheduler},
};
use crate::partition::Partition;

/// A model split into an ordered sequence of partitions, fed by microbatches.
pub struct Pipeline<T, S = DeterministicScheduler> {
    partitions: Vec<Arc<dyn Partition<T>>>,
    scheduler: S,
    config: PipelineConfig,
}

impl<T> Pipeline<T> {
    /// Creates a new `Pipeline` with the deterministic clock-cycle schedule and default config.
    ///
    /// # Arguments
    /// * `partitions` - The partitions, in the order every microbatch must go through them.
    pub fn new<I>(partitions: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Partition<T>>>,
    {
        Self {
            partitions: partitions.into_iter().collect(),
            scheduler: DeterministicScheduler,
            config: PipelineConfig::default(),
        }
    }
}

impl<T, S> Pipeline<T, S> {
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Swaps the scheduler deciding which tasks run at every cycle.
    pub fn with_scheduler<S2: Scheduler>(self, scheduler: S2) -> Pipeline<T, S2> {
        Pipeline {
            partitions: self.partitions,
            scheduler,
            config: self.config,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl<T, S> Pipeline<T, S>
where
    T: Send + 'static,
    S: Scheduler,
{
    /// Runs every microbatch through every partition.
    ///
    /// # Arguments
    /// * `microbatches` - The initial microbatch values, in order.
    ///
    /// # Returns
    /// The final value of every microbatch, in the same order.
    ///
    /// # Errors
    /// See [`Pipeline::run_with_stats`].
    pub async fn run(&self, microbatches: Vec<T>) -> Result<Vec<T>> {
        let (outputs, _) = self.run_with_stats(microbatches).await?;
        Ok(outputs)
    }

    /// Runs the pipeline and reports what the run observed.
    ///
    /// One worker thread is started per device (per partition by default) and torn down before
    /// returning, whatever the outcome.
    ///
    /// # Errors
    /// * `InvalidConfig` - Empty inputs, bad settings or a device list of the wrong length.
    /// * `WorkerSpawn` - A worker thread couldn't be started.
    /// * `ScheduleViolation` / `IncompleteSchedule` - The scheduler broke the partition order.
    /// * `Failure` - A task failed or a worker timed out, naming the offending task.
    pub async fn run_with_stats(&self, microbatches: Vec<T>) -> Result<(Vec<T>, RunStats)> {
        self.config.validate()?;

        let m = NonZeroUsize::new(microbatches.len())
            .ok_or_else(|| PipelineErr::InvalidConfig("no microbatches to run".into()))?;
        let n = NonZeroUsize::new(self.partitions.len())
            .ok_or_else(|| PipelineErr::InvalidConfig("the pipeline has no partitions".into()))?;

        let (placement, workers) = self.config.placement(n.get())?;
        let pool = WorkerPool::spawn(workers, &self.config.worker_name_prefix)?;

        info!(
            microbatches = m.get(),
            partitions = n.get(),
            workers = workers;
            "starting pipeline run"
        );

        let start = Instant::now();
        let mut coordinator = Coordinator::new(
            microbatches,
            self.partitions.clone(),
            placement,
            pool,
            self.config.task_timeout(),
        );

        for (clock, cycle) in self.scheduler.cycles(m, n).enumerate() {
            debug!(cycle = clock; "dispatching {} task(s)", cycle.len());
            coordinator.run_cycle(clock, &cycle).await?;
        }

        let (outputs, mut stats) = coordinator.finish()?;
        stats.elapsed = start.elapsed();

        info!(
            cycles = stats.cycles,
            tasks = stats.tasks;
            "pipeline run finished in {}ms",
            stats.elapsed.as_millis()
        );

        Ok((outputs, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestra::{BoxError, SequentialScheduler, Task};

    fn add(k: i64) -> Arc<dyn Partition<i64>> {
        Arc::new(move |x: i64| -> std::result::Result<i64, BoxError> { Ok(x + k) })
    }

    #[tokio::test]
    async fn runs_every_partition_in_order() {
        let pipeline = Pipeline::new([add(1), add(10), add(100)]);
        let outputs = pipeline.run(vec![0, 1000, 2000]).await.unwrap();
        assert_eq!(outputs, vec![111, 1111, 2111]);
    }

    #[tokio::test]
    async fn stats_follow_the_schedule() {
        let pipeline = Pipeline::new([add(1), add(1)]);
        let (_, stats) = pipeline.run_with_stats(vec![0, 0, 0]).await.unwrap();

        assert_eq!(stats.cycles, 4);
        assert_eq!(stats.tasks, 6);
        assert_eq!(
            stats.timeline,
            vec![
                Task::new(0, 0),
                Task::new(1, 0),
                Task::new(0, 1),
                Task::new(2, 0),
                Task::new(1, 1),
                Task::new(2, 1),
            ]
        );
    }

    #[tokio::test]
    async fn sequential_scheduler_gives_the_same_outputs() {
        let pipeline = Pipeline::new([add(2), add(3)]).with_scheduler(SequentialScheduler);
        let (outputs, stats) = pipeline.run_with_stats(vec![1, 2]).await.unwrap();

        assert_eq!(outputs, vec![6, 7]);
        assert_eq!(stats.cycles, 4);
    }

    #[tokio::test]
    async fn rejects_empty_inputs() {
        let pipeline = Pipeline::new([add(1)]);
        assert!(matches!(
            pipeline.run(Vec::new()).await,
            Err(PipelineErr::InvalidConfig(_))
        ));

        let empty = Pipeline::new(Vec::<Arc<dyn Partition<i64>>>::new());
        assert!(matches!(
            empty.run(vec![1]).await,
            Err(PipelineErr::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn rejects_mismatched_devices() {
        let cfg = PipelineConfig::default().with_devices(vec![0]);
        let pipeline = Pipeline::new([add(1), add(1)]).with_config(cfg);

        assert!(matches!(
            pipeline.run(vec![0]).await,
            Err(PipelineErr::InvalidConfig(_))
        ));
    }
}
