use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::sync::CancellationToken;

use super::{
    error::{FailureCause, PipelineErr, Result, TaskFailure},
    task::{Job, Outcome, TaskResult, WorkerMsg},
};

/// One dedicated OS thread executing the tasks of the partitions placed on it.
///
/// The worker owns both ends of its queues that the coordinator talks to: jobs go in through an
/// unbounded FIFO and results come back, in the same order, through another one.
pub struct Worker<T> {
    worker_id: usize,
    tx: UnboundedSender<WorkerMsg<T>>,
    rx: UnboundedReceiver<TaskResult<T>>,
    handle: Option<JoinHandle<()>>,
    // Jobs submitted whose result hasn't been received yet.
    pending: usize,
    stuck: bool,
}

impl<T: Send + 'static> Worker<T> {
    /// Starts a new worker thread.
    ///
    /// # Arguments
    /// * `worker_id` - Identifier used for observability.
    /// * `name` - The OS thread name.
    /// * `cancel` - Token of the run, once cancelled queued jobs are answered with `Cancelled`.
    ///
    /// # Returns
    /// The running worker or `PipelineErr::WorkerSpawn` if the thread couldn't be started.
    pub fn spawn(worker_id: usize, name: String, cancel: CancellationToken) -> Result<Self> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || work(worker_id, in_rx, out_tx, cancel))
            .map_err(|source| PipelineErr::WorkerSpawn { worker_id, source })?;

        Ok(Self {
            worker_id,
            tx: in_tx,
            rx: out_rx,
            handle: Some(handle),
            pending: 0,
            stuck: false,
        })
    }
}

impl<T> Worker<T> {
    pub fn id(&self) -> usize {
        self.worker_id
    }

    /// Enqueues a job on this worker's input queue.
    ///
    /// # Returns
    /// `FailureCause::WorkerLost` if the worker thread is gone.
    pub fn submit(&mut self, job: Job<T>) -> std::result::Result<(), FailureCause> {
        self.tx
            .send(WorkerMsg::Run(job))
            .map_err(|_| FailureCause::WorkerLost)?;

        self.pending += 1;
        Ok(())
    }

    /// The amount of submitted jobs whose result hasn't been received yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Waits for the next result on this worker's output queue.
    ///
    /// # Arguments
    /// * `limit` - Optional bound on the wait, expiry marks the worker as stuck.
    ///
    /// # Returns
    /// The next result in submission order, `WorkerTimeout` if the bound expired or `WorkerLost`
    /// if the queue closed.
    pub async fn recv(
        &mut self,
        limit: Option<Duration>,
    ) -> std::result::Result<TaskResult<T>, FailureCause> {
        let received = match limit {
            Some(limit) => match time::timeout(limit, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    error!(worker_id = self.worker_id; "no result after {}ms", limit.as_millis());
                    self.stuck = true;
                    return Err(FailureCause::WorkerTimeout(limit));
                }
            },
            None => self.rx.recv().await,
        };

        let result = received.ok_or(FailureCause::WorkerLost)?;
        self.pending = self.pending.saturating_sub(1);
        Ok(result)
    }

    /// Asks the worker to stop once it has gone through the jobs already queued.
    pub fn signal_shutdown(&self) {
        // The thread may already be gone, there's nothing left to stop in that case.
        let _ = self.tx.send(WorkerMsg::Shutdown);
    }

    /// Waits for the worker thread to exit.
    ///
    /// A worker that timed out or still owes results may be inside a partition that never
    /// returns, it is detached instead and exits on its own once it sees the closed queues.
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if self.stuck || self.pending > 0 {
            warn!(
                worker_id = self.worker_id,
                pending = self.pending;
                "detaching worker with unfinished jobs"
            );
            return;
        }

        if handle.join().is_err() {
            error!(worker_id = self.worker_id; "worker thread panicked");
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.signal_shutdown();
        self.join();
    }
}

/// The worker thread's loop: block for a job, run it, publish the result.
fn work<T>(
    worker_id: usize,
    mut rx: UnboundedReceiver<WorkerMsg<T>>,
    tx: UnboundedSender<TaskResult<T>>,
    cancel: CancellationToken,
) {
    debug!(worker_id = worker_id; "worker started");

    while let Some(msg) = rx.blocking_recv() {
        let WorkerMsg::Run(job) = msg else {
            break;
        };

        let Job {
            task,
            value,
            partition,
        } = job;

        if cancel.is_cancelled() {
            debug!(worker_id = worker_id; "skipping task {task}, run cancelled");
            let result = TaskResult {
                task,
                outcome: Outcome::Cancelled,
                elapsed: Duration::ZERO,
            };

            if tx.send(result).is_err() {
                break;
            }

            continue;
        }

        let start = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| partition.apply(value))) {
            Ok(Ok(value)) => Outcome::Done(value),
            Ok(Err(cause)) => {
                warn!(worker_id = worker_id; "task {task} failed: {cause}");
                Outcome::Failed(TaskFailure {
                    microbatch_idx: task.microbatch_idx,
                    partition_idx: task.partition_idx,
                    cause,
                })
            }
            Err(payload) => {
                let msg = panic_message(payload);
                warn!(worker_id = worker_id; "task {task} panicked: {msg}");
                Outcome::Failed(TaskFailure {
                    microbatch_idx: task.microbatch_idx,
                    partition_idx: task.partition_idx,
                    cause: msg.into(),
                })
            }
        };

        let result = TaskResult {
            task,
            outcome,
            elapsed: start.elapsed(),
        };

        // The coordinator dropped its end, nobody is waiting for more results.
        if tx.send(result).is_err() {
            break;
        }
    }

    debug!(worker_id = worker_id; "worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("partition panicked: {msg}");
    }

    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("partition panicked: {msg}");
    }

    "partition panicked".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        orchestra::{BoxError, Task},
        partition::Partition,
    };

    fn job(task: Task, value: i64, partition: Arc<dyn Partition<i64>>) -> Job<i64> {
        Job {
            task,
            value,
            partition,
        }
    }

    fn partition<F>(f: F) -> Arc<dyn Partition<i64>>
    where
        F: Fn(i64) -> std::result::Result<i64, BoxError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn spawn(cancel: CancellationToken) -> Worker<i64> {
        Worker::spawn(0, "test-worker".into(), cancel).unwrap()
    }

    #[tokio::test]
    async fn results_come_back_in_submission_order() {
        let mut worker = spawn(CancellationToken::new());
        let inc = partition(|x| Ok(x + 1));

        for i in 0..4 {
            worker.submit(job(Task::new(i, 0), i as i64 * 10, inc.clone())).unwrap();
        }

        assert_eq!(worker.pending(), 4);

        for i in 0..4 {
            let result = worker.recv(None).await.unwrap();
            assert_eq!(result.task, Task::new(i, 0));
            assert!(matches!(result.outcome, Outcome::Done(v) if v == i as i64 * 10 + 1));
        }
    }

    #[tokio::test]
    async fn failures_are_tagged_not_fatal() {
        let mut worker = spawn(CancellationToken::new());
        let fail = partition(|x| if x < 0 { Err("negative".into()) } else { Ok(x) });

        worker.submit(job(Task::new(2, 1), -1, fail.clone())).unwrap();
        worker.submit(job(Task::new(3, 1), 5, fail)).unwrap();

        let failed = worker.recv(None).await.unwrap();
        assert_eq!(failed.task, Task::new(2, 1));
        let Outcome::Failed(failure) = failed.outcome else {
            panic!("expected a failure");
        };
        assert_eq!((failure.microbatch_idx, failure.partition_idx), (2, 1));
        assert_eq!(failure.cause.to_string(), "negative");

        let next = worker.recv(None).await.unwrap();
        assert!(matches!(next.outcome, Outcome::Done(5)));
    }

    #[tokio::test]
    async fn panics_are_reported_as_failures() {
        let mut worker = spawn(CancellationToken::new());
        let boom = partition(|_| panic!("kaboom"));

        worker.submit(job(Task::new(0, 0), 0, boom)).unwrap();

        let result = worker.recv(None).await.unwrap();
        let Outcome::Failed(failure) = result.outcome else {
            panic!("expected a failure");
        };
        assert!(failure.cause.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn cancelled_runs_skip_queued_jobs() {
        let cancel = CancellationToken::new();
        let mut worker = spawn(cancel.clone());
        let id = partition(Ok);

        cancel.cancel();
        worker.submit(job(Task::new(0, 0), 1, id)).unwrap();

        let result = worker.recv(None).await.unwrap();
        assert!(matches!(result.outcome, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn timeout_marks_worker_stuck() {
        let mut worker = spawn(CancellationToken::new());
        let slow = partition(|x| {
            thread::sleep(Duration::from_millis(300));
            Ok(x)
        });

        worker.submit(job(Task::new(0, 0), 1, slow)).unwrap();

        let err = worker.recv(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, FailureCause::WorkerTimeout(_)));
        assert!(worker.stuck);
    }

    #[test]
    fn shutdown_joins_the_thread() {
        let mut worker: Worker<i64> = spawn(CancellationToken::new());
        assert_eq!(worker.id(), 0);
        assert_eq!(worker.pending(), 0);
        worker.signal_shutdown();
        worker.join();
        assert!(worker.handle.is_none());
        assert!(worker.submit(job(Task::new(0, 0), 0, partition(Ok))).is_err());
    }

    #[test]
    fn join_detaches_a_worker_that_owes_results() {
        let mut worker = spawn(CancellationToken::new());
        let hang = partition(|x| {
            thread::sleep(Duration::from_secs(30));
            Ok(x)
        });

        worker.submit(job(Task::new(0, 0), 1, hang)).unwrap();
        assert_eq!(worker.pending(), 1);

        let start = Instant::now();
        worker.signal_shutdown();
        worker.join();

        assert!(worker.handle.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
