use std::time::Duration;

use super::task::Task;

/// What a finished pipeline run observed.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub cycles: usize,
    pub tasks: usize,
    pub elapsed: Duration,

    /// Tasks in the order their results were written back.
    pub timeline: Vec<Task>,

    /// Time each worker spent inside `apply`, indexed by worker id.
    pub busy: Vec<Duration>,
}

impl RunStats {
    pub fn new(workers: usize) -> Self {
        Self {
            busy: vec![Duration::ZERO; workers],
            ..Default::default()
        }
    }

    #[inline]
    pub fn bump_cycle(&mut self) {
        self.cycles += 1;
    }

    #[inline]
    pub fn record(&mut self, worker_id: usize, task: Task, elapsed: Duration) {
        self.tasks += 1;
        self.timeline.push(task);
        self.busy[worker_id] += elapsed;
    }

    /// Fraction of the run each worker spent computing, `None` before anything ran.
    pub fn utilization(&self) -> Option<Vec<f64>> {
        if self.elapsed.is_zero() {
            return None;
        }

        let total = self.elapsed.as_secs_f64();
        Some(self.busy.iter().map(|b| b.as_secs_f64() / total).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_per_worker() {
        let mut stats = RunStats::new(2);
        stats.record(0, Task::new(0, 0), Duration::from_millis(3));
        stats.record(1, Task::new(0, 1), Duration::from_millis(5));
        stats.record(0, Task::new(1, 0), Duration::from_millis(2));

        assert_eq!(stats.tasks, 3);
        assert_eq!(stats.busy, vec![Duration::from_millis(5), Duration::from_millis(5)]);
        assert_eq!(stats.timeline[2], Task::new(1, 0));
        assert!(stats.utilization().is_none());

        stats.elapsed = Duration::from_millis(10);
        assert_eq!(stats.utilization().unwrap(), vec![0.5, 0.5]);
    }
}
