use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::{PipelineErr, Result};

const DEFAULT_WORKER_NAME_PREFIX: &str = "pipeline-worker";

/// Execution settings for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound, in milliseconds, on the wait for each task result. `None` waits forever.
    pub task_timeout_ms: Option<u64>,
    /// Prefix for the OS thread name of every worker.
    pub worker_name_prefix: String,
    /// Device of every partition, partitions on the same device share a worker.
    pub devices: Option<Vec<usize>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: None,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            devices: None,
        }
    }
}

impl PipelineConfig {
    /// Parses a configuration from a JSON document.
    ///
    /// # Errors
    /// Returns `PipelineErr::InvalidConfig` if the document is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| PipelineErr::InvalidConfig(format!("malformed config: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            PipelineErr::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;

        Self::from_json(&json)
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_devices(mut self, devices: Vec<usize>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the settings that don't depend on the pipeline's shape.
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_ms == Some(0) {
            return Err(PipelineErr::InvalidConfig(
                "task_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.worker_name_prefix.is_empty() {
            return Err(PipelineErr::InvalidConfig(
                "worker_name_prefix must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Maps every partition to the worker that runs it.
    ///
    /// # Arguments
    /// * `partitions` - The amount of partitions in the pipeline.
    ///
    /// # Returns
    /// The worker id of each partition and the amount of workers, or an error if the configured
    /// devices don't cover exactly `partitions` partitions.
    pub fn placement(&self, partitions: usize) -> Result<(Vec<usize>, usize)> {
        let Some(devices) = &self.devices else {
            return Ok(((0..partitions).collect(), partitions));
        };

        if devices.len() != partitions {
            return Err(PipelineErr::InvalidConfig(format!(
                "got {} devices for {partitions} partitions",
                devices.len()
            )));
        }

        // Worker ids follow the order in which devices first appear.
        let mut seen: Vec<usize> = Vec::new();
        let placement = devices
            .iter()
            .map(|device| match seen.iter().position(|d| d == device) {
                Some(id) => id,
                None => {
                    seen.push(*device);
                    seen.len() - 1
                }
            })
            .collect();

        Ok((placement, seen.len()))
    }
}
