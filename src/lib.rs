pub mod orchestra;
pub mod parallel;
pub mod partition;

pub use orchestra::{Pipeline, PipelineConfig, PipelineErr};
pub use partition::{Dense, Partition, Sequence};
