mod collective;
mod error;
mod group;
mod linear;
mod stage;

pub use collective::{Collective, shard};
pub use error::{CollectiveErr, Result};
pub use group::{Communicator, LocalComm, ParallelGroup};
pub use linear::{ColumnParallelLinear, LinearGrads, RowParallelLinear};
pub use stage::TensorParallelStage;
