use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type of the tensor-parallel module.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Failures of collective operations and the sharded layers built on them.
#[derive(Debug)]
pub enum CollectiveErr {
    /// A dimension can't be cut into equally sized contiguous shards.
    Indivisible { axis: usize, len: usize, parts: usize },
    ShapeMismatch {
        what: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
    AxisOutOfRange(usize),
    InvalidGroup(String),
}

impl Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Indivisible { axis, len, parts } => write!(
                f,
                "can't split axis {axis} of length {len} into {parts} equal shards"
            ),
            CollectiveErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch in {what}: got {got:?}, expected {expected:?}"
            ),
            CollectiveErr::AxisOutOfRange(axis) => {
                write!(f, "axis {axis} is out of range for a matrix")
            }
            CollectiveErr::InvalidGroup(msg) => write!(f, "invalid parallel group: {msg}"),
        }
    }
}

impl Error for CollectiveErr {}
