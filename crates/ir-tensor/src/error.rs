use thiserror::Error;

use crate::op::OpType;
use crate::tensor::TensorId;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: String, got: String },
    #[error("no host kernel for {op_type} (op '{name}')")]
    UnsupportedOp { op_type: OpType, name: String },
    #[error("tensor {0} has no host storage")]
    NotAllocated(TensorId),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
