use thiserror::Error;

use ir_tensor::{DType, DataFormat, TensorError, TensorId};

use crate::backend::Phase;
use crate::foreign::{DataType, Format};

#[derive(Error, Debug)]
pub enum AccelError {
    #[error("accelerator driver unavailable: {0}")]
    DriverUnavailable(String),
    #[error("driver symbol {0} could not be resolved")]
    MissingSymbol(String),
    #[error("accelerator backend has no driver")]
    NoAccelerator,
    #[error("dtype {0} has no accelerator equivalent")]
    UnsupportedDataType(DType),
    #[error("layout {0} has no accelerator equivalent")]
    UnsupportedFormat(DataFormat),
    #[error("driver call {0} returned no handle")]
    ForeignCall(&'static str),
    #[error("driver call {call} failed with status {status}")]
    ForeignStatus { call: &'static str, status: i32 },
    #[error("tensor {0} has no accelerator memory object")]
    NoMemObject(TensorId),
    #[error("copy refused: source holds {src} bytes but destination only {dst}")]
    CopyOverflow { src: usize, dst: usize },
    #[error("copy refused: {src_type:?}/{src_format:?} is not compatible with {dst_type:?}/{dst_format:?}")]
    CopyIncompatible {
        src_type: DataType,
        src_format: Format,
        dst_type: DataType,
        dst_format: Format,
    },
    #[error("copy refused: tensor {0} has no addressable memory")]
    CopyUnmapped(TensorId),
    #[error("{op}: expected {expected_inputs} input(s) and {expected_outputs} output(s), got {inputs} and {outputs}")]
    ArityMismatch {
        op: String,
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },
    #[error("{0}: no executor, resize has not succeeded")]
    ExecutorMissing(String),
    #[error("resize of op {op} failed, pass aborted")]
    ResizeFailed { op: String },
    #[error("init op {op} failed")]
    InitFailed {
        op: String,
        #[source]
        source: Box<AccelError>,
    },
    #[error("operation requires phase {expected:?}, backend is in {actual:?}")]
    InvalidPhase { expected: Phase, actual: Phase },
    #[error("unknown accelerated execution #{0}")]
    UnknownExecution(usize),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

impl AccelError {
    /// Failures of the driver's allocator that may succeed with a fresh attempt.
    /// Rejections of a type or layout are deterministic and are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AccelError::ForeignCall(_) | AccelError::ForeignStatus { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
