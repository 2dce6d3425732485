//! `ir-tensor` - Tensor model and generic compute backend contract for inference-runtime.
//!
//! This crate provides:
//! - A logical `Tensor` with identity, shape, element type, layout tag and a storage binding
//! - Operator descriptions (`Op`, `OpType`, convolution parameters)
//! - The `ComputeBackend` / `Execution` traits implemented by the generic host backend
//! - A reference `CpuBackend` that owns host storage and builds host executions
//!   from an explicit kernel registry

pub mod backend;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod format;
pub mod op;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use backend::{ComputeBackend, Execution};
pub use cpu::{CpuBackend, KernelFactory};
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use format::DataFormat;
pub use op::{Conv2dCommon, Conv2dParams, Op, OpParams, OpType, PadMode};
pub use shape::Shape;
pub use storage::{CpuStorage, DeviceView, TensorStorage};
pub use tensor::{Tensor, TensorId};
