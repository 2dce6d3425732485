//! `ir-accel` - Heterogeneous-memory backend for a vendor single-op accelerator.
//!
//! This crate provides:
//! - A storage classifier deciding, per tensor, between host and accelerator memory
//! - A memory arbiter owning the accelerator-resident memory behind logical tensors
//! - `SopBackend`, which routes operators to accelerator adapters or to a generic
//!   host backend and drives the resize / init / execute lifecycle
//! - A convolution adapter, and the driver binding (`libloading`) it runs on

pub mod backend;
pub mod classify;
pub mod config;
pub mod error;
pub mod execution;
pub mod foreign;
pub mod memory;
pub mod ops;
pub mod registry;

pub use backend::{CreatedOp, ExecId, Phase, SopBackend};
pub use classify::{StorageClass, UseCountTable};
pub use config::SopConfig;
pub use error::{AccelError, Result};
pub use execution::{ExecutorSlot, SopContext, SopExecution};
pub use foreign::{Driver, DylibDriver, SopDriver, SupportStatus};
pub use memory::{aligned_size, MemObject, TensorManager};
pub use ops::{ConvolutionFactory, SopConvolution};
pub use registry::{AdapterFactory, AdapterRegistry};
