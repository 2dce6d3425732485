use std::collections::HashMap;
use std::fmt;

use crate::backend::{ComputeBackend, Execution};
use crate::error::{Result, TensorError};
use crate::op::{Op, OpType};
use crate::storage::{CpuStorage, TensorStorage};
use crate::tensor::Tensor;

/// Builds a host execution for one operator node.
pub type KernelFactory =
    Box<dyn Fn(&Op, &[&Tensor], &[&Tensor]) -> Result<Box<dyn Execution>> + Send + Sync>;

/// Reference host backend.
///
/// Owns zero-initialised host storage for the tensors routed to it and builds
/// executions from an explicit table of kernel factories. Operators without a
/// registered kernel are reported as unsupported.
pub struct CpuBackend {
    kernels: HashMap<OpType, KernelFactory>,
    allocated_bytes: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            kernels: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    /// Register (or replace) the kernel factory for `op_type`.
    pub fn register_kernel(&mut self, op_type: OpType, factory: KernelFactory) {
        self.kernels.insert(op_type, factory);
    }

    /// Builder-style variant of [`CpuBackend::register_kernel`].
    pub fn with_kernel(mut self, op_type: OpType, factory: KernelFactory) -> Self {
        self.register_kernel(op_type, factory);
        self
    }

    /// Total bytes of host storage currently attached by this backend.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("allocated_bytes", &self.allocated_bytes)
            .finish()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn on_acquire(&mut self, tensor: &mut Tensor) -> Result<()> {
        let numel = tensor.shape().numel();
        if let Some(existing) = tensor.host_storage() {
            if existing.dtype() == tensor.dtype() && existing.len() >= numel {
                return Ok(());
            }
        }
        if let TensorStorage::Host(old) = tensor.unbind() {
            self.allocated_bytes = self.allocated_bytes.saturating_sub(old.byte_len());
        }
        let storage = CpuStorage::zeros(tensor.dtype(), numel);
        self.allocated_bytes += storage.byte_len();
        log::trace!("cpu: acquired {} bytes for {}", storage.byte_len(), tensor.id());
        tensor.bind_host(storage);
        Ok(())
    }

    fn on_release(&mut self, tensor: &mut Tensor) -> Result<()> {
        if tensor.host_storage().is_none() {
            return Err(TensorError::NotAllocated(tensor.id()));
        }
        if let TensorStorage::Host(old) = tensor.unbind() {
            self.allocated_bytes = self.allocated_bytes.saturating_sub(old.byte_len());
        }
        Ok(())
    }

    fn on_create(
        &mut self,
        op: &Op,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<Box<dyn Execution>> {
        match self.kernels.get(&op.op_type) {
            Some(factory) => factory(op, inputs, outputs),
            None => Err(TensorError::UnsupportedOp {
                op_type: op.op_type,
                name: op.name.clone(),
            }),
        }
    }

    fn on_copy_buffer(&mut self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        let src_storage = src.host_storage().ok_or(TensorError::NotAllocated(src.id()))?;
        let dst_id = dst.id();
        let dst_storage = dst
            .host_storage_mut()
            .ok_or(TensorError::NotAllocated(dst_id))?;
        dst_storage.copy_from(src_storage)
    }
}
