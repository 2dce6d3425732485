use std::fmt::Debug;

use crate::error::Result;
use crate::op::Op;
use crate::tensor::Tensor;

/// A planned operator instance on the generic backend.
pub trait Execution: Send + Debug {
    /// Name of the operator this execution was built for.
    fn name(&self) -> &str;

    /// Adapt to the current input/output shapes. Called once per resize pass.
    fn on_resize(&mut self, inputs: &[&Tensor], outputs: &[&Tensor]) -> Result<()>;

    /// Run the operator.
    fn on_execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()>;
}

/// Trait for the generic compute backend.
///
/// This is the authoritative path for every operator and tensor that a more
/// specialised backend declines: it owns host memory for host-only tensors and
/// constructs executions for operators nobody else accepted.
pub trait ComputeBackend: Send + Debug {
    /// Returns the name of this backend (e.g., "cpu").
    fn name(&self) -> &str;

    /// Bytes needed to hold `tensor` on this backend.
    fn tensor_size(&self, tensor: &Tensor) -> usize {
        tensor.size_in_bytes()
    }

    /// Attach backend-owned storage to `tensor`.
    fn on_acquire(&mut self, tensor: &mut Tensor) -> Result<()>;

    /// Detach and free the storage previously attached by `on_acquire`.
    fn on_release(&mut self, tensor: &mut Tensor) -> Result<()>;

    /// Build an execution for `op`.
    ///
    /// # Errors
    /// Returns [`crate::TensorError::UnsupportedOp`] when no implementation exists.
    fn on_create(
        &mut self,
        op: &Op,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<Box<dyn Execution>>;

    /// Copy the contents of `src` into `dst`.
    fn on_copy_buffer(&mut self, src: &Tensor, dst: &mut Tensor) -> Result<()>;

    /// Start of a new resize pass.
    fn on_resize_begin(&mut self) {}

    /// End of a resize pass; all allocations for the pass are known.
    fn on_resize_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop cached buffers.
    fn on_clear_buffer(&mut self) {}
}
