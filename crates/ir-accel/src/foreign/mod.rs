//! Foreign handle layer: the capability surface of the vendor single-op driver.
//!
//! The driver is an opaque set of create/destroy pairs plus a blocking execute
//! call. [`SopDriver`] models it as a trait object so the dynamically loaded
//! library ([`DylibDriver`]) and in-process doubles are interchangeable.

mod dylib;
#[cfg(test)]
pub(crate) mod mock;
mod resource;
mod types;

use std::ffi::c_void;
use std::fmt::Debug;
use std::sync::Arc;

pub use dylib::DylibDriver;
pub use resource::{Executor, ForeignBuffer, ForeignTensor, OpDescriptor, Options, TensorDesc};
pub use types::*;

/// Shared handle to the loaded driver.
pub type Driver = Arc<dyn SopDriver>;

/// Every entry point of the driver the backend relies on.
///
/// Create calls return `None` when the driver hands back a null handle.
/// Destroy calls must be made exactly once per created handle; the RAII
/// wrappers in this module take care of that.
pub trait SopDriver: Send + Sync + Debug {
    // Tensor descriptors
    fn tensor_desc_create(
        &self,
        dims: &[i64],
        data_type: DataType,
        format: Format,
        is_virtual: bool,
    ) -> Option<TensorDescHandle>;
    fn tensor_desc_dims(&self, desc: TensorDescHandle) -> Vec<i64>;
    fn tensor_desc_data_type(&self, desc: TensorDescHandle) -> DataType;
    fn tensor_desc_format(&self, desc: TensorDescHandle) -> Format;
    fn tensor_desc_is_virtual(&self, desc: TensorDescHandle) -> bool;
    fn tensor_desc_byte_size(&self, desc: TensorDescHandle) -> usize;
    fn tensor_desc_destroy(&self, desc: TensorDescHandle);

    // Buffers
    fn buffer_create(&self, size: usize) -> Option<BufferHandle>;
    fn buffer_size(&self, buffer: BufferHandle) -> usize;
    /// Host-visible address of the buffer; null while the storage is deferred.
    fn buffer_data(&self, buffer: BufferHandle) -> *mut c_void;
    fn buffer_destroy(&self, buffer: BufferHandle) -> Status;

    // Tensors
    fn tensor_create_from_desc(&self, desc: TensorDescHandle) -> Option<TensorHandle>;
    /// Create a constant tensor; the driver copies `data`.
    fn tensor_create_from_const(&self, desc: TensorDescHandle, data: &[u8])
        -> Option<TensorHandle>;
    /// Descriptor owned by the tensor; must not be destroyed by the caller.
    fn tensor_desc_of(&self, tensor: TensorHandle) -> Option<TensorDescHandle>;
    /// Buffer owned by the tensor; must not be destroyed by the caller.
    fn tensor_buffer(&self, tensor: TensorHandle) -> Option<BufferHandle>;
    fn tensor_destroy(&self, tensor: TensorHandle) -> Status;

    // Operator descriptors
    fn options_create(&self) -> Option<OptionsHandle>;
    fn options_destroy(&self, options: OptionsHandle);
    fn conv_descriptor_create(&self, conv: &ConvDescriptor) -> Option<OpDescHandle>;
    fn activation_descriptor_create(
        &self,
        activation: ActivationType,
        coef: f32,
    ) -> Option<OpDescHandle>;
    fn op_descriptor_destroy(&self, desc: OpDescHandle);

    // Executors
    fn precheck_convolution(&self, request: &ConvRequest) -> SupportStatus;
    fn precheck_fused_convolution_activation(
        &self,
        request: &ConvRequest,
        activation: OpDescHandle,
    ) -> SupportStatus;
    fn executor_create_convolution(&self, request: &ConvRequest) -> Option<ExecutorHandle>;
    fn executor_create_fused_convolution_activation(
        &self,
        request: &ConvRequest,
        activation: OpDescHandle,
    ) -> Option<ExecutorHandle>;
    fn executor_destroy(&self, executor: ExecutorHandle) -> Status;
    /// Write the resolved descriptor of output `index` into `desc`.
    fn executor_update_output_desc(
        &self,
        executor: ExecutorHandle,
        index: u32,
        desc: TensorDescHandle,
    ) -> Status;
    fn executor_workspace_size(&self, executor: ExecutorHandle) -> usize;
    fn executor_init(&self, executor: ExecutorHandle, workspace: *mut c_void, size: usize)
        -> Status;
    /// Blocking execute; not reentrant per executor.
    fn executor_execute(
        &self,
        executor: ExecutorHandle,
        inputs: &[TensorHandle],
        outputs: &[TensorHandle],
    ) -> Status;
}
