//! Owning wrappers around driver handles. Each wrapper destroys its handle
//! exactly once when dropped.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::error::{AccelError, Result};

use super::types::*;
use super::Driver;

pub struct TensorDesc {
    driver: Driver,
    handle: TensorDescHandle,
}

impl TensorDesc {
    pub fn create(
        driver: &Driver,
        dims: &[i64],
        data_type: DataType,
        format: Format,
        is_virtual: bool,
    ) -> Result<Self> {
        let handle = driver
            .tensor_desc_create(dims, data_type, format, is_virtual)
            .ok_or(AccelError::ForeignCall("SingleOpTensorDesc_Create"))?;
        Ok(TensorDesc {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn handle(&self) -> TensorDescHandle {
        self.handle
    }

    pub fn dims(&self) -> Vec<i64> {
        self.driver.tensor_desc_dims(self.handle)
    }

    pub fn data_type(&self) -> DataType {
        self.driver.tensor_desc_data_type(self.handle)
    }

    pub fn format(&self) -> Format {
        self.driver.tensor_desc_format(self.handle)
    }

    pub fn is_virtual(&self) -> bool {
        self.driver.tensor_desc_is_virtual(self.handle)
    }

    pub fn byte_size(&self) -> usize {
        self.driver.tensor_desc_byte_size(self.handle)
    }
}

impl Drop for TensorDesc {
    fn drop(&mut self) {
        self.driver.tensor_desc_destroy(self.handle);
    }
}

impl fmt::Debug for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TensorDesc").field(&self.handle).finish()
    }
}

pub struct ForeignTensor {
    driver: Driver,
    handle: TensorHandle,
}

impl ForeignTensor {
    /// Allocate a driver tensor with storage laid out by `desc`.
    pub fn from_desc(driver: &Driver, desc: &TensorDesc) -> Result<Self> {
        let handle = driver
            .tensor_create_from_desc(desc.handle())
            .ok_or(AccelError::ForeignCall("SingleOpTensor_CreateFromTensorDesc"))?;
        Ok(ForeignTensor {
            driver: Arc::clone(driver),
            handle,
        })
    }

    /// Constant tensor initialised from host bytes.
    pub fn from_const(driver: &Driver, desc: &TensorDesc, data: &[u8]) -> Result<Self> {
        let handle = driver
            .tensor_create_from_const(desc.handle(), data)
            .ok_or(AccelError::ForeignCall("SingleOpTensor_CreateFromConst"))?;
        Ok(ForeignTensor {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn handle(&self) -> TensorHandle {
        self.handle
    }

    /// Address of the backing storage, or 0 while it is deferred.
    pub fn data_addr(&self) -> usize {
        self.driver
            .tensor_buffer(self.handle)
            .map(|buf| self.driver.buffer_data(buf) as usize)
            .unwrap_or(0)
    }

    /// Byte size reported by the tensor's own descriptor.
    pub fn byte_size(&self) -> usize {
        self.driver
            .tensor_desc_of(self.handle)
            .map(|desc| self.driver.tensor_desc_byte_size(desc))
            .unwrap_or(0)
    }
}

impl Drop for ForeignTensor {
    fn drop(&mut self) {
        let status = self.driver.tensor_destroy(self.handle);
        if status != STATUS_SUCCESS {
            log::warn!("SingleOpTensor_Destroy({:?}) returned {}", self.handle, status);
        }
    }
}

impl fmt::Debug for ForeignTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForeignTensor").field(&self.handle).finish()
    }
}

pub struct ForeignBuffer {
    driver: Driver,
    handle: BufferHandle,
}

impl ForeignBuffer {
    pub fn create(driver: &Driver, size: usize) -> Result<Self> {
        let handle = driver
            .buffer_create(size)
            .ok_or(AccelError::ForeignCall("SingleOpBuffer_Create"))?;
        Ok(ForeignBuffer {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.driver.buffer_size(self.handle)
    }

    pub fn data(&self) -> *mut c_void {
        self.driver.buffer_data(self.handle)
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        let status = self.driver.buffer_destroy(self.handle);
        if status != STATUS_SUCCESS {
            log::warn!("SingleOpBuffer_Destroy({:?}) returned {}", self.handle, status);
        }
    }
}

impl fmt::Debug for ForeignBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForeignBuffer").field(&self.handle).finish()
    }
}

pub struct Options {
    driver: Driver,
    handle: OptionsHandle,
}

impl Options {
    pub fn create(driver: &Driver) -> Result<Self> {
        let handle = driver
            .options_create()
            .ok_or(AccelError::ForeignCall("SingleOpOptions_Create"))?;
        Ok(Options {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn handle(&self) -> OptionsHandle {
        self.handle
    }
}

impl Drop for Options {
    fn drop(&mut self) {
        self.driver.options_destroy(self.handle);
    }
}

pub struct OpDescriptor {
    driver: Driver,
    handle: OpDescHandle,
}

impl OpDescriptor {
    pub fn convolution(driver: &Driver, conv: &ConvDescriptor) -> Result<Self> {
        let handle = driver
            .conv_descriptor_create(conv)
            .ok_or(AccelError::ForeignCall("SingleOpDescriptor_CreateConvolution"))?;
        Ok(OpDescriptor {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn activation(driver: &Driver, activation: ActivationType, coef: f32) -> Result<Self> {
        let handle = driver
            .activation_descriptor_create(activation, coef)
            .ok_or(AccelError::ForeignCall("SingleOpDescriptor_CreateActivation"))?;
        Ok(OpDescriptor {
            driver: Arc::clone(driver),
            handle,
        })
    }

    pub fn handle(&self) -> OpDescHandle {
        self.handle
    }
}

impl Drop for OpDescriptor {
    fn drop(&mut self) {
        self.driver.op_descriptor_destroy(self.handle);
    }
}

/// A compiled operator instance on the accelerator.
pub struct Executor {
    driver: Driver,
    handle: ExecutorHandle,
}

impl Executor {
    /// Take ownership of an executor handle returned by a create call.
    pub fn from_handle(driver: &Driver, handle: ExecutorHandle) -> Self {
        Executor {
            driver: Arc::clone(driver),
            handle,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle
    }

    pub fn workspace_size(&self) -> usize {
        self.driver.executor_workspace_size(self.handle)
    }

    pub fn update_output_desc(&self, index: u32, desc: TensorDescHandle) -> Result<()> {
        check(
            self.driver
                .executor_update_output_desc(self.handle, index, desc),
            "SingleOpExecutor_UpdateOutputTensorDesc",
        )
    }

    pub fn init(&self, workspace: *mut c_void, size: usize) -> Result<()> {
        check(
            self.driver.executor_init(self.handle, workspace, size),
            "SingleOpExecutor_Init",
        )
    }

    pub fn execute(&self, inputs: &[TensorHandle], outputs: &[TensorHandle]) -> Result<()> {
        check(
            self.driver.executor_execute(self.handle, inputs, outputs),
            "SingleOpExecutor_Execute",
        )
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let status = self.driver.executor_destroy(self.handle);
        if status != STATUS_SUCCESS {
            log::warn!("SingleOpExecutor_Destroy({:?}) returned {}", self.handle, status);
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Executor").field(&self.handle).finish()
    }
}
