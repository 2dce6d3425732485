use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;

use crate::error::{AccelError, Result};

use super::types::*;
use super::SopDriver;

type Raw = *mut c_void;

type TensorDescCreateFn = unsafe extern "C" fn(
    dims: *const i64,
    dim_num: usize,
    data_type: i32,
    format: i32,
    is_virtual: bool,
) -> Raw;
type TensorDescGetDimensionCountFn = unsafe extern "C" fn(desc: Raw) -> usize;
type TensorDescGetDimensionFn = unsafe extern "C" fn(desc: Raw, index: usize) -> i64;
type TensorDescGetDataTypeFn = unsafe extern "C" fn(desc: Raw) -> i32;
type TensorDescGetFormatFn = unsafe extern "C" fn(desc: Raw) -> i32;
type TensorDescIsVirtualFn = unsafe extern "C" fn(desc: Raw) -> bool;
type TensorDescGetByteSizeFn = unsafe extern "C" fn(desc: Raw) -> usize;
type TensorDescDestroyFn = unsafe extern "C" fn(desc: *mut Raw);

type BufferCreateFn = unsafe extern "C" fn(size: usize) -> Raw;
type BufferGetSizeFn = unsafe extern "C" fn(buffer: Raw) -> usize;
type BufferGetDataFn = unsafe extern "C" fn(buffer: Raw) -> *mut c_void;
type BufferDestroyFn = unsafe extern "C" fn(buffer: *mut Raw) -> Status;

type TensorCreateFromTensorDescFn = unsafe extern "C" fn(desc: Raw) -> Raw;
type TensorCreateFromConstFn =
    unsafe extern "C" fn(desc: Raw, data: *mut c_void, size: usize) -> Raw;
type TensorGetTensorDescFn = unsafe extern "C" fn(tensor: Raw) -> Raw;
type TensorGetBufferFn = unsafe extern "C" fn(tensor: Raw) -> Raw;
type TensorDestroyFn = unsafe extern "C" fn(tensor: *mut Raw) -> Status;

type OptionsCreateFn = unsafe extern "C" fn() -> Raw;
type OptionsDestroyFn = unsafe extern "C" fn(options: *mut Raw);
type DescriptorCreateConvolutionFn = unsafe extern "C" fn(
    conv_mode: i32,
    strides: *const i64,
    dilations: *const i64,
    pads: *const i64,
    groups: i64,
    pad_mode: i32,
) -> Raw;
type DescriptorCreateActivationFn = unsafe extern "C" fn(activation: i32, coef: f32) -> Raw;
type DescriptorDestroyFn = unsafe extern "C" fn(desc: *mut Raw);

type PreCheckConvolutionFn = unsafe extern "C" fn(
    options: Raw,
    conv: Raw,
    input: Raw,
    output: Raw,
    filter: Raw,
    bias: Raw,
) -> i32;
type CreateConvolutionFn = unsafe extern "C" fn(
    options: Raw,
    conv: Raw,
    input: Raw,
    output: Raw,
    filter: Raw,
    bias: Raw,
) -> Raw;
type PreCheckFusedFn = unsafe extern "C" fn(
    options: Raw,
    conv: Raw,
    activation: Raw,
    input: Raw,
    output: Raw,
    filter: Raw,
    bias: Raw,
) -> i32;
type CreateFusedFn = unsafe extern "C" fn(
    options: Raw,
    conv: Raw,
    activation: Raw,
    input: Raw,
    output: Raw,
    filter: Raw,
    bias: Raw,
) -> Raw;
type ExecutorDestroyFn = unsafe extern "C" fn(executor: *mut Raw) -> Status;
type ExecutorUpdateOutputTensorDescFn =
    unsafe extern "C" fn(executor: Raw, index: u32, desc: Raw) -> Status;
type ExecutorGetWorkspaceSizeFn = unsafe extern "C" fn(executor: Raw) -> usize;
type ExecutorInitFn =
    unsafe extern "C" fn(executor: Raw, workspace: *mut c_void, size: usize) -> Status;
type ExecutorExecuteFn = unsafe extern "C" fn(
    executor: Raw,
    inputs: *mut Raw,
    input_num: i32,
    outputs: *mut Raw,
    output_num: i32,
) -> Status;

struct SymbolTable {
    tensor_desc_create: TensorDescCreateFn,
    tensor_desc_get_dimension_count: TensorDescGetDimensionCountFn,
    tensor_desc_get_dimension: TensorDescGetDimensionFn,
    tensor_desc_get_data_type: TensorDescGetDataTypeFn,
    tensor_desc_get_format: TensorDescGetFormatFn,
    tensor_desc_is_virtual: TensorDescIsVirtualFn,
    tensor_desc_get_byte_size: TensorDescGetByteSizeFn,
    tensor_desc_destroy: TensorDescDestroyFn,
    buffer_create: BufferCreateFn,
    buffer_get_size: BufferGetSizeFn,
    buffer_get_data: BufferGetDataFn,
    buffer_destroy: BufferDestroyFn,
    tensor_create_from_tensor_desc: TensorCreateFromTensorDescFn,
    tensor_create_from_const: TensorCreateFromConstFn,
    tensor_get_tensor_desc: TensorGetTensorDescFn,
    tensor_get_buffer: TensorGetBufferFn,
    tensor_destroy: TensorDestroyFn,
    options_create: OptionsCreateFn,
    options_destroy: OptionsDestroyFn,
    descriptor_create_convolution: DescriptorCreateConvolutionFn,
    descriptor_create_activation: DescriptorCreateActivationFn,
    descriptor_destroy: DescriptorDestroyFn,
    executor_pre_check_convolution: PreCheckConvolutionFn,
    executor_create_convolution: CreateConvolutionFn,
    executor_pre_check_fused: PreCheckFusedFn,
    executor_create_fused: CreateFusedFn,
    executor_destroy: ExecutorDestroyFn,
    executor_update_output_tensor_desc: ExecutorUpdateOutputTensorDescFn,
    executor_get_workspace_size: ExecutorGetWorkspaceSizeFn,
    executor_init: ExecutorInitFn,
    executor_execute: ExecutorExecuteFn,
}

/// The vendor single-op library, loaded at runtime.
///
/// Every symbol is resolved up front; if any is missing the driver is not
/// constructed at all and the accelerated path stays disabled.
pub struct DylibDriver {
    _lib: Library,
    path: PathBuf,
    fns: SymbolTable,
}

impl fmt::Debug for DylibDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibDriver")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DylibDriver {
    /// Load the first library in `candidates` that opens and resolve its symbols.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        let mut tried = Vec::new();
        for candidate in candidates {
            let path = candidate.as_ref();
            // SAFETY: opening a candidate library; no initialisers are relied upon.
            match unsafe { Library::new(path) } {
                Ok(lib) => return Self::from_library(lib, path.to_path_buf()),
                Err(err) => tried.push(format!("{}: {err}", path.display())),
            }
        }
        Err(AccelError::DriverUnavailable(if tried.is_empty() {
            "no library candidates configured".to_string()
        } else {
            tried.join("; ")
        }))
    }

    fn from_library(lib: Library, path: PathBuf) -> Result<Self> {
        let fns = SymbolTable {
            tensor_desc_create: load_symbol(&lib, b"HiAI_SingleOpTensorDesc_Create\0")?,
            tensor_desc_get_dimension_count: load_symbol(
                &lib,
                b"HiAI_SingleOpTensorDesc_GetDimensionCount\0",
            )?,
            tensor_desc_get_dimension: load_symbol(
                &lib,
                b"HiAI_SingleOpTensorDesc_GetDimension\0",
            )?,
            tensor_desc_get_data_type: load_symbol(
                &lib,
                b"HiAI_SingleOpTensorDesc_GetDataType\0",
            )?,
            tensor_desc_get_format: load_symbol(&lib, b"HiAI_SingleOpTensorDesc_GetFormat\0")?,
            tensor_desc_is_virtual: load_symbol(&lib, b"HiAI_SingleOpTensorDesc_IsVirtual\0")?,
            tensor_desc_get_byte_size: load_symbol(
                &lib,
                b"HiAI_SingleOpTensorDesc_GetByteSize\0",
            )?,
            tensor_desc_destroy: load_symbol(&lib, b"HiAI_SingleOpTensorDesc_Destroy\0")?,
            buffer_create: load_symbol(&lib, b"HiAI_SingleOpBuffer_Create\0")?,
            buffer_get_size: load_symbol(&lib, b"HiAI_SingleOpBuffer_GetSize\0")?,
            buffer_get_data: load_symbol(&lib, b"HiAI_SingleOpBuffer_GetData\0")?,
            buffer_destroy: load_symbol(&lib, b"HiAI_SingleOpBuffer_Destroy\0")?,
            tensor_create_from_tensor_desc: load_symbol(
                &lib,
                b"HiAI_SingleOpTensor_CreateFromTensorDesc\0",
            )?,
            tensor_create_from_const: load_symbol(
                &lib,
                b"HiAI_SingleOpTensor_CreateFromConst\0",
            )?,
            tensor_get_tensor_desc: load_symbol(&lib, b"HiAI_SingleOpTensor_GetTensorDesc\0")?,
            tensor_get_buffer: load_symbol(&lib, b"HiAI_SingleOpTensor_GetBuffer\0")?,
            tensor_destroy: load_symbol(&lib, b"HiAI_SingleOpTensor_Destroy\0")?,
            options_create: load_symbol(&lib, b"HiAI_SingleOpOptions_Create\0")?,
            options_destroy: load_symbol(&lib, b"HiAI_SingleOpOptions_Destroy\0")?,
            descriptor_create_convolution: load_symbol(
                &lib,
                b"HiAI_SingleOpDescriptor_CreateConvolution\0",
            )?,
            descriptor_create_activation: load_symbol(
                &lib,
                b"HiAI_SingleOpDescriptor_CreateActivation\0",
            )?,
            descriptor_destroy: load_symbol(&lib, b"HiAI_SingleOpDescriptor_Destroy\0")?,
            executor_pre_check_convolution: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_PreCheckConvolution\0",
            )?,
            executor_create_convolution: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_CreateConvolution\0",
            )?,
            executor_pre_check_fused: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_PreCheckFusedConvolutionActivation\0",
            )?,
            executor_create_fused: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_CreateFusedConvolutionActivation\0",
            )?,
            executor_destroy: load_symbol(&lib, b"HiAI_SingleOpExecutor_Destroy\0")?,
            executor_update_output_tensor_desc: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_UpdateOutputTensorDesc\0",
            )?,
            executor_get_workspace_size: load_symbol(
                &lib,
                b"HiAI_SingleOpExecutor_GetWorkspaceSize\0",
            )?,
            executor_init: load_symbol(&lib, b"HiAI_SingleOpExecutor_Init\0")?,
            executor_execute: load_symbol(&lib, b"HiAI_SingleOpExecutor_Execute\0")?,
        };
        log::info!("loaded single-op driver from {}", path.display());
        Ok(DylibDriver {
            _lib: lib,
            path,
            fns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: symbol types mirror the single-op C API.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|_| {
        let name = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        AccelError::MissingSymbol(name.into_owned())
    })?;
    Ok(*symbol)
}

fn raw(addr: usize) -> Raw {
    addr as Raw
}

fn opt_raw(addr: Option<usize>) -> Raw {
    addr.map(raw).unwrap_or(ptr::null_mut())
}

// Every call below goes through a pointer resolved by `from_library` from
// `_lib`, which lives as long as `self`. Handles passed in were returned by
// this driver and are still live: the RAII wrappers in `resource` destroy each
// one exactly once and never use it afterwards.
impl SopDriver for DylibDriver {
    fn tensor_desc_create(
        &self,
        dims: &[i64],
        data_type: DataType,
        format: Format,
        is_virtual: bool,
    ) -> Option<TensorDescHandle> {
        // SAFETY: `dims` is valid for `dims.len()` reads for the duration of the call.
        let handle = unsafe {
            (self.fns.tensor_desc_create)(
                dims.as_ptr(),
                dims.len(),
                data_type.to_raw(),
                format.to_raw(),
                is_virtual,
            )
        };
        TensorDescHandle::from_raw(handle as usize)
    }

    fn tensor_desc_dims(&self, desc: TensorDescHandle) -> Vec<i64> {
        // SAFETY: `desc` is a live descriptor handle.
        unsafe {
            let count = (self.fns.tensor_desc_get_dimension_count)(raw(desc.addr()));
            (0..count)
                .map(|i| (self.fns.tensor_desc_get_dimension)(raw(desc.addr()), i))
                .collect()
        }
    }

    fn tensor_desc_data_type(&self, desc: TensorDescHandle) -> DataType {
        // SAFETY: `desc` is a live descriptor handle; the call only reads it.
        let code = unsafe { (self.fns.tensor_desc_get_data_type)(raw(desc.addr())) };
        DataType::from_raw(code)
    }

    fn tensor_desc_format(&self, desc: TensorDescHandle) -> Format {
        // SAFETY: `desc` is a live descriptor handle; the call only reads it.
        let code = unsafe { (self.fns.tensor_desc_get_format)(raw(desc.addr())) };
        Format::from_raw(code)
    }

    fn tensor_desc_is_virtual(&self, desc: TensorDescHandle) -> bool {
        // SAFETY: `desc` is a live descriptor handle; the call only reads it.
        unsafe { (self.fns.tensor_desc_is_virtual)(raw(desc.addr())) }
    }

    fn tensor_desc_byte_size(&self, desc: TensorDescHandle) -> usize {
        // SAFETY: `desc` is a live descriptor handle; the call only reads it.
        unsafe { (self.fns.tensor_desc_get_byte_size)(raw(desc.addr())) }
    }

    fn tensor_desc_destroy(&self, desc: TensorDescHandle) {
        let mut handle = raw(desc.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.tensor_desc_destroy)(&mut handle) };
    }

    fn buffer_create(&self, size: usize) -> Option<BufferHandle> {
        // SAFETY: takes no pointers; a null result is mapped to `None`.
        let handle = unsafe { (self.fns.buffer_create)(size) };
        BufferHandle::from_raw(handle as usize)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> usize {
        // SAFETY: `buffer` is a live buffer handle.
        unsafe { (self.fns.buffer_get_size)(raw(buffer.addr())) }
    }

    fn buffer_data(&self, buffer: BufferHandle) -> *mut c_void {
        // SAFETY: `buffer` is a live buffer handle; the returned pointer is only
        // dereferenced while the owning buffer is alive.
        unsafe { (self.fns.buffer_get_data)(raw(buffer.addr())) }
    }

    fn buffer_destroy(&self, buffer: BufferHandle) -> Status {
        let mut handle = raw(buffer.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.buffer_destroy)(&mut handle) }
    }

    fn tensor_create_from_desc(&self, desc: TensorDescHandle) -> Option<TensorHandle> {
        // SAFETY: `desc` is a live descriptor handle; the driver does not take ownership.
        let handle = unsafe { (self.fns.tensor_create_from_tensor_desc)(raw(desc.addr())) };
        TensorHandle::from_raw(handle as usize)
    }

    fn tensor_create_from_const(
        &self,
        desc: TensorDescHandle,
        data: &[u8],
    ) -> Option<TensorHandle> {
        // SAFETY: the driver copies `data` and does not write through the pointer.
        let handle = unsafe {
            (self.fns.tensor_create_from_const)(
                raw(desc.addr()),
                data.as_ptr() as *mut c_void,
                data.len(),
            )
        };
        TensorHandle::from_raw(handle as usize)
    }

    fn tensor_desc_of(&self, tensor: TensorHandle) -> Option<TensorDescHandle> {
        // SAFETY: `tensor` is a live tensor handle; the returned descriptor is
        // borrowed from it and never destroyed here.
        let handle = unsafe { (self.fns.tensor_get_tensor_desc)(raw(tensor.addr())) };
        TensorDescHandle::from_raw(handle as usize)
    }

    fn tensor_buffer(&self, tensor: TensorHandle) -> Option<BufferHandle> {
        // SAFETY: `tensor` is a live tensor handle; the returned buffer is
        // borrowed from it and never destroyed here.
        let handle = unsafe { (self.fns.tensor_get_buffer)(raw(tensor.addr())) };
        BufferHandle::from_raw(handle as usize)
    }

    fn tensor_destroy(&self, tensor: TensorHandle) -> Status {
        let mut handle = raw(tensor.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.tensor_destroy)(&mut handle) }
    }

    fn options_create(&self) -> Option<OptionsHandle> {
        // SAFETY: takes no arguments; a null result is mapped to `None`.
        let handle = unsafe { (self.fns.options_create)() };
        OptionsHandle::from_raw(handle as usize)
    }

    fn options_destroy(&self, options: OptionsHandle) {
        let mut handle = raw(options.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.options_destroy)(&mut handle) };
    }

    fn conv_descriptor_create(&self, conv: &ConvDescriptor) -> Option<OpDescHandle> {
        // SAFETY: stride/dilation/pad arrays outlive the call and have the lengths the API expects.
        let handle = unsafe {
            (self.fns.descriptor_create_convolution)(
                conv.mode.to_raw(),
                conv.strides.as_ptr(),
                conv.dilations.as_ptr(),
                conv.pads.as_ptr(),
                conv.groups,
                conv.pad_mode.to_raw(),
            )
        };
        OpDescHandle::from_raw(handle as usize)
    }

    fn activation_descriptor_create(
        &self,
        activation: ActivationType,
        coef: f32,
    ) -> Option<OpDescHandle> {
        // SAFETY: plain value arguments; a null result is mapped to `None`.
        let handle =
            unsafe { (self.fns.descriptor_create_activation)(activation.to_raw(), coef) };
        OpDescHandle::from_raw(handle as usize)
    }

    fn op_descriptor_destroy(&self, desc: OpDescHandle) {
        let mut handle = raw(desc.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.descriptor_destroy)(&mut handle) };
    }

    fn precheck_convolution(&self, request: &ConvRequest) -> SupportStatus {
        // SAFETY: every handle in `request` is live for the call; a missing bias is passed as null.
        let status = unsafe {
            (self.fns.executor_pre_check_convolution)(
                raw(request.options.addr()),
                raw(request.conv.addr()),
                raw(request.input.addr()),
                raw(request.output.addr()),
                raw(request.filter.addr()),
                opt_raw(request.bias.map(TensorHandle::addr)),
            )
        };
        SupportStatus::from_raw(status)
    }

    fn precheck_fused_convolution_activation(
        &self,
        request: &ConvRequest,
        activation: OpDescHandle,
    ) -> SupportStatus {
        // SAFETY: every handle in `request` and `activation` is live for the call.
        let status = unsafe {
            (self.fns.executor_pre_check_fused)(
                raw(request.options.addr()),
                raw(request.conv.addr()),
                raw(activation.addr()),
                raw(request.input.addr()),
                raw(request.output.addr()),
                raw(request.filter.addr()),
                opt_raw(request.bias.map(TensorHandle::addr)),
            )
        };
        SupportStatus::from_raw(status)
    }

    fn executor_create_convolution(&self, request: &ConvRequest) -> Option<ExecutorHandle> {
        // SAFETY: every handle in `request` is live for the call; the executor
        // keeps no reference to the options or descriptors after it returns.
        let handle = unsafe {
            (self.fns.executor_create_convolution)(
                raw(request.options.addr()),
                raw(request.conv.addr()),
                raw(request.input.addr()),
                raw(request.output.addr()),
                raw(request.filter.addr()),
                opt_raw(request.bias.map(TensorHandle::addr)),
            )
        };
        ExecutorHandle::from_raw(handle as usize)
    }

    fn executor_create_fused_convolution_activation(
        &self,
        request: &ConvRequest,
        activation: OpDescHandle,
    ) -> Option<ExecutorHandle> {
        // SAFETY: as for `executor_create_convolution`, with `activation` also live.
        let handle = unsafe {
            (self.fns.executor_create_fused)(
                raw(request.options.addr()),
                raw(request.conv.addr()),
                raw(activation.addr()),
                raw(request.input.addr()),
                raw(request.output.addr()),
                raw(request.filter.addr()),
                opt_raw(request.bias.map(TensorHandle::addr)),
            )
        };
        ExecutorHandle::from_raw(handle as usize)
    }

    fn executor_destroy(&self, executor: ExecutorHandle) -> Status {
        let mut handle = raw(executor.addr());
        // SAFETY: handle is owned by the caller and destroyed once.
        unsafe { (self.fns.executor_destroy)(&mut handle) }
    }

    fn executor_update_output_desc(
        &self,
        executor: ExecutorHandle,
        index: u32,
        desc: TensorDescHandle,
    ) -> Status {
        // SAFETY: `executor` and `desc` are live handles.
        unsafe {
            (self.fns.executor_update_output_tensor_desc)(
                raw(executor.addr()),
                index,
                raw(desc.addr()),
            )
        }
    }

    fn executor_workspace_size(&self, executor: ExecutorHandle) -> usize {
        // SAFETY: `executor` is a live executor handle.
        unsafe { (self.fns.executor_get_workspace_size)(raw(executor.addr())) }
    }

    fn executor_init(
        &self,
        executor: ExecutorHandle,
        workspace: *mut c_void,
        size: usize,
    ) -> Status {
        // SAFETY: `workspace` is either null with size 0 or a live driver buffer of at least `size` bytes.
        unsafe { (self.fns.executor_init)(raw(executor.addr()), workspace, size) }
    }

    fn executor_execute(
        &self,
        executor: ExecutorHandle,
        inputs: &[TensorHandle],
        outputs: &[TensorHandle],
    ) -> Status {
        let mut ins: Vec<Raw> = inputs.iter().map(|t| raw(t.addr())).collect();
        let mut outs: Vec<Raw> = outputs.iter().map(|t| raw(t.addr())).collect();
        // SAFETY: handle arrays are valid for the lengths passed and live across the blocking call.
        unsafe {
            (self.fns.executor_execute)(
                raw(executor.addr()),
                ins.as_mut_ptr(),
                ins.len() as i32,
                outs.as_mut_ptr(),
                outs.len() as i32,
            )
        }
    }
}
