//! In-process stand-in for the single-op driver used by unit tests.
//!
//! Buffers are real host allocations so copies and pointer binding can be
//! observed. Every create/destroy pair is tracked so tests can assert that
//! nothing leaks, and individual entry points can be told to fail.

use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use super::types::*;
use super::SopDriver;

#[derive(Debug, Clone)]
struct DescEntry {
    dims: Vec<i64>,
    data_type: DataType,
    format: Format,
    is_virtual: bool,
    /// Owned by a tensor rather than by the caller.
    tensor_owned: bool,
}

impl DescEntry {
    fn byte_size(&self) -> usize {
        let numel: i64 = self.dims.iter().product();
        numel.max(0) as usize * self.data_type.size_in_bytes()
    }
}

#[derive(Debug)]
struct TensorEntry {
    desc: usize,
    buffer: usize,
}

#[derive(Debug)]
struct ExecEntry {
    workspace: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitCall {
    pub executor: ExecutorHandle,
    pub workspace: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteCall {
    pub executor: ExecutorHandle,
    pub inputs: Vec<TensorHandle>,
    pub outputs: Vec<TensorHandle>,
}

#[derive(Debug, Default)]
struct State {
    next: usize,
    descs: HashMap<usize, DescEntry>,
    buffers: HashMap<usize, Box<[u8]>>,
    tensors: HashMap<usize, TensorEntry>,
    executors: HashMap<usize, ExecEntry>,
    options: HashMap<usize, ()>,
    op_descs: HashMap<usize, ()>,

    precheck: Option<SupportStatus>,
    workspace_sizes: VecDeque<usize>,
    fail_tensor_create: usize,
    fail_executor_create: bool,
    fail_init: bool,
    fail_execute: bool,

    tensor_creates: usize,
    conv_descriptors: Vec<ConvDescriptor>,
    activations: Vec<ActivationType>,
    fused_executors: usize,
    const_payloads: Vec<Vec<u8>>,
    inits: Vec<InitCall>,
    executes: Vec<ExecuteCall>,
}

impl State {
    fn alloc_id(&mut self) -> usize {
        // Start well above zero; zero is the null handle.
        self.next += 0x10;
        0x1000 + self.next
    }

    fn new_buffer(&mut self, size: usize) -> usize {
        let id = self.alloc_id();
        self.buffers.insert(id, vec![0u8; size].into_boxed_slice());
        id
    }

    fn new_tensor(&mut self, desc: &DescEntry) -> usize {
        let mut owned = desc.clone();
        owned.tensor_owned = true;
        let size = owned.byte_size();
        let desc_id = self.alloc_id();
        self.descs.insert(desc_id, owned);
        let buffer = self.new_buffer(size);
        let id = self.alloc_id();
        self.tensors.insert(id, TensorEntry { desc: desc_id, buffer });
        self.tensor_creates += 1;
        id
    }
}

#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<State>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every precheck with `status` (default: optimized).
    pub fn set_precheck(&self, status: SupportStatus) {
        self.state().precheck = Some(status);
    }

    /// Workspace requirement handed to the next created executor.
    pub fn push_workspace_size(&self, size: usize) {
        self.state().workspace_sizes.push_back(size);
    }

    /// Fail the next `n` tensor creations.
    pub fn fail_next_tensor_creates(&self, n: usize) {
        self.state().fail_tensor_create = n;
    }

    pub fn set_fail_executor_create(&self, fail: bool) {
        self.state().fail_executor_create = fail;
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.state().fail_init = fail;
    }

    pub fn set_fail_execute(&self, fail: bool) {
        self.state().fail_execute = fail;
    }

    pub fn live_tensors(&self) -> usize {
        self.state().tensors.len()
    }

    /// Caller-owned descriptors still alive.
    pub fn live_descs(&self) -> usize {
        self.state().descs.values().filter(|d| !d.tensor_owned).count()
    }

    pub fn live_executors(&self) -> usize {
        self.state().executors.len()
    }

    pub fn live_op_descs(&self) -> usize {
        let state = self.state();
        state.op_descs.len() + state.options.len()
    }

    /// Buffers not owned by any tensor (workspaces).
    pub fn live_standalone_buffers(&self) -> usize {
        let state = self.state();
        let owned: Vec<usize> = state.tensors.values().map(|t| t.buffer).collect();
        state
            .buffers
            .keys()
            .filter(|id| !owned.contains(id))
            .count()
    }

    pub fn tensor_creates(&self) -> usize {
        self.state().tensor_creates
    }

    pub fn conv_descriptors(&self) -> Vec<ConvDescriptor> {
        self.state().conv_descriptors.clone()
    }

    pub fn activations(&self) -> Vec<ActivationType> {
        self.state().activations.clone()
    }

    pub fn fused_executors(&self) -> usize {
        self.state().fused_executors
    }

    pub fn const_payloads(&self) -> Vec<Vec<u8>> {
        self.state().const_payloads.clone()
    }

    pub fn init_calls(&self) -> Vec<InitCall> {
        self.state().inits.clone()
    }

    pub fn execute_calls(&self) -> Vec<ExecuteCall> {
        self.state().executes.clone()
    }

    fn create_executor(&self, request: &ConvRequest) -> Option<ExecutorHandle> {
        let mut state = self.state();
        if state.fail_executor_create {
            return None;
        }
        if !state.descs.contains_key(&request.input.addr())
            || !state.descs.contains_key(&request.output.addr())
        {
            return None;
        }
        let workspace = state.workspace_sizes.pop_front().unwrap_or(0);
        let id = state.alloc_id();
        state.executors.insert(id, ExecEntry { workspace });
        ExecutorHandle::from_raw(id)
    }

    fn precheck(&self) -> SupportStatus {
        self.state().precheck.unwrap_or(SupportStatus::Optimized)
    }
}

impl SopDriver for MockDriver {
    fn tensor_desc_create(
        &self,
        dims: &[i64],
        data_type: DataType,
        format: Format,
        is_virtual: bool,
    ) -> Option<TensorDescHandle> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.descs.insert(
            id,
            DescEntry {
                dims: dims.to_vec(),
                data_type,
                format,
                is_virtual,
                tensor_owned: false,
            },
        );
        TensorDescHandle::from_raw(id)
    }

    fn tensor_desc_dims(&self, desc: TensorDescHandle) -> Vec<i64> {
        self.state()
            .descs
            .get(&desc.addr())
            .map(|d| d.dims.clone())
            .unwrap_or_default()
    }

    fn tensor_desc_data_type(&self, desc: TensorDescHandle) -> DataType {
        self.state()
            .descs
            .get(&desc.addr())
            .map(|d| d.data_type)
            .unwrap_or(DataType::Undefined)
    }

    fn tensor_desc_format(&self, desc: TensorDescHandle) -> Format {
        self.state()
            .descs
            .get(&desc.addr())
            .map(|d| d.format)
            .unwrap_or(Format::Reserved)
    }

    fn tensor_desc_is_virtual(&self, desc: TensorDescHandle) -> bool {
        self.state()
            .descs
            .get(&desc.addr())
            .map(|d| d.is_virtual)
            .unwrap_or(false)
    }

    fn tensor_desc_byte_size(&self, desc: TensorDescHandle) -> usize {
        self.state()
            .descs
            .get(&desc.addr())
            .map(DescEntry::byte_size)
            .unwrap_or(0)
    }

    fn tensor_desc_destroy(&self, desc: TensorDescHandle) {
        let mut state = self.state();
        let owned = state.descs.get(&desc.addr()).map(|d| d.tensor_owned);
        assert_eq!(owned, Some(false), "destroying unknown or tensor-owned descriptor");
        state.descs.remove(&desc.addr());
    }

    fn buffer_create(&self, size: usize) -> Option<BufferHandle> {
        let mut state = self.state();
        BufferHandle::from_raw(state.new_buffer(size))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> usize {
        self.state()
            .buffers
            .get(&buffer.addr())
            .map(|b| b.len())
            .unwrap_or(0)
    }

    fn buffer_data(&self, buffer: BufferHandle) -> *mut c_void {
        let mut state = self.state();
        match state.buffers.get_mut(&buffer.addr()) {
            Some(b) if !b.is_empty() => b.as_mut_ptr() as *mut c_void,
            _ => ptr::null_mut(),
        }
    }

    fn buffer_destroy(&self, buffer: BufferHandle) -> Status {
        match self.state().buffers.remove(&buffer.addr()) {
            Some(_) => STATUS_SUCCESS,
            None => 1,
        }
    }

    fn tensor_create_from_desc(&self, desc: TensorDescHandle) -> Option<TensorHandle> {
        let mut state = self.state();
        if state.fail_tensor_create > 0 {
            state.fail_tensor_create -= 1;
            return None;
        }
        let entry = state.descs.get(&desc.addr())?.clone();
        let id = state.new_tensor(&entry);
        TensorHandle::from_raw(id)
    }

    fn tensor_create_from_const(
        &self,
        desc: TensorDescHandle,
        data: &[u8],
    ) -> Option<TensorHandle> {
        let mut state = self.state();
        let entry = state.descs.get(&desc.addr())?.clone();
        let id = state.new_tensor(&entry);
        let buffer = state.tensors[&id].buffer;
        if let Some(dst) = state.buffers.get_mut(&buffer) {
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
        }
        state.const_payloads.push(data.to_vec());
        TensorHandle::from_raw(id)
    }

    fn tensor_desc_of(&self, tensor: TensorHandle) -> Option<TensorDescHandle> {
        self.state()
            .tensors
            .get(&tensor.addr())
            .and_then(|t| TensorDescHandle::from_raw(t.desc))
    }

    fn tensor_buffer(&self, tensor: TensorHandle) -> Option<BufferHandle> {
        self.state()
            .tensors
            .get(&tensor.addr())
            .and_then(|t| BufferHandle::from_raw(t.buffer))
    }

    fn tensor_destroy(&self, tensor: TensorHandle) -> Status {
        let mut state = self.state();
        match state.tensors.remove(&tensor.addr()) {
            Some(entry) => {
                state.descs.remove(&entry.desc);
                state.buffers.remove(&entry.buffer);
                STATUS_SUCCESS
            }
            None => 1,
        }
    }

    fn options_create(&self) -> Option<OptionsHandle> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.options.insert(id, ());
        OptionsHandle::from_raw(id)
    }

    fn options_destroy(&self, options: OptionsHandle) {
        self.state().options.remove(&options.addr());
    }

    fn conv_descriptor_create(&self, conv: &ConvDescriptor) -> Option<OpDescHandle> {
        let mut state = self.state();
        state.conv_descriptors.push(conv.clone());
        let id = state.alloc_id();
        state.op_descs.insert(id, ());
        OpDescHandle::from_raw(id)
    }

    fn activation_descriptor_create(
        &self,
        activation: ActivationType,
        _coef: f32,
    ) -> Option<OpDescHandle> {
        let mut state = self.state();
        state.activations.push(activation);
        let id = state.alloc_id();
        state.op_descs.insert(id, ());
        OpDescHandle::from_raw(id)
    }

    fn op_descriptor_destroy(&self, desc: OpDescHandle) {
        self.state().op_descs.remove(&desc.addr());
    }

    fn precheck_convolution(&self, _request: &ConvRequest) -> SupportStatus {
        self.precheck()
    }

    fn precheck_fused_convolution_activation(
        &self,
        _request: &ConvRequest,
        _activation: OpDescHandle,
    ) -> SupportStatus {
        self.precheck()
    }

    fn executor_create_convolution(&self, request: &ConvRequest) -> Option<ExecutorHandle> {
        self.create_executor(request)
    }

    fn executor_create_fused_convolution_activation(
        &self,
        request: &ConvRequest,
        _activation: OpDescHandle,
    ) -> Option<ExecutorHandle> {
        let handle = self.create_executor(request);
        if handle.is_some() {
            self.state().fused_executors += 1;
        }
        handle
    }

    fn executor_destroy(&self, executor: ExecutorHandle) -> Status {
        match self.state().executors.remove(&executor.addr()) {
            Some(_) => STATUS_SUCCESS,
            None => 1,
        }
    }

    fn executor_update_output_desc(
        &self,
        executor: ExecutorHandle,
        _index: u32,
        desc: TensorDescHandle,
    ) -> Status {
        let mut state = self.state();
        if !state.executors.contains_key(&executor.addr()) {
            return 1;
        }
        match state.descs.get_mut(&desc.addr()) {
            Some(entry) => {
                entry.data_type = DataType::Float;
                entry.format = Format::Nchw;
                entry.is_virtual = false;
                STATUS_SUCCESS
            }
            None => 1,
        }
    }

    fn executor_workspace_size(&self, executor: ExecutorHandle) -> usize {
        self.state()
            .executors
            .get(&executor.addr())
            .map(|e| e.workspace)
            .unwrap_or(0)
    }

    fn executor_init(
        &self,
        executor: ExecutorHandle,
        workspace: *mut c_void,
        size: usize,
    ) -> Status {
        let mut state = self.state();
        state.inits.push(InitCall {
            executor,
            workspace: workspace as usize,
            size,
        });
        if state.fail_init {
            1
        } else {
            STATUS_SUCCESS
        }
    }

    fn executor_execute(
        &self,
        executor: ExecutorHandle,
        inputs: &[TensorHandle],
        outputs: &[TensorHandle],
    ) -> Status {
        let mut state = self.state();
        state.executes.push(ExecuteCall {
            executor,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        if state.fail_execute {
            1
        } else {
            STATUS_SUCCESS
        }
    }
}
