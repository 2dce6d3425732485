//! Contract between the coordinator and accelerated operator adapters.

use std::ffi::c_void;
use std::fmt::Debug;

use ir_tensor::Tensor;

use crate::error::{AccelError, Result};
use crate::foreign::{Driver, Executor, SupportStatus, TensorDescHandle, TensorHandle};
use crate::memory::{MemObject, TensorManager};

/// What an adapter may touch while resizing.
pub struct SopContext<'a> {
    driver: &'a Driver,
    tensors: &'a mut TensorManager,
    workspace_size: &'a mut usize,
}

impl<'a> SopContext<'a> {
    pub(crate) fn new(
        driver: &'a Driver,
        tensors: &'a mut TensorManager,
        workspace_size: &'a mut usize,
    ) -> Self {
        SopContext {
            driver,
            tensors,
            workspace_size,
        }
    }

    pub fn driver(&self) -> &Driver {
        self.driver
    }

    pub fn tensor_desc(&self, tensor: &Tensor) -> Result<TensorDescHandle> {
        self.tensors.tensor_desc(tensor.id())
    }

    pub fn foreign_tensor(&self, tensor: &Tensor) -> Result<TensorHandle> {
        self.tensors.foreign_tensor(tensor.id())
    }

    /// Record a workspace requirement; the shared buffer covers the largest.
    pub fn update_workspace_size(&mut self, size: usize) {
        *self.workspace_size = (*self.workspace_size).max(size);
    }

    /// Recreate `tensor`'s driver tensor after its descriptor was resolved.
    pub fn reallocate(&mut self, tensor: &mut Tensor) -> Result<&MemObject> {
        self.tensors.reallocate(tensor)
    }
}

/// Holds the current executor of an adapter.
#[derive(Debug, Default)]
pub struct ExecutorSlot {
    current: Option<Executor>,
}

impl ExecutorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroy the current executor, then install the one built by `create`.
    /// The slot stays empty when `create` fails.
    pub fn replace_with<F>(&mut self, create: F) -> Result<&Executor>
    where
        F: FnOnce() -> Result<Executor>,
    {
        self.clear();
        Ok(self.current.insert(create()?))
    }

    pub fn get(&self) -> Option<&Executor> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

/// An operator accepted onto the accelerator.
///
/// Lifecycle per resize pass: [`precheck`](Self::precheck) once at planning,
/// [`resize`](Self::resize), [`init`](Self::init) with the shared workspace,
/// then any number of [`execute`](Self::execute) calls.
pub trait SopExecution: Send + Debug {
    fn name(&self) -> &str;

    /// Ask the driver whether this configuration runs well on the accelerator.
    /// Must not leave any persistent driver object behind.
    fn precheck(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> SupportStatus;

    /// Build a fresh executor for the current shapes.
    ///
    /// # Errors
    /// Any failure is fatal for the pass.
    fn resize(
        &mut self,
        ctx: &mut SopContext<'_>,
        inputs: &[&Tensor],
        outputs: &mut [&mut Tensor],
    ) -> Result<()>;

    fn executor(&self) -> Option<&Executor>;

    fn workspace_size(&self) -> usize {
        self.executor().map(Executor::workspace_size).unwrap_or(0)
    }

    /// Bind the shared workspace to the executor.
    fn init(&mut self, workspace: *mut c_void) -> Result<()> {
        let size = self.workspace_size();
        match self.executor() {
            Some(exec) => exec.init(workspace, size),
            None => Err(AccelError::ExecutorMissing(self.name().to_string())),
        }
    }

    fn execute(&mut self, tensors: &TensorManager, inputs: &[&Tensor], outputs: &[&Tensor])
        -> Result<()>;
}
