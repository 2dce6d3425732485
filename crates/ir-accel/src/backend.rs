//! The accelerator backend: routes operators and tensors between the
//! single-op accelerator and a generic host backend, and drives the
//! resize / init / execute lifecycle of the accepted operators.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use ir_tensor::{ComputeBackend, Execution, Op, Tensor, TensorId};

use crate::classify::{StorageClass, UseCountTable};
use crate::config::SopConfig;
use crate::error::{AccelError, Result};
use crate::execution::{SopContext, SopExecution};
use crate::foreign::{Driver, DylibDriver, ForeignBuffer, SupportStatus};
use crate::memory::{aligned_size, TensorManager};
use crate::registry::AdapterRegistry;

/// Lifecycle state of one resize pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Operators are created, tensors acquired and accepted operators resized.
    Planning,
    /// The shared workspace is being sized and allocated.
    Sizing,
    /// Every accepted operator has been bound to the workspace; nothing has
    /// run yet.
    Initialized,
    /// At least one accepted operator has run in this pass.
    Executable,
}

/// Index of an accepted operator; also its position in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecId(usize);

impl ExecId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Result of planning one operator.
#[derive(Debug)]
pub enum CreatedOp {
    /// Runs on the accelerator; drive it through [`SopBackend::resize`] and
    /// [`SopBackend::execute`].
    Accelerated(ExecId),
    /// Declined by every adapter; built by the host backend.
    Host(Box<dyn Execution>),
}

impl CreatedOp {
    pub fn is_accelerated(&self) -> bool {
        matches!(self, CreatedOp::Accelerated(_))
    }
}

struct Accelerator {
    driver: Driver,
    tensors: TensorManager,
    workspace: Option<ForeignBuffer>,
}

/// Accelerator backend layered over a generic host backend `B`.
///
/// A resize pass runs as:
/// [`on_resize_begin`](Self::on_resize_begin), then
/// [`on_create`](Self::on_create) for every operator,
/// [`on_acquire`](Self::on_acquire) / [`on_release`](Self::on_release) for the
/// tensors, [`resize`](Self::resize) for every accepted operator, and finally
/// [`on_resize_end`](Self::on_resize_end). After that accepted operators run
/// through [`execute`](Self::execute) in acceptance order.
pub struct SopBackend<B: ComputeBackend> {
    // Executions are declared before the accelerator so they drop before the
    // workspace they were initialised with.
    executions: Vec<Box<dyn SopExecution>>,
    accel: Option<Accelerator>,
    host: B,
    registry: AdapterRegistry,
    config: SopConfig,
    phase: Phase,
    use_counts: UseCountTable,
    workspace_size: usize,
    // First operator whose resize failed in this pass.
    failed: Option<String>,
}

impl<B: ComputeBackend> SopBackend<B> {
    /// Wrap `host`, accelerating through `driver` when one is given and the
    /// configuration enables it.
    pub fn new(host: B, driver: Option<Driver>, registry: AdapterRegistry, config: SopConfig) -> Self {
        let accel = match driver {
            Some(driver) if config.enabled => Some(Accelerator {
                tensors: TensorManager::new(Arc::clone(&driver)),
                driver,
                workspace: None,
            }),
            Some(_) => {
                log::info!("accelerator disabled by configuration");
                None
            }
            None => None,
        };
        SopBackend {
            executions: Vec::new(),
            accel,
            host,
            registry,
            config,
            phase: Phase::Planning,
            use_counts: UseCountTable::new(),
            workspace_size: 0,
            failed: None,
        }
    }

    /// Load the driver from the configured library paths.
    ///
    /// A missing or incomplete driver is not an error: the backend then
    /// declines every operator and behaves like `host`.
    pub fn from_config(host: B, registry: AdapterRegistry, config: SopConfig) -> Self {
        let driver = if config.enabled {
            match DylibDriver::load(config.library_paths.as_slice()) {
                Ok(driver) => Some(Arc::new(driver) as Driver),
                Err(e) => {
                    log::warn!("single-op accelerator unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::new(host, driver, registry, config)
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(AccelError::InvalidPhase {
                expected,
                actual: self.phase,
            })
        }
    }

    /// Start a new resize pass.
    ///
    /// Drops every accepted operator, the shared workspace and every memory
    /// object; tensors still bound to accelerator memory see their views go
    /// stale.
    pub fn on_resize_begin(&mut self) {
        self.executions.clear();
        if let Some(accel) = self.accel.as_mut() {
            accel.workspace = None;
            accel.tensors = TensorManager::new(Arc::clone(&accel.driver));
        }
        self.use_counts.clear();
        self.workspace_size = 0;
        self.failed = None;
        self.phase = Phase::Planning;
        self.host.on_resize_begin();
    }

    /// Plan one operator.
    ///
    /// Registered adapters are tried in priority order; the first one that
    /// constructs and reports [`SupportStatus::Optimized`] wins. Otherwise the
    /// host backend builds the operator.
    ///
    /// # Errors
    /// Fails outside [`Phase::Planning`], or when the host backend cannot build
    /// an operator no adapter accepted.
    pub fn on_create(&mut self, op: &Op, inputs: &[&Tensor], outputs: &[&Tensor]) -> Result<CreatedOp> {
        self.expect_phase(Phase::Planning)?;
        if let Some(accel) = &self.accel {
            for factory in self.registry.factories_for(op.op_type) {
                let Some(exec) = factory.create(&accel.driver, op, inputs, outputs) else {
                    continue;
                };
                match exec.precheck(inputs, outputs) {
                    SupportStatus::Optimized => {
                        self.use_counts.record(
                            inputs.iter().map(|t| t.id()),
                            outputs.iter().map(|t| t.id()),
                        );
                        let id = ExecId(self.executions.len());
                        self.executions.push(exec);
                        log::debug!("[{}] accepted by {} as #{}", op.name, factory.name(), id.0);
                        return Ok(CreatedOp::Accelerated(id));
                    }
                    status => {
                        log::info!("op [{}] is not optimized by the accelerator ({:?})", op.name, status);
                    }
                }
            }
        }
        Ok(CreatedOp::Host(self.host.on_create(op, inputs, outputs)?))
    }

    /// Storage class of `id` under the current plan.
    pub fn storage_class(&self, id: TensorId) -> StorageClass {
        self.use_counts.classify(id)
    }

    /// Attach storage to `tensor` in the domain its storage class calls for.
    ///
    /// An existing memory object is reused when it already covers the
    /// tensor's aligned size; an undersized one is released and a fresh one
    /// allocated, retrying once if the driver's allocator fails.
    pub fn on_acquire(&mut self, tensor: &mut Tensor) -> Result<()> {
        self.expect_phase(Phase::Planning)?;
        let class = self.use_counts.classify(tensor.id());
        if !class.is_accelerated() {
            return Ok(self.host.on_acquire(tensor)?);
        }
        let needed = aligned_size(self.host.tensor_size(tensor), self.config.alignment);
        let accel = self.accel.as_mut().ok_or(AccelError::NoAccelerator)?;

        let mut released = false;
        if let Some(obj) = accel.tensors.get(tensor.id()) {
            if obj.size() >= needed {
                if obj.addr() != 0 && !tensor.is_allocated() {
                    tensor.bind_device(obj.view());
                }
                return Ok(());
            }
            log::warn!(
                "memory object of {} too small: [{}] < [{}]",
                tensor.id(),
                obj.size(),
                needed
            );
            accel.tensors.release(tensor)?;
            released = true;
        }

        let exclusive = class == StorageClass::AcceleratorOnly;
        let first = accel.tensors.allocate(tensor, exclusive).map(|_| ());
        match first {
            Err(e) if released && e.is_retryable() => {
                log::warn!("reallocating {} failed ({}), retrying once", tensor.id(), e);
                accel.tensors.allocate(tensor, exclusive).map(|_| ())
            }
            other => other,
        }
    }

    /// Detach the storage attached by [`on_acquire`](Self::on_acquire).
    ///
    /// # Errors
    /// Fails when the tensor holds no storage from the domain it is classified
    /// into; nothing else is touched.
    pub fn on_release(&mut self, tensor: &mut Tensor) -> Result<()> {
        if !self.use_counts.classify(tensor.id()).is_accelerated() {
            return Ok(self.host.on_release(tensor)?);
        }
        let accel = self.accel.as_mut().ok_or(AccelError::NoAccelerator)?;
        accel.tensors.release(tensor)
    }

    /// Run the resize step of an accepted operator.
    ///
    /// # Errors
    /// Any failure is fatal for the pass: it is returned here and
    /// [`on_resize_end`](Self::on_resize_end) then refuses to size and
    /// initialise.
    pub fn resize(&mut self, id: ExecId, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        self.expect_phase(Phase::Planning)?;
        let accel = self.accel.as_mut().ok_or(AccelError::NoAccelerator)?;
        let exec = self
            .executions
            .get_mut(id.0)
            .ok_or(AccelError::UnknownExecution(id.0))?;
        let mut ctx = SopContext::new(&accel.driver, &mut accel.tensors, &mut self.workspace_size);
        let result = exec.resize(&mut ctx, inputs, outputs);
        if let Err(e) = &result {
            log::error!("resize op {} failed: {}", exec.name(), e);
            self.failed.get_or_insert_with(|| exec.name().to_string());
        }
        result
    }

    /// Size and allocate the shared workspace, then initialise every accepted
    /// operator with it.
    ///
    /// # Errors
    /// A failed resize earlier in the pass, or a failed initialisation, aborts
    /// the pass; the backend stays in [`Phase::Sizing`] until the next
    /// [`on_resize_begin`](Self::on_resize_begin).
    pub fn on_resize_end(&mut self) -> Result<()> {
        self.expect_phase(Phase::Planning)?;
        if let Some(op) = &self.failed {
            self.phase = Phase::Sizing;
            return Err(AccelError::ResizeFailed { op: op.clone() });
        }
        self.host.on_resize_end()?;
        self.phase = Phase::Sizing;

        let required = self
            .executions
            .iter()
            .map(|e| e.workspace_size())
            .fold(self.workspace_size, usize::max);
        self.workspace_size = required;

        if let Some(accel) = self.accel.as_mut() {
            accel.workspace = None;
            if required > 0 {
                accel.workspace = Some(ForeignBuffer::create(&accel.driver, required)?);
            }
            let workspace = accel
                .workspace
                .as_ref()
                .map(ForeignBuffer::data)
                .unwrap_or(ptr::null_mut());
            for exec in &mut self.executions {
                if let Err(e) = exec.init(workspace) {
                    log::error!("init op {} failed: {}", exec.name(), e);
                    return Err(AccelError::InitFailed {
                        op: exec.name().to_string(),
                        source: Box::new(e),
                    });
                }
            }
            log::debug!(
                "{} accelerated ops share a {} byte workspace",
                self.executions.len(),
                required
            );
        }
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Run an accepted operator.
    ///
    /// Allowed once the pass is [`Phase::Initialized`]; the first run moves
    /// the backend to [`Phase::Executable`].
    pub fn execute(&mut self, id: ExecId, inputs: &[&Tensor], outputs: &[&Tensor]) -> Result<()> {
        if self.phase != Phase::Initialized {
            self.expect_phase(Phase::Executable)?;
        }
        let accel = self.accel.as_ref().ok_or(AccelError::NoAccelerator)?;
        let exec = self
            .executions
            .get_mut(id.0)
            .ok_or(AccelError::UnknownExecution(id.0))?;
        self.phase = Phase::Executable;
        exec.execute(&accel.tensors, inputs, outputs)
    }

    /// Cross-domain copies belong to the host backend's copy path; accelerator
    /// memory is never copied here.
    pub fn on_copy_buffer(&mut self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        log::trace!("copy {} -> {} skipped", src.id(), dst.id());
        Ok(())
    }

    /// Drop every memory object and the host backend's cached buffers.
    pub fn on_clear_buffer(&mut self) {
        if let Some(accel) = self.accel.as_mut() {
            accel.tensors.release_all();
        }
        self.host.on_clear_buffer();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Shared workspace requirement of the current pass.
    pub fn workspace_size(&self) -> usize {
        self.workspace_size
    }

    pub fn accelerated_count(&self) -> usize {
        self.executions.len()
    }

    pub fn is_accelerator_available(&self) -> bool {
        self.accel.is_some()
    }

    pub fn tensor_manager(&self) -> Option<&TensorManager> {
        self.accel.as_ref().map(|a| &a.tensors)
    }

    pub fn use_counts(&self) -> &UseCountTable {
        &self.use_counts
    }

    pub fn execution(&self, id: ExecId) -> Option<&dyn SopExecution> {
        self.executions.get(id.0).map(|e| e.as_ref())
    }

    pub fn config(&self) -> &SopConfig {
        &self.config
    }

    pub fn host(&self) -> &B {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut B {
        &mut self.host
    }
}

impl<B: ComputeBackend> fmt::Debug for SopBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SopBackend")
            .field("host", &self.host)
            .field("accelerator", &self.accel.as_ref().map(|a| &a.tensors))
            .field("registry", &self.registry)
            .field("phase", &self.phase)
            .field("executions", &self.executions)
            .field("workspace_size", &self.workspace_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::mock::MockDriver;
    use crate::foreign::Executor;
    use crate::registry::AdapterFactory;
    use std::sync::Mutex;
    use ir_tensor::{Conv2dCommon, Conv2dParams, CpuBackend, OpParams, OpType, Shape, TensorError};

    /// Host backend that records every call it receives.
    #[derive(Debug, Default)]
    struct RecordingBackend {
        inner: CpuBackend,
        acquired: Vec<TensorId>,
        released: Vec<TensorId>,
        created: Vec<String>,
        copies: usize,
        resize_begins: usize,
        cleared: usize,
    }

    #[derive(Debug)]
    struct HostOp(String);

    impl Execution for HostOp {
        fn name(&self) -> &str {
            &self.0
        }

        fn on_resize(&mut self, _inputs: &[&Tensor], _outputs: &[&Tensor]) -> ir_tensor::Result<()> {
            Ok(())
        }

        fn on_execute(&mut self, _inputs: &[&Tensor], _outputs: &mut [&mut Tensor]) -> ir_tensor::Result<()> {
            Ok(())
        }
    }

    impl ComputeBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_acquire(&mut self, tensor: &mut Tensor) -> ir_tensor::Result<()> {
            self.acquired.push(tensor.id());
            self.inner.on_acquire(tensor)
        }

        fn on_release(&mut self, tensor: &mut Tensor) -> ir_tensor::Result<()> {
            self.released.push(tensor.id());
            self.inner.on_release(tensor)
        }

        fn on_create(
            &mut self,
            op: &Op,
            _inputs: &[&Tensor],
            _outputs: &[&Tensor],
        ) -> ir_tensor::Result<Box<dyn Execution>> {
            self.created.push(op.name.clone());
            if op.op_type == OpType::MatMul {
                return Err(TensorError::UnsupportedOp {
                    op_type: op.op_type,
                    name: op.name.clone(),
                });
            }
            Ok(Box::new(HostOp(op.name.clone())))
        }

        fn on_copy_buffer(&mut self, src: &Tensor, dst: &mut Tensor) -> ir_tensor::Result<()> {
            self.copies += 1;
            self.inner.on_copy_buffer(src, dst)
        }

        fn on_resize_begin(&mut self) {
            self.resize_begins += 1;
        }

        fn on_clear_buffer(&mut self) {
            self.cleared += 1;
        }
    }

    /// Adapter that reports a fixed precheck answer and does nothing else.
    #[derive(Debug)]
    struct StubExec {
        name: String,
        status: SupportStatus,
    }

    impl SopExecution for StubExec {
        fn name(&self) -> &str {
            &self.name
        }

        fn precheck(&self, _inputs: &[&Tensor], _outputs: &[&Tensor]) -> SupportStatus {
            self.status
        }

        fn resize(
            &mut self,
            _ctx: &mut SopContext<'_>,
            _inputs: &[&Tensor],
            _outputs: &mut [&mut Tensor],
        ) -> Result<()> {
            Ok(())
        }

        fn executor(&self) -> Option<&Executor> {
            None
        }

        fn execute(&mut self, _tensors: &TensorManager, _inputs: &[&Tensor], _outputs: &[&Tensor]) -> Result<()> {
            Ok(())
        }
    }

    /// Builds a [`StubExec`] answering `status`, or declines when `status` is `None`.
    /// Every `create` call is logged by name.
    struct StubFactory {
        name: &'static str,
        status: Option<SupportStatus>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl AdapterFactory for StubFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn create(
            &self,
            _driver: &Driver,
            _op: &Op,
            _inputs: &[&Tensor],
            _outputs: &[&Tensor],
        ) -> Option<Box<dyn SopExecution>> {
            self.calls.lock().unwrap().push(self.name);
            let status = self.status?;
            Some(Box::new(StubExec {
                name: self.name.to_string(),
                status,
            }))
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup() -> (Arc<MockDriver>, SopBackend<RecordingBackend>) {
        init_logger();
        let mock = Arc::new(MockDriver::new());
        let driver: Driver = mock.clone();
        let backend = SopBackend::new(
            RecordingBackend::default(),
            Some(driver),
            AdapterRegistry::with_default_adapters(),
            SopConfig::default(),
        );
        (mock, backend)
    }

    /// 1x1 convolution from `ic` to `oc` channels.
    fn conv(name: &str, ic: usize, oc: usize) -> Op {
        Op::conv2d(
            name,
            OpType::Convolution,
            Conv2dParams {
                common: Conv2dCommon {
                    input_count: ic,
                    output_count: oc,
                    ..Conv2dCommon::default()
                },
                weight: vec![1.0; ic * oc],
                bias: Some(vec![0.0; oc]),
                quantized: false,
            },
        )
    }

    fn accelerated(created: CreatedOp) -> ExecId {
        match created {
            CreatedOp::Accelerated(id) => id,
            CreatedOp::Host(exec) => panic!("{} fell back to host", exec.name()),
        }
    }

    #[test]
    fn test_workspace_is_max_of_requirements() {
        let (mock, mut backend) = setup();
        for size in [100, 4096, 256] {
            mock.push_workspace_size(size);
        }
        backend.on_resize_begin();

        let mut tensors: Vec<(Tensor, Tensor)> = (0..3)
            .map(|_| (Tensor::f32(&[1, 2, 4, 4]), Tensor::f32(&[1, 2, 4, 4])))
            .collect();
        let mut ids = Vec::new();
        for (i, (x, y)) in tensors.iter().enumerate() {
            let created = backend.on_create(&conv(&format!("c{i}"), 2, 2), &[x], &[y]).unwrap();
            ids.push(accelerated(created));
        }
        for (id, (x, y)) in ids.iter().zip(tensors.iter_mut()) {
            backend.on_acquire(x).unwrap();
            backend.on_acquire(y).unwrap();
            backend.resize(*id, &[&*x], &mut [y]).unwrap();
        }
        backend.on_resize_end().unwrap();

        assert_eq!(backend.workspace_size(), 4096);
        assert_eq!(backend.phase(), Phase::Initialized);
        assert_eq!(mock.live_standalone_buffers(), 1);

        let inits = mock.init_calls();
        assert_eq!(inits.len(), 3);
        assert!(inits.iter().all(|c| c.workspace != 0 && c.workspace == inits[0].workspace));
        let sizes: Vec<usize> = inits.iter().map(|c| c.size).collect();
        assert_eq!(sizes, [100, 4096, 256]);
    }

    #[test]
    fn test_unsupported_precheck_falls_back_to_host() {
        let (mock, mut backend) = setup();
        mock.set_precheck(SupportStatus::Unsupported);
        backend.on_resize_begin();

        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let created = backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap();
        assert!(!created.is_accelerated());
        assert_eq!(backend.host().created, ["c"]);
        assert!(backend.use_counts().is_empty());

        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.on_resize_end().unwrap();

        assert_eq!(backend.host().acquired, [x.id(), y.id()]);
        assert!(backend.tensor_manager().unwrap().is_empty());
        assert_eq!(backend.accelerated_count(), 0);
        assert_eq!(backend.workspace_size(), 0);
        assert_eq!(mock.live_standalone_buffers(), 0);
        // The rejected adapter took its constants with it.
        assert_eq!(mock.live_tensors(), 0);
    }

    #[test]
    fn test_ops_without_adapter_go_to_host() {
        let (_mock, mut backend) = setup();
        let x = Tensor::f32(&[4]);
        let y = Tensor::f32(&[4]);
        let relu = Op::new("relu", OpType::ReLU, OpParams::None);
        assert!(!backend.on_create(&relu, &[&x], &[&y]).unwrap().is_accelerated());

        let matmul = Op::new("mm", OpType::MatMul, OpParams::None);
        assert!(matches!(
            backend.on_create(&matmul, &[&x], &[&y]),
            Err(AccelError::Tensor(TensorError::UnsupportedOp { .. }))
        ));
    }

    #[test]
    fn test_chained_convolutions_keep_interior_on_accelerator() {
        let (mock, mut backend) = setup();
        backend.on_resize_begin();

        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 4, 4, 4]);
        let mut z = Tensor::f32(&[1, 2, 4, 4]);
        let a = accelerated(backend.on_create(&conv("a", 2, 4), &[&x], &[&y]).unwrap());
        let b = accelerated(backend.on_create(&conv("b", 4, 2), &[&y], &[&z]).unwrap());

        assert_eq!(backend.storage_class(x.id()), StorageClass::Mixed);
        assert_eq!(backend.storage_class(y.id()), StorageClass::AcceleratorOnly);
        assert_eq!(backend.storage_class(z.id()), StorageClass::Mixed);

        for t in [&mut x, &mut y, &mut z] {
            backend.on_acquire(t).unwrap();
        }
        assert!(backend.host().acquired.is_empty());
        let tm = backend.tensor_manager().unwrap();
        assert!(tm.get(y.id()).unwrap().desc().is_virtual());
        assert!(!y.is_allocated());

        backend.resize(a, &[&x], &mut [&mut y]).unwrap();
        assert!(y.is_allocated());
        backend.resize(b, &[&y], &mut [&mut z]).unwrap();
        backend.on_resize_end().unwrap();
        assert_eq!(backend.phase(), Phase::Initialized);

        backend.execute(a, &[&x], &[&y]).unwrap();
        assert_eq!(backend.phase(), Phase::Executable);
        backend.execute(b, &[&y], &[&z]).unwrap();

        let tm = backend.tensor_manager().unwrap();
        let y_handle = tm.foreign_tensor(y.id()).unwrap();
        let calls = mock.execute_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].outputs, [y_handle]);
        assert_eq!(calls[1].inputs, [y_handle]);
        assert_eq!(backend.host().copies, 0);
        assert!(y.host_storage().is_none());
    }

    #[test]
    fn test_release_unknown_tensor_changes_nothing() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        let before = backend.use_counts().clone();
        let x_handle = backend.tensor_manager().unwrap().foreign_tensor(x.id()).unwrap();

        assert!(matches!(
            backend.on_release(&mut y),
            Err(AccelError::NoMemObject(id)) if id == y.id()
        ));
        assert_eq!(backend.use_counts().get(x.id()), before.get(x.id()));
        assert_eq!(backend.use_counts().get(y.id()), before.get(y.id()));
        assert_eq!(backend.use_counts().len(), before.len());
        let tm = backend.tensor_manager().unwrap();
        assert_eq!(tm.foreign_tensor(x.id()).unwrap(), x_handle);
        assert!(x.is_allocated());
        assert_eq!(mock.live_tensors(), 3);

        backend.on_release(&mut x).unwrap();
        assert!(!x.is_allocated());
    }

    #[test]
    fn test_host_release_goes_to_host() {
        let (_mock, mut backend) = setup();
        let mut t = Tensor::f32(&[8]);
        backend.on_acquire(&mut t).unwrap();
        assert!(t.host_storage().is_some());
        backend.on_release(&mut t).unwrap();
        assert_eq!(backend.host().released, [t.id()]);
        assert!(matches!(
            backend.on_release(&mut t),
            Err(AccelError::Tensor(TensorError::NotAllocated(_)))
        ));
    }

    #[test]
    fn test_reacquire_reuses_or_replaces() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 4, 4]);
        accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());

        backend.on_acquire(&mut x).unwrap();
        let creates = mock.tensor_creates();
        backend.on_acquire(&mut x).unwrap();
        assert_eq!(mock.tensor_creates(), creates);

        // A larger shape no longer fits the old object.
        x.set_shape(Shape::new(vec![1, 2, 8, 8]));
        backend.on_acquire(&mut x).unwrap();
        assert_eq!(mock.tensor_creates(), creates + 1);
        let tm = backend.tensor_manager().unwrap();
        assert_eq!(tm.get(x.id()).unwrap().size(), 512);
        assert_eq!(x.device_view().unwrap().byte_len(), 512);
    }

    #[test]
    fn test_reacquire_retries_once_after_failed_allocation() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 4, 4]);
        accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();

        x.set_shape(Shape::new(vec![1, 2, 8, 8]));
        mock.fail_next_tensor_creates(1);
        backend.on_acquire(&mut x).unwrap();
        assert!(x.is_allocated());

        x.set_shape(Shape::new(vec![1, 2, 16, 16]));
        mock.fail_next_tensor_creates(2);
        assert!(backend.on_acquire(&mut x).is_err());
        assert!(!backend.tensor_manager().unwrap().contains(x.id()));
    }

    #[test]
    fn test_init_failure_aborts_pass() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.resize(id, &[&x], &mut [&mut y]).unwrap();

        mock.set_fail_init(true);
        let err = backend.on_resize_end().unwrap_err();
        assert!(matches!(err, AccelError::InitFailed { ref op, .. } if op == "c"));
        assert_eq!(backend.phase(), Phase::Sizing);
        assert!(matches!(
            backend.execute(id, &[&x], &[&y]),
            Err(AccelError::InvalidPhase { expected: Phase::Executable, .. })
        ));
    }

    #[test]
    fn test_resize_failure_aborts_pass() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();

        mock.set_fail_executor_create(true);
        assert!(matches!(
            backend.resize(id, &[&x], &mut [&mut y]),
            Err(AccelError::ForeignCall(_))
        ));
        let err = backend.on_resize_end().unwrap_err();
        assert!(matches!(err, AccelError::ResizeFailed { ref op } if op == "c"));
        assert_eq!(backend.phase(), Phase::Sizing);
        assert!(mock.init_calls().is_empty());
        assert_eq!(mock.live_standalone_buffers(), 0);
        assert!(matches!(
            backend.execute(id, &[&x], &[&y]),
            Err(AccelError::InvalidPhase { actual: Phase::Sizing, .. })
        ));

        // The next pass starts clean.
        mock.set_fail_executor_create(false);
        backend.on_resize_begin();
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.resize(id, &[&x], &mut [&mut y]).unwrap();
        backend.on_resize_end().unwrap();
        backend.execute(id, &[&x], &[&y]).unwrap();
        assert_eq!(backend.phase(), Phase::Executable);
    }

    #[test]
    fn test_first_accepting_factory_wins() {
        init_logger();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stub = |name: &'static str, status: Option<SupportStatus>| -> Arc<dyn AdapterFactory> {
            Arc::new(StubFactory {
                name,
                status,
                calls: Arc::clone(&calls),
            })
        };
        let registry = AdapterRegistry::new()
            .with(OpType::Pooling, stub("declines", None))
            .with(OpType::Pooling, stub("supported", Some(SupportStatus::Supported)))
            .with(OpType::Pooling, stub("unsupported", Some(SupportStatus::Unsupported)))
            .with(OpType::Pooling, stub("optimized", Some(SupportStatus::Optimized)))
            .with(OpType::Pooling, stub("shadowed", Some(SupportStatus::Optimized)));
        let driver: Driver = Arc::new(MockDriver::new());
        let mut backend = SopBackend::new(
            RecordingBackend::default(),
            Some(driver),
            registry,
            SopConfig::default(),
        );

        let x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 2, 2]);
        let pool = Op::new("pool", OpType::Pooling, OpParams::None);
        let id = accelerated(backend.on_create(&pool, &[&x], &[&y]).unwrap());

        assert_eq!(id.index(), 0);
        assert_eq!(backend.execution(id).unwrap().name(), "optimized");
        assert_eq!(*calls.lock().unwrap(), ["declines", "supported", "unsupported", "optimized"]);
        assert_eq!(backend.accelerated_count(), 1);
        assert_eq!(backend.use_counts().len(), 2);
        assert_eq!(backend.use_counts().get(x.id()), Some(-1));
        assert_eq!(backend.use_counts().get(y.id()), Some(1));
        assert!(backend.host().created.is_empty());
    }

    #[test]
    fn test_unresized_op_fails_init() {
        let (_mock, mut backend) = setup();
        let x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 4, 4]);
        accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        let err = backend.on_resize_end().unwrap_err();
        assert!(matches!(
            err,
            AccelError::InitFailed { source, .. } if matches!(*source, AccelError::ExecutorMissing(_))
        ));
    }

    #[test]
    fn test_execute_failure_propagates() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.resize(id, &[&x], &mut [&mut y]).unwrap();
        backend.on_resize_end().unwrap();

        // Without a workspace requirement no buffer is created.
        assert_eq!(backend.workspace_size(), 0);
        assert_eq!(mock.init_calls()[0].workspace, 0);

        mock.set_fail_execute(true);
        assert!(matches!(
            backend.execute(id, &[&x], &[&y]),
            Err(AccelError::ForeignStatus { .. })
        ));
        assert!(matches!(
            backend.execute(ExecId(7), &[&x], &[&y]),
            Err(AccelError::UnknownExecution(7))
        ));
    }

    #[test]
    fn test_phase_violations() {
        let (_mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        assert!(matches!(
            backend.execute(id, &[&x], &[&y]),
            Err(AccelError::InvalidPhase { expected: Phase::Executable, actual: Phase::Planning })
        ));
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.resize(id, &[&x], &mut [&mut y]).unwrap();
        backend.on_resize_end().unwrap();

        assert!(matches!(
            backend.on_create(&conv("d", 2, 2), &[&x], &[&y]),
            Err(AccelError::InvalidPhase { expected: Phase::Planning, .. })
        ));
        assert!(matches!(backend.on_acquire(&mut x), Err(AccelError::InvalidPhase { .. })));
        assert!(matches!(
            backend.resize(id, &[&x], &mut [&mut y]),
            Err(AccelError::InvalidPhase { .. })
        ));
        assert!(matches!(backend.on_resize_end(), Err(AccelError::InvalidPhase { .. })));
    }

    #[test]
    fn test_resize_begin_starts_a_new_generation() {
        let (mock, mut backend) = setup();
        mock.push_workspace_size(64);
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let mut y = Tensor::f32(&[1, 2, 4, 4]);
        let id = accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_acquire(&mut y).unwrap();
        backend.resize(id, &[&x], &mut [&mut y]).unwrap();
        backend.on_resize_end().unwrap();
        assert!(x.is_allocated());

        backend.on_resize_begin();
        assert_eq!(backend.phase(), Phase::Planning);
        assert_eq!(backend.accelerated_count(), 0);
        assert_eq!(backend.workspace_size(), 0);
        assert!(backend.use_counts().is_empty());
        assert!(backend.tensor_manager().unwrap().is_empty());
        assert!(!x.is_allocated());
        assert_eq!(backend.host().resize_begins, 1);
        assert_eq!(mock.live_tensors(), 0);
        assert_eq!(mock.live_executors(), 0);
        assert_eq!(mock.live_standalone_buffers(), 0);
    }

    #[test]
    fn test_copy_buffer_is_a_no_op() {
        let (_mock, mut backend) = setup();
        let mut src = Tensor::f32(&[4]);
        let mut dst = Tensor::f32(&[4]);
        backend.on_acquire(&mut src).unwrap();
        backend.on_acquire(&mut dst).unwrap();
        backend.on_copy_buffer(&src, &mut dst).unwrap();
        assert_eq!(backend.host().copies, 0);
    }

    #[test]
    fn test_clear_buffer_releases_everything() {
        let (mock, mut backend) = setup();
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 4, 4]);
        accelerated(backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap());
        backend.on_acquire(&mut x).unwrap();
        backend.on_clear_buffer();
        assert!(!x.is_allocated());
        assert!(backend.tensor_manager().unwrap().is_empty());
        assert_eq!(backend.host().cleared, 1);
        // Weight and bias constants of the accepted op stay alive.
        assert_eq!(mock.live_tensors(), 2);
    }

    #[test]
    fn test_without_driver_everything_runs_on_host() {
        init_logger();
        let mut backend = SopBackend::new(
            RecordingBackend::default(),
            None,
            AdapterRegistry::with_default_adapters(),
            SopConfig::default(),
        );
        assert!(!backend.is_accelerator_available());
        let mut x = Tensor::f32(&[1, 2, 4, 4]);
        let y = Tensor::f32(&[1, 2, 4, 4]);
        assert!(!backend.on_create(&conv("c", 2, 2), &[&x], &[&y]).unwrap().is_accelerated());
        backend.on_acquire(&mut x).unwrap();
        assert!(x.host_storage().is_some());
        assert!(backend.tensor_manager().is_none());
        backend.on_resize_end().unwrap();
        assert_eq!(backend.phase(), Phase::Initialized);
    }

    #[test]
    fn test_disabled_config_ignores_driver() {
        let mock = Arc::new(MockDriver::new());
        let driver: Driver = mock.clone();
        let backend = SopBackend::new(
            RecordingBackend::default(),
            Some(driver),
            AdapterRegistry::with_default_adapters(),
            SopConfig::disabled(),
        );
        assert!(!backend.is_accelerator_available());
    }

    #[test]
    fn test_from_config_without_library_is_host_only() {
        let config = SopConfig {
            library_paths: vec!["/nonexistent/libai_single_op.so".into()],
            ..SopConfig::default()
        };
        let backend = SopBackend::from_config(
            RecordingBackend::default(),
            AdapterRegistry::with_default_adapters(),
            config,
        );
        assert!(!backend.is_accelerator_available());
        assert_eq!(backend.phase(), Phase::Planning);
    }
}
