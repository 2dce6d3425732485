//! Operator-type to adapter-factory mapping, built explicitly and handed to
//! the coordinator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ir_tensor::{Op, OpType, Tensor};

use crate::execution::SopExecution;
use crate::foreign::Driver;
use crate::ops::ConvolutionFactory;

/// Builds accelerated executions for the operator types it is registered under.
pub trait AdapterFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Construct an adapter, or `None` when this factory cannot handle `op`.
    fn create(
        &self,
        driver: &Driver,
        op: &Op,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Option<Box<dyn SopExecution>>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<OpType, Vec<Arc<dyn AdapterFactory>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter this crate ships.
    pub fn with_default_adapters() -> Self {
        let conv: Arc<dyn AdapterFactory> = Arc::new(ConvolutionFactory);
        let mut registry = Self::new();
        for op_type in [
            OpType::Convolution,
            OpType::ConvolutionDepthwise,
            OpType::Deconvolution,
            OpType::DeconvolutionDepthwise,
        ] {
            registry.register(op_type, Arc::clone(&conv));
        }
        registry
    }

    /// Append a factory; earlier registrations are tried first.
    pub fn register(&mut self, op_type: OpType, factory: Arc<dyn AdapterFactory>) {
        self.factories.entry(op_type).or_default().push(factory);
    }

    pub fn with(mut self, op_type: OpType, factory: Arc<dyn AdapterFactory>) -> Self {
        self.register(op_type, factory);
        self
    }

    /// Factories for `op_type` in priority order.
    pub fn factories_for(&self, op_type: OpType) -> &[Arc<dyn AdapterFactory>] {
        self.factories
            .get(&op_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of operator types with at least one factory.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (op_type, list) in &self.factories {
            let names: Vec<&str> = list.iter().map(|fac| fac.name()).collect();
            map.entry(op_type, &names);
        }
        map.finish()
    }
}
