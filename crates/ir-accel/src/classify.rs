//! Storage classification from signed per-tensor use counts.
//!
//! Every accelerated operator subtracts one for each tensor it consumes and
//! adds one for each tensor it produces. An interior tensor of an accelerated
//! subgraph nets to zero whatever its fan-in or fan-out; a tensor that only
//! enters or only leaves the accelerated region keeps a residual.

use std::collections::HashMap;

use ir_tensor::TensorId;

/// Where a tensor's storage has to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    /// Only touched by generic-backend operators.
    HostOnly,
    /// Only touched by accelerated operators, in balanced producer/consumer fashion.
    AcceleratorOnly,
    /// Crosses the domain boundary or is a graph boundary of the accelerated region.
    Mixed,
}

impl StorageClass {
    /// True when the tensor's memory is owned by the accelerator arbiter.
    pub fn is_accelerated(self) -> bool {
        !matches!(self, StorageClass::HostOnly)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UseCountTable {
    counts: HashMap<TensorId, i32>,
}

impl UseCountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one accelerated operator.
    pub fn record<I, O>(&mut self, inputs: I, outputs: O)
    where
        I: IntoIterator<Item = TensorId>,
        O: IntoIterator<Item = TensorId>,
    {
        for id in inputs {
            *self.counts.entry(id).or_insert(0) -= 1;
        }
        for id in outputs {
            *self.counts.entry(id).or_insert(0) += 1;
        }
    }

    pub fn get(&self, id: TensorId) -> Option<i32> {
        self.counts.get(&id).copied()
    }

    pub fn classify(&self, id: TensorId) -> StorageClass {
        match self.counts.get(&id) {
            None => StorageClass::HostOnly,
            Some(0) => StorageClass::AcceleratorOnly,
            Some(_) => StorageClass::Mixed,
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
