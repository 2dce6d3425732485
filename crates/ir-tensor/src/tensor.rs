use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::format::DataFormat;
use crate::shape::Shape;
use crate::storage::{CpuStorage, DeviceView, TensorStorage};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a logical tensor inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A logical tensor owned by the graph.
///
/// Backends never own the tensor itself; they only attach storage to it. The
/// storage is either host memory owned by the generic backend or a borrowed
/// view into memory owned by some other domain.
#[derive(Debug, Clone)]
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    dtype: DType,
    format: DataFormat,
    storage: TensorStorage,
}

impl Tensor {
    /// Create an unallocated tensor with a fresh identity.
    pub fn new(shape: Shape, dtype: DType, format: DataFormat) -> Self {
        Tensor {
            id: TensorId::next(),
            shape,
            dtype,
            format,
            storage: TensorStorage::Unallocated,
        }
    }

    /// Create an unallocated F32 NCHW tensor, the common case for conv graphs.
    pub fn f32(dims: &[usize]) -> Self {
        Tensor::new(Shape::from_slice(dims), DType::F32, DataFormat::Nchw)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the tensor's layout tag.
    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Replace the shape, e.g. after shape inference changes between resize passes.
    /// Any attached storage is dropped since it no longer matches.
    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
        self.storage = TensorStorage::Unallocated;
    }

    /// Dense byte size of the tensor contents.
    pub fn size_in_bytes(&self) -> usize {
        self.shape.numel() * self.dtype.size_in_bytes()
    }

    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Host storage, if the generic backend owns this tensor's bytes.
    pub fn host_storage(&self) -> Option<&CpuStorage> {
        match &self.storage {
            TensorStorage::Host(s) => Some(s),
            _ => None,
        }
    }

    pub fn host_storage_mut(&mut self) -> Option<&mut CpuStorage> {
        match &mut self.storage {
            TensorStorage::Host(s) => Some(s),
            _ => None,
        }
    }

    /// The borrowed device view, only while the owning allocation is alive.
    pub fn device_view(&self) -> Option<&DeviceView> {
        match &self.storage {
            TensorStorage::Device(v) if v.is_alive() => Some(v),
            _ => None,
        }
    }

    pub fn bind_host(&mut self, storage: CpuStorage) {
        self.storage = TensorStorage::Host(storage);
    }

    pub fn bind_device(&mut self, view: DeviceView) {
        self.storage = TensorStorage::Device(view);
    }

    /// Detach any storage, returning what was attached.
    pub fn unbind(&mut self) -> TensorStorage {
        std::mem::take(&mut self.storage)
    }

    /// True when the tensor has usable storage attached.
    pub fn is_allocated(&self) -> bool {
        match &self.storage {
            TensorStorage::Unallocated => false,
            TensorStorage::Host(_) => true,
            TensorStorage::Device(v) => v.is_alive(),
        }
    }
}
