use std::sync::Weak;

use half::f16;

use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// Host-side tensor storage owned by the generic backend.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl CpuStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Returns the data as an f32 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F32.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v.as_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32.to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F16 => CpuStorage::F16(vec![f16::ZERO; n]),
            DType::I32 => CpuStorage::I32(vec![0; n]),
            DType::U8 => CpuStorage::U8(vec![0; n]),
        }
    }

    /// Create storage from an f32 vector.
    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        CpuStorage::F32(data)
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::U8(_) => DType::U8,
        }
    }

    /// Copy all elements of `src` into the front of `self`.
    ///
    /// # Errors
    /// Fails when the dtypes differ or `src` holds more elements than `self`.
    pub fn copy_from(&mut self, src: &CpuStorage) -> Result<()> {
        if src.len() > self.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.len()],
                got: vec![src.len()],
            });
        }
        match (self, src) {
            (CpuStorage::F32(d), CpuStorage::F32(s)) => d[..s.len()].copy_from_slice(s),
            (CpuStorage::F16(d), CpuStorage::F16(s)) => d[..s.len()].copy_from_slice(s),
            (CpuStorage::I32(d), CpuStorage::I32(s)) => d[..s.len()].copy_from_slice(s),
            (CpuStorage::U8(d), CpuStorage::U8(s)) => d[..s.len()].copy_from_slice(s),
            (d, s) => {
                return Err(TensorError::DTypeMismatch {
                    expected: d.dtype().to_string(),
                    got: s.dtype().to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Non-owning view of memory that lives in another domain (e.g. accelerator memory).
///
/// The owner hands out a liveness token together with the address. Once the
/// owner drops or replaces its allocation the token dies and the view reports
/// itself as stale, so holders must re-fetch the address rather than keep it
/// across a reallocation.
#[derive(Debug, Clone)]
pub struct DeviceView {
    // Stored as usize so tensors stay Send/Sync.
    addr: usize,
    bytes: usize,
    liveness: Weak<()>,
}

impl DeviceView {
    pub fn new(addr: usize, bytes: usize, liveness: Weak<()>) -> Self {
        DeviceView {
            addr,
            bytes,
            liveness,
        }
    }

    /// True while the owning allocation is still alive.
    pub fn is_alive(&self) -> bool {
        self.liveness.strong_count() > 0
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

/// Where a tensor's bytes currently live.
#[derive(Debug, Clone, Default)]
pub enum TensorStorage {
    #[default]
    Unallocated,
    Host(CpuStorage),
    Device(DeviceView),
}
