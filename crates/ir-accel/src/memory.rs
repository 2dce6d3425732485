//! Memory arbiter: owns the accelerator-resident memory behind logical tensors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ir_tensor::{DeviceView, Tensor, TensorId};

use crate::error::{AccelError, Result};
use crate::foreign::{DataType, Driver, ForeignTensor, Format, TensorDesc, TensorDescHandle, TensorHandle};

/// Round `size` up to a multiple of `alignment`.
pub fn aligned_size(size: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

/// Build the driver descriptor for a graph tensor.
///
/// A virtual descriptor only carries the dims; its element type and layout are
/// filled in by the driver when an operator resolves its output. Concrete
/// descriptors reject element types and layouts the driver cannot represent.
pub fn create_tensor_desc(driver: &Driver, tensor: &Tensor, is_virtual: bool) -> Result<TensorDesc> {
    let dims = tensor.shape().dims_i64();
    if is_virtual {
        return TensorDesc::create(driver, &dims, DataType::Undefined, Format::Reserved, true);
    }
    let format = Format::from_data_format(tensor.format());
    if format == Format::Reserved {
        return Err(AccelError::UnsupportedFormat(tensor.format()));
    }
    let data_type = DataType::from_dtype(tensor.dtype());
    if data_type == DataType::Undefined {
        return Err(AccelError::UnsupportedDataType(tensor.dtype()));
    }
    TensorDesc::create(driver, &dims, data_type, format, false)
}

/// Descriptor, driver tensor and mapped address backing one logical tensor.
pub struct MemObject {
    // Field order is drop order: the tensor goes before its descriptor.
    tensor: Option<ForeignTensor>,
    desc: TensorDesc,
    addr: usize,
    size: usize,
    liveness: Arc<()>,
}

impl MemObject {
    fn new(driver: &Driver, tensor: &Tensor, is_virtual: bool) -> Result<Self> {
        let desc = create_tensor_desc(driver, tensor, is_virtual)?;
        let foreign = ForeignTensor::from_desc(driver, &desc)?;
        let addr = foreign.data_addr();
        let size = foreign.byte_size();
        Ok(MemObject {
            tensor: Some(foreign),
            desc,
            addr,
            size,
            liveness: Arc::new(()),
        })
    }

    /// Replace the driver tensor, keeping the descriptor.
    ///
    /// On failure the object is left without a driver tensor and any view
    /// handed out earlier is dead.
    fn reallocate(&mut self, driver: &Driver) -> Result<()> {
        if let Some(old) = self.tensor.take() {
            log::debug!("releasing driver tensor {:?} for reallocation", old.handle());
        }
        self.liveness = Arc::new(());
        self.addr = 0;
        self.size = 0;
        let foreign = ForeignTensor::from_desc(driver, &self.desc)?;
        self.addr = foreign.data_addr();
        self.size = foreign.byte_size();
        self.tensor = Some(foreign);
        Ok(())
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    /// The driver tensor, absent after a failed reallocation.
    pub fn foreign_tensor(&self) -> Option<TensorHandle> {
        self.tensor.as_ref().map(ForeignTensor::handle)
    }

    /// Mapped address, or 0 when the storage is deferred.
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A borrowed view valid until this object is dropped or reallocated.
    pub fn view(&self) -> DeviceView {
        DeviceView::new(self.addr, self.size, Arc::downgrade(&self.liveness))
    }
}

impl fmt::Debug for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemObject")
            .field("tensor", &self.foreign_tensor())
            .field("desc", &self.desc.handle())
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .finish()
    }
}

/// Sole owner of every [`MemObject`], keyed by tensor identity.
pub struct TensorManager {
    driver: Driver,
    objects: HashMap<TensorId, MemObject>,
}

impl TensorManager {
    pub fn new(driver: Driver) -> Self {
        TensorManager {
            driver,
            objects: HashMap::new(),
        }
    }

    /// Return the memory object of `tensor`, creating it on first request.
    ///
    /// A fresh object binds the tensor to its mapped address unless the driver
    /// deferred the storage (virtual descriptors).
    pub fn allocate(&mut self, tensor: &mut Tensor, exclusive: bool) -> Result<&MemObject> {
        let id = tensor.id();
        if !self.objects.contains_key(&id) {
            let obj = MemObject::new(&self.driver, tensor, exclusive)?;
            log::debug!(
                "allocated {:?} for {} ({} bytes, exclusive={})",
                obj.foreign_tensor(),
                id,
                obj.size(),
                exclusive
            );
            if obj.addr() != 0 {
                tensor.bind_device(obj.view());
            }
            self.objects.insert(id, obj);
        }
        self.objects.get(&id).ok_or(AccelError::NoMemObject(id))
    }

    /// Destroy the memory object of `tensor` and clear its binding.
    pub fn release(&mut self, tensor: &mut Tensor) -> Result<()> {
        match self.objects.remove(&tensor.id()) {
            Some(_) => {
                tensor.unbind();
                Ok(())
            }
            None => {
                log::error!("tensor {} has no accelerator memory object", tensor.id());
                Err(AccelError::NoMemObject(tensor.id()))
            }
        }
    }

    /// Recreate the driver tensor of `tensor` from its (now resolved) descriptor
    /// and rebind the tensor to the new address.
    pub fn reallocate(&mut self, tensor: &mut Tensor) -> Result<&MemObject> {
        let id = tensor.id();
        let obj = match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => {
                log::error!("tensor {} has no accelerator memory object", id);
                return Err(AccelError::NoMemObject(id));
            }
        };
        if let Err(e) = obj.reallocate(&self.driver) {
            log::error!("recreating driver tensor for {} failed: {}", id, e);
            tensor.unbind();
            return Err(e);
        }
        if obj.addr() != 0 {
            tensor.bind_device(obj.view());
        } else {
            tensor.unbind();
        }
        Ok(obj)
    }

    /// Drop every memory object; all handed-out views become stale.
    pub fn release_all(&mut self) {
        if !self.objects.is_empty() {
            log::debug!("releasing {} accelerator memory objects", self.objects.len());
        }
        self.objects.clear();
    }

    /// Copy the bytes of `src`'s memory object into `dst`'s.
    ///
    /// Refuses, without touching memory, when the source is larger than the
    /// destination or the element type / layout differ. Returns the number of
    /// bytes copied.
    pub fn copy(&self, src: TensorId, dst: TensorId) -> Result<usize> {
        let src_obj = self.objects.get(&src).ok_or(AccelError::NoMemObject(src))?;
        let dst_obj = self.objects.get(&dst).ok_or(AccelError::NoMemObject(dst))?;
        if src_obj.size() > dst_obj.size() {
            log::error!("copy {} -> {} refused: {} > {} bytes", src, dst, src_obj.size(), dst_obj.size());
            return Err(AccelError::CopyOverflow {
                src: src_obj.size(),
                dst: dst_obj.size(),
            });
        }
        let (src_type, dst_type) = (src_obj.desc().data_type(), dst_obj.desc().data_type());
        let (src_format, dst_format) = (src_obj.desc().format(), dst_obj.desc().format());
        if src_type != dst_type || src_format != dst_format {
            log::error!("copy {} -> {} refused: incompatible type or format", src, dst);
            return Err(AccelError::CopyIncompatible {
                src_type,
                src_format,
                dst_type,
                dst_format,
            });
        }
        let len = src_obj.size();
        if src == dst || len == 0 {
            return Ok(len);
        }
        if src_obj.addr() == 0 {
            return Err(AccelError::CopyUnmapped(src));
        }
        if dst_obj.addr() == 0 {
            return Err(AccelError::CopyUnmapped(dst));
        }
        // SAFETY: both regions are live driver allocations of at least `len` bytes
        // (checked above) and belong to distinct memory objects.
        unsafe {
            std::ptr::copy_nonoverlapping(src_obj.addr() as *const u8, dst_obj.addr() as *mut u8, len);
        }
        Ok(len)
    }

    pub fn get(&self, id: TensorId) -> Option<&MemObject> {
        self.objects.get(&id)
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Descriptor of `id`, for operators building executors.
    pub fn tensor_desc(&self, id: TensorId) -> Result<TensorDescHandle> {
        self.objects
            .get(&id)
            .map(|obj| obj.desc().handle())
            .ok_or_else(|| {
                log::error!("tensor {} has no accelerator memory object", id);
                AccelError::NoMemObject(id)
            })
    }

    /// Driver tensor of `id`, for operators executing.
    pub fn foreign_tensor(&self, id: TensorId) -> Result<TensorHandle> {
        self.objects
            .get(&id)
            .and_then(MemObject::foreign_tensor)
            .ok_or_else(|| {
                log::error!("tensor {} has no live driver tensor", id);
                AccelError::NoMemObject(id)
            })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl fmt::Debug for TensorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorManager")
            .field("objects", &self.objects)
            .finish()
    }
}
