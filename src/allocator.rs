//! Buffer allocation and import.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use smithay::backend::allocator::dmabuf::{AsDmabuf, Dmabuf};
use smithay::backend::allocator::gbm::GbmAllocator;
use smithay::backend::allocator::{Allocator, Buffer as _, Format, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use smithay::utils::{Buffer as BufferCoords, Size};
use thiserror::Error;
use tracing::debug;

use crate::buffer::{
    self, Buffer, BufferProperties, BufferUsage, ConsumedCallback, ReleaseCallback,
};
use crate::gpu::{ContextError, GpuExecutor};
use crate::shm::ShmRegion;

/// Formats accepted for shared memory buffers.
pub const SOFTWARE_FORMATS: [Fourcc; 4] =
    [Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Abgr8888, Fourcc::Xbgr8888];

/// Formats usable in every composition and scanout path.
const SUPPORTED_FORMATS: [Fourcc; 2] = [Fourcc::Argb8888, Fourcc::Xrgb8888];

/// Buffer allocation errors.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(Fourcc),
    #[error("invalid buffer size {}x{}", .0.w, .0.h)]
    InvalidSize(Size<i32, BufferCoords>),
    #[error("no GPU available for hardware buffers")]
    NoHardware,
    #[error("buffer import unsupported: {0}")]
    ImportUnsupported(String),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("shared memory allocation failed: {0}")]
    Shm(#[from] io::Error),
    #[error("GBM allocation failed: {0}")]
    Gbm(String),
}

/// Conservative list of formats every buffer path accepts.
pub fn supported_pixel_formats() -> &'static [Fourcc] {
    &SUPPORTED_FORMATS
}

/// Source of buffers for clients and the compositor.
pub struct BufferAllocator {
    gpu: Option<GpuExecutor>,
    gbm: Option<Mutex<GbmAllocator<DrmDeviceFd>>>,
    import_formats: HashSet<Format>,
}

impl BufferAllocator {
    /// Allocator limited to shared memory buffers.
    pub fn software() -> Self {
        Self { gpu: None, gbm: None, import_formats: HashSet::new() }
    }

    /// Allocator with GPU support.
    ///
    /// The `import_formats` are the dma-buf formats the GPU can sample from.
    pub fn new(
        gpu: GpuExecutor,
        gbm: Option<GbmAllocator<DrmDeviceFd>>,
        import_formats: HashSet<Format>,
    ) -> Self {
        Self { import_formats, gpu: Some(gpu), gbm: gbm.map(Mutex::new) }
    }

    /// GPU executor, if hardware acceleration is available.
    pub fn gpu(&self) -> Option<&GpuExecutor> {
        self.gpu.as_ref()
    }

    /// Allocate a buffer for the requested usage.
    pub fn alloc_buffer(&self, properties: &BufferProperties) -> Result<Arc<Buffer>, AllocError> {
        let BufferProperties { size, format, usage } = *properties;
        let buffer = match usage {
            BufferUsage::Software => self.alloc_software_buffer(size, format)?,
            BufferUsage::Hardware => self.alloc_hardware_buffer(size, format)?,
        };
        Ok(Arc::new(buffer))
    }

    /// Allocate a buffer in anonymous shared memory.
    pub fn alloc_software_buffer(
        &self,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<Buffer, AllocError> {
        if !SOFTWARE_FORMATS.contains(&format) {
            return Err(AllocError::UnsupportedFormat(format));
        }

        let bpp = buffer::bytes_per_pixel(format).ok_or(AllocError::UnsupportedFormat(format))?;
        let (stride, len) = shm_layout(size, bpp).ok_or(AllocError::InvalidSize(size))?;

        let region = Arc::new(ShmRegion::anonymous(len)?);
        Ok(Buffer::from_shm(region, 0, size, stride, format))
    }

    /// Allocate a GPU buffer, shared as dma-buf.
    fn alloc_hardware_buffer(
        &self,
        size: Size<i32, BufferCoords>,
        format: Fourcc,
    ) -> Result<Buffer, AllocError> {
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(AllocError::UnsupportedFormat(format));
        }
        if size.w <= 0 || size.h <= 0 {
            return Err(AllocError::InvalidSize(size));
        }

        let (gpu, gbm) = match (&self.gpu, &self.gbm) {
            (Some(gpu), Some(gbm)) => (gpu, gbm),
            _ => return Err(AllocError::NoHardware),
        };

        let _context = gpu.acquire()?;

        let mut gbm = gbm.lock().unwrap_or_else(PoisonError::into_inner);
        let gbm_buffer = gbm
            .create_buffer(size.w as u32, size.h as u32, format, &[Modifier::Invalid])
            .map_err(|err| AllocError::Gbm(err.to_string()))?;
        let dmabuf = gbm_buffer.export().map_err(|err| AllocError::Gbm(err.to_string()))?;

        Ok(Buffer::from_dmabuf(dmabuf))
    }

    /// Wrap a client dma-buf for sampling without copying it.
    pub fn buffer_from_resource(
        &self,
        dmabuf: Dmabuf,
        on_consumed: Option<ConsumedCallback>,
        on_release: Option<ReleaseCallback>,
    ) -> Result<Arc<Buffer>, AllocError> {
        let gpu = self.gpu.as_ref().ok_or(AllocError::NoHardware)?;
        let _context = gpu.acquire()?;

        let format = dmabuf.format();
        if !self.import_formats.contains(&format) {
            debug!("Rejecting dma-buf import with format {:?}", format);
            return Err(AllocError::ImportUnsupported(format!(
                "format {:?} with modifier {:?}",
                format.code, format.modifier
            )));
        }

        let buffer = Buffer::from_dmabuf(dmabuf).with_callbacks(on_consumed, on_release);
        Ok(Arc::new(buffer))
    }

    /// Wrap a region of a client's shared memory pool without copying it.
    pub fn buffer_from_shm(
        &self,
        pool: Arc<ShmRegion>,
        offset: usize,
        size: Size<i32, BufferCoords>,
        stride: u32,
        format: Fourcc,
        on_consumed: Option<ConsumedCallback>,
    ) -> Result<Arc<Buffer>, AllocError> {
        if !SOFTWARE_FORMATS.contains(&format) {
            return Err(AllocError::UnsupportedFormat(format));
        }

        let bpp = buffer::bytes_per_pixel(format).ok_or(AllocError::UnsupportedFormat(format))?;
        if size.w <= 0 || size.h <= 0 || (stride as u64) < size.w as u64 * bpp as u64 {
            return Err(AllocError::InvalidSize(size));
        }

        // Ensure the buffer is fully contained in the pool.
        let end = (stride as usize)
            .checked_mul(size.h as usize)
            .and_then(|len| len.checked_add(offset));
        if end.map_or(true, |end| end > pool.len()) {
            return Err(AllocError::ImportUnsupported(format!(
                "buffer exceeds shm pool of {} bytes",
                pool.len()
            )));
        }

        let buffer = Buffer::from_shm(pool, offset, size, stride, format)
            .with_callbacks(on_consumed, None);
        Ok(Arc::new(buffer))
    }
}

/// Stride and total size of a tightly packed shm buffer.
fn shm_layout(size: Size<i32, BufferCoords>, bpp: u32) -> Option<(u32, usize)> {
    if size.w <= 0 || size.h <= 0 {
        return None;
    }

    let stride = (size.w as u32).checked_mul(bpp)?;
    let len = (stride as usize).checked_mul(size.h as usize)?;
    Some((stride, len))
}
