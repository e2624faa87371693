//! Pixel buffers shared between clients and the server.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::{Buffer as _, Fourcc};
use smithay::utils::{Buffer as BufferCoords, Size};
use thiserror::Error;

use crate::shm::ShmRegion;
use crate::sync::{ConsumerSync, SyncPoint};

/// Next free buffer ID.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Callback fired whenever the compositor finished sampling a buffer.
pub type ConsumedCallback = Box<dyn Fn() + Send + Sync>;

/// Callback fired once the server dropped its last reference to a buffer.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + Sync>;

/// Process-unique buffer identifier.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
pub struct BufferId(u32);

impl BufferId {
    /// Allocate a new unique ID.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for BufferId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl Display for BufferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intended buffer usage.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub enum BufferUsage {
    /// CPU-accessible shared memory.
    #[default]
    Software,
    /// GPU-native allocation.
    Hardware,
}

/// Parameters for a buffer allocation.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct BufferProperties {
    pub size: Size<i32, BufferCoords>,
    pub format: Fourcc,
    pub usage: BufferUsage,
}

impl BufferProperties {
    pub fn new(
        size: impl Into<Size<i32, BufferCoords>>,
        format: Fourcc,
        usage: BufferUsage,
    ) -> Self {
        Self { size: size.into(), format, usage }
    }
}

/// Storage kind of a buffer.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum BufferKind {
    Shm,
    Dmabuf,
}

/// Buffer memory.
pub enum BufferBacking {
    /// Shared memory, either allocated by us or mapped from a client pool.
    Shm { region: Arc<ShmRegion>, offset: usize },
    /// GPU memory shared through dma-buf file descriptors.
    Dmabuf(Dmabuf),
}

/// Errors when accessing buffer contents from the CPU.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("buffer {0} has no CPU mapping")]
    NotMappable(BufferId),
    #[error("expected {expected} bytes of pixel data, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Opaque allocation of pixel storage.
pub struct Buffer {
    id: BufferId,
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    stride: u32,
    backing: BufferBacking,
    sync: ConsumerSync,
    on_consumed: Option<ConsumedCallback>,
    on_release: Option<ReleaseCallback>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl Buffer {
    /// Create a buffer backed by shared memory.
    pub fn from_shm(
        region: Arc<ShmRegion>,
        offset: usize,
        size: impl Into<Size<i32, BufferCoords>>,
        stride: u32,
        format: Fourcc,
    ) -> Self {
        Self::new(size.into(), format, stride, BufferBacking::Shm { region, offset })
    }

    /// Create a buffer backed by a dma-buf.
    pub fn from_dmabuf(dmabuf: Dmabuf) -> Self {
        let size = dmabuf.size();
        let format = dmabuf.format().code;
        let stride = dmabuf.strides().next().unwrap_or(0);
        Self::new(size, format, stride, BufferBacking::Dmabuf(dmabuf))
    }

    fn new(
        size: Size<i32, BufferCoords>,
        format: Fourcc,
        stride: u32,
        backing: BufferBacking,
    ) -> Self {
        Self {
            backing,
            format,
            stride,
            size,
            id: BufferId::next(),
            sync: ConsumerSync::new(),
            on_consumed: None,
            on_release: None,
        }
    }

    /// Attach client notification callbacks.
    pub fn with_callbacks(
        mut self,
        on_consumed: Option<ConsumedCallback>,
        on_release: Option<ReleaseCallback>,
    ) -> Self {
        self.on_consumed = on_consumed;
        self.on_release = on_release;
        self
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Row pitch in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn kind(&self) -> BufferKind {
        match self.backing {
            BufferBacking::Shm { .. } => BufferKind::Shm,
            BufferBacking::Dmabuf(_) => BufferKind::Dmabuf,
        }
    }

    pub fn backing(&self) -> &BufferBacking {
        &self.backing
    }

    /// Underlying dma-buf, if this is a GPU buffer.
    pub fn dmabuf(&self) -> Option<&Dmabuf> {
        match &self.backing {
            BufferBacking::Dmabuf(dmabuf) => Some(dmabuf),
            BufferBacking::Shm { .. } => None,
        }
    }

    /// Consumer fence guarding texture reads of this buffer.
    pub fn sync(&self) -> &ConsumerSync {
        &self.sync
    }

    /// Total size of the pixel data in bytes.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.size.h.max(0) as usize
    }

    /// Read the buffer's pixels.
    ///
    /// Returns `None` for buffers without CPU mapping.
    pub fn with_pixels<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        match &self.backing {
            BufferBacking::Shm { region, offset } => {
                region.with_contents(*offset, self.byte_len(), f)
            },
            BufferBacking::Dmabuf(_) => None,
        }
    }

    /// Modify the buffer's pixels.
    pub fn with_pixels_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T, AccessError> {
        match &self.backing {
            BufferBacking::Shm { region, offset } => region
                .with_contents_mut(*offset, self.byte_len(), f)
                .ok_or(AccessError::NotMappable(self.id)),
            BufferBacking::Dmabuf(_) => Err(AccessError::NotMappable(self.id)),
        }
    }

    /// Replace the buffer's content.
    pub fn write(&self, data: &[u8]) -> Result<(), AccessError> {
        let expected = self.byte_len();
        if data.len() != expected {
            return Err(AccessError::SizeMismatch { expected, actual: data.len() });
        }

        self.with_pixels_mut(|pixels| pixels.copy_from_slice(data))
    }

    /// Start sampling from this buffer.
    ///
    /// The returned binding holds the buffer's consumer fence until it is
    /// finished, which may happen on a different thread.
    pub fn bind(self: &Arc<Self>) -> TextureBinding {
        self.sync.reserve();
        TextureBinding { buffer: self.clone(), finished: false }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("kind", &self.kind())
            .finish()
    }
}

/// In-progress texture read of a buffer.
pub struct TextureBinding {
    buffer: Arc<Buffer>,
    finished: bool,
}

impl Drop for TextureBinding {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.sync.cancel();
        }
    }
}

impl TextureBinding {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Mark sampling as submitted, fulfilling the consumer fence.
    pub fn finish(mut self, sync_point: SyncPoint) {
        self.finished = true;
        self.buffer.sync.set(sync_point);

        if let Some(on_consumed) = &self.buffer.on_consumed {
            on_consumed();
        }
    }
}

/// Bytes per pixel for a pixel format.
pub fn bytes_per_pixel(format: Fourcc) -> Option<u32> {
    match format {
        Fourcc::Argb8888
        | Fourcc::Xrgb8888
        | Fourcc::Abgr8888
        | Fourcc::Xbgr8888
        | Fourcc::Rgba8888
        | Fourcc::Rgbx8888
        | Fourcc::Bgra8888
        | Fourcc::Bgrx8888 => Some(4),
        Fourcc::Rgb888 | Fourcc::Bgr888 => Some(3),
        Fourcc::Rgb565 | Fourcc::Bgr565 => Some(2),
        _ => None,
    }
}
