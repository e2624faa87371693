//! Kernel modesetting outputs and framebuffers.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use smithay::backend::allocator::Fourcc;
use smithay::utils::{Physical, Size};
use thiserror::Error;

use crate::buffer::Buffer;

pub mod arena;
pub mod drm;
pub mod virtual_output;

/// Shared framebuffer handle.
pub type FbHandle = Arc<Framebuffer>;

/// Hook destroying the kernel framebuffer object.
pub type FramebufferRelease = Box<dyn FnOnce(u32) + Send + Sync>;

/// Page flip did not complete in time.
#[derive(Error, Debug)]
#[error("page flip on {output} timed out after {timeout:?}")]
pub struct FlipTimeout {
    pub output: String,
    pub timeout: Duration,
}

/// Physical display pipeline.
///
/// All operations may fail, since outputs can disappear at any time.
pub trait KmsOutput: Send + Sync {
    /// Human readable output name.
    fn name(&self) -> &str;

    /// Synchronously display a framebuffer.
    ///
    /// Returns `false` if the mode-set was rejected.
    fn set_crtc(&self, framebuffer: &FbHandle) -> bool;

    /// Schedule a framebuffer for display at the next vblank.
    ///
    /// Returns `false` if the flip was rejected.
    fn schedule_page_flip(&self, framebuffer: &FbHandle) -> bool;

    /// Block until the scheduled flip has completed.
    ///
    /// Returns immediately if no flip is pending.
    fn wait_for_page_flip(&self, timeout: Option<Duration>) -> Result<(), FlipTimeout>;

    /// Refresh rate of the current mode in Hz.
    fn max_refresh_rate(&self) -> u32;

    /// Framebuffer for direct scanout of a client buffer.
    fn fb_for(&self, buffer: &Arc<Buffer>) -> Option<FbHandle>;

    /// Allocate a CPU-writable XRGB8888 framebuffer.
    fn create_dumb_framebuffer(&self, size: Size<i32, Physical>) -> io::Result<FbHandle>;
}

/// CPU mapping of framebuffer memory.
pub trait PixelStorage: Send {
    /// Run `f` with the framebuffer's pixels and row pitch.
    fn with_pixels(&mut self, f: &mut dyn FnMut(&mut [u8], u32)) -> io::Result<()>;
}

/// Framebuffer memory in the server's address space.
pub struct MemoryStorage {
    data: Vec<u8>,
    pitch: u32,
}

impl MemoryStorage {
    pub fn new(size: Size<i32, Physical>) -> Self {
        let pitch = size.w.max(0) as u32 * 4;
        Self { pitch, data: vec![0; pitch as usize * size.h.max(0) as usize] }
    }
}

impl PixelStorage for MemoryStorage {
    fn with_pixels(&mut self, f: &mut dyn FnMut(&mut [u8], u32)) -> io::Result<()> {
        f(&mut self.data, self.pitch);
        Ok(())
    }
}

/// Content displayed by a framebuffer.
pub enum FramebufferContent {
    /// Client buffer scanned out directly.
    Client(Arc<Buffer>),
    /// Composited image.
    Dumb(Mutex<Box<dyn PixelStorage>>),
}

/// Kernel framebuffer object.
pub struct Framebuffer {
    id: u32,
    size: Size<i32, Physical>,
    format: Fourcc,
    content: FramebufferContent,
    release: Option<FramebufferRelease>,
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.id);
        }
    }
}

impl Framebuffer {
    pub fn new(
        id: u32,
        size: Size<i32, Physical>,
        format: Fourcc,
        content: FramebufferContent,
    ) -> Self {
        Self { id, size, format, content, release: None }
    }

    /// Destroy the kernel object once the framebuffer is dropped.
    pub fn with_release(mut self, release: FramebufferRelease) -> Self {
        self.release = Some(release);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Client buffer held for direct scanout.
    pub fn client_buffer(&self) -> Option<&Arc<Buffer>> {
        match &self.content {
            FramebufferContent::Client(buffer) => Some(buffer),
            FramebufferContent::Dumb(_) => None,
        }
    }

    /// Access the pixels of a CPU-writable framebuffer.
    pub fn with_pixels(&self, mut f: impl FnMut(&mut [u8], u32)) -> io::Result<()> {
        match &self.content {
            FramebufferContent::Dumb(storage) => {
                let mut storage = storage.lock().unwrap_or_else(PoisonError::into_inner);
                storage.with_pixels(&mut f)
            },
            FramebufferContent::Client(_) => {
                Err(io::Error::new(io::ErrorKind::Unsupported, "client framebuffer is read-only"))
            },
        }
    }

    /// Fill every byte of the framebuffer.
    pub fn fill(&self, value: u8) -> io::Result<()> {
        self.with_pixels(|pixels, _| pixels.fill(value))
    }
}

impl Debug for Framebuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("client_buffer", &self.client_buffer().map(|buffer| buffer.id()))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn release_runs_once_on_drop() {
        let released = Arc::new(AtomicU32::new(0));
        let tracker = released.clone();

        let storage: Box<dyn PixelStorage> = Box::new(MemoryStorage::new((2, 2).into()));
        let content = FramebufferContent::Dumb(Mutex::new(storage));
        let fb = Framebuffer::new(17, (2, 2).into(), Fourcc::Xrgb8888, content).with_release(
            Box::new(move |id| {
                tracker.store(id, Ordering::SeqCst);
            }),
        );

        let handle: FbHandle = Arc::new(fb);
        let visible = handle.clone();
        drop(handle);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        drop(visible);
        assert_eq!(released.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn fill_dumb_framebuffer() {
        let storage: Box<dyn PixelStorage> = Box::new(MemoryStorage::new((3, 2).into()));
        let content = FramebufferContent::Dumb(Mutex::new(storage));
        let fb = Framebuffer::new(1, (3, 2).into(), Fourcc::Xrgb8888, content);

        fb.fill(24).unwrap();
        fb.with_pixels(|pixels, pitch| {
            assert_eq!(pitch, 12);
            assert_eq!(pixels.len(), 24);
            assert!(pixels.iter().all(|byte| *byte == 24));
        })
        .unwrap();
    }
}
