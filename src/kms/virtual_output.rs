//! Output without display hardware.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use smithay::backend::allocator::Fourcc;
use smithay::utils::{Physical, Size};
use tracing::trace;

use crate::buffer::Buffer;
use crate::kms::{
    FbHandle, FlipTimeout, Framebuffer, FramebufferContent, KmsOutput, MemoryStorage, PixelStorage,
};

/// Kernel-side state of a virtual CRTC.
#[derive(Default, Debug)]
struct CrtcState {
    pending: Option<u32>,
    visible: Option<u32>,
    flips: u64,
    mode_sets: u64,
}

/// Shared CRTC state and its vblank notifier.
#[derive(Default)]
struct Crtc {
    state: Mutex<CrtcState>,
    vblank: Condvar,
}

impl Crtc {
    fn lock(&self) -> MutexGuard<'_, CrtcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output scanning out into memory with a simulated vblank.
pub struct VirtualOutput {
    name: String,
    size: Size<i32, Physical>,
    refresh_rate: u32,
    crtc: Arc<Crtc>,
    next_fb_id: AtomicU32,
    fail_set_crtc: AtomicBool,
    fail_page_flip: AtomicBool,
}

impl VirtualOutput {
    pub fn new(name: impl Into<String>, size: Size<i32, Physical>, refresh_rate: u32) -> Self {
        Self {
            size,
            refresh_rate,
            name: name.into(),
            crtc: Default::default(),
            next_fb_id: AtomicU32::new(1),
            fail_set_crtc: Default::default(),
            fail_page_flip: Default::default(),
        }
    }

    /// Output resolution.
    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    /// Reject all future mode-sets, like an unplugged connector.
    pub fn fail_set_crtc(&self, fail: bool) {
        self.fail_set_crtc.store(fail, Ordering::Relaxed);
    }

    /// Reject all future page flips.
    pub fn fail_page_flip(&self, fail: bool) {
        self.fail_page_flip.store(fail, Ordering::Relaxed);
    }

    /// ID of the framebuffer currently on screen.
    pub fn visible_framebuffer(&self) -> Option<u32> {
        self.crtc.lock().visible
    }

    /// Number of completed page flips.
    pub fn flip_count(&self) -> u64 {
        self.crtc.lock().flips
    }

    /// Number of successful mode-sets.
    pub fn mode_set_count(&self) -> u64 {
        self.crtc.lock().mode_sets
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate.max(1)
    }

    fn next_fb_id(&self) -> u32 {
        self.next_fb_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl KmsOutput for VirtualOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_crtc(&self, framebuffer: &FbHandle) -> bool {
        if self.fail_set_crtc.load(Ordering::Relaxed) {
            return false;
        }

        let mut state = self.crtc.lock();
        state.visible = Some(framebuffer.id());
        state.mode_sets += 1;

        true
    }

    fn schedule_page_flip(&self, framebuffer: &FbHandle) -> bool {
        if self.fail_page_flip.load(Ordering::Relaxed) {
            return false;
        }

        let mut state = self.crtc.lock();

        // The kernel rejects flips while one is pending.
        if state.pending.is_some() {
            return false;
        }
        state.pending = Some(framebuffer.id());
        drop(state);

        // Complete the flip at the next vblank.
        let crtc = self.crtc.clone();
        let interval = self.refresh_interval();
        let name = self.name.clone();
        thread::spawn(move || {
            thread::sleep(interval);

            let mut state = crtc.lock();
            state.visible = state.pending.take();
            state.flips += 1;
            trace!(output = %name, framebuffer = ?state.visible, "Virtual vblank");
            drop(state);

            crtc.vblank.notify_all();
        });

        true
    }

    fn wait_for_page_flip(&self, timeout: Option<Duration>) -> Result<(), FlipTimeout> {
        let state = self.crtc.lock();

        match timeout {
            Some(timeout) => {
                let (_state, result) = self
                    .crtc
                    .vblank
                    .wait_timeout_while(state, timeout, |state| state.pending.is_some())
                    .unwrap_or_else(PoisonError::into_inner);

                if result.timed_out() {
                    return Err(FlipTimeout { output: self.name.clone(), timeout });
                }
            },
            None => {
                let _state = self
                    .crtc
                    .vblank
                    .wait_while(state, |state| state.pending.is_some())
                    .unwrap_or_else(PoisonError::into_inner);
            },
        }

        Ok(())
    }

    fn max_refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    fn fb_for(&self, buffer: &Arc<Buffer>) -> Option<FbHandle> {
        let size = buffer.size();
        let content = FramebufferContent::Client(buffer.clone());
        let size = (size.w, size.h).into();
        let fb = Framebuffer::new(self.next_fb_id(), size, buffer.format(), content);
        Some(Arc::new(fb))
    }

    fn create_dumb_framebuffer(&self, size: Size<i32, Physical>) -> io::Result<FbHandle> {
        if size.w <= 0 || size.h <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty framebuffer"));
        }

        let storage: Box<dyn PixelStorage> = Box::new(MemoryStorage::new(size));
        let content = FramebufferContent::Dumb(Mutex::new(storage));
        let fb = Framebuffer::new(self.next_fb_id(), size, Fourcc::Xrgb8888, content);
        Ok(Arc::new(fb))
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;

    #[test]
    fn flip_completes_after_vblank() {
        let output = VirtualOutput::new("VIRTUAL-1", (4, 4).into(), 100);
        let fb = output.create_dumb_framebuffer((4, 4).into()).unwrap();

        let start = Instant::now();
        assert!(output.schedule_page_flip(&fb));

        // Only one flip may be pending.
        assert!(!output.schedule_page_flip(&fb));

        output.wait_for_page_flip(None).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(output.visible_framebuffer(), Some(fb.id()));
        assert_eq!(output.flip_count(), 1);

        // Waiting without pending flip returns immediately.
        output.wait_for_page_flip(None).unwrap();
    }

    #[test]
    fn flip_wait_times_out() {
        let output = VirtualOutput::new("VIRTUAL-1", (4, 4).into(), 1);
        let fb = output.create_dumb_framebuffer((4, 4).into()).unwrap();

        assert!(output.schedule_page_flip(&fb));
        let result = output.wait_for_page_flip(Some(Duration::from_millis(5)));
        assert!(matches!(result, Err(FlipTimeout { .. })));
    }

    #[test]
    fn simulated_unplug() {
        let output = VirtualOutput::new("VIRTUAL-1", (4, 4).into(), 60);
        let fb = output.create_dumb_framebuffer((4, 4).into()).unwrap();

        output.fail_set_crtc(true);
        output.fail_page_flip(true);
        assert!(!output.set_crtc(&fb));
        assert!(!output.schedule_page_flip(&fb));
        assert_eq!(output.mode_set_count(), 0);

        output.fail_set_crtc(false);
        assert!(output.set_crtc(&fb));
        assert_eq!(output.visible_framebuffer(), Some(fb.id()));
    }
}
