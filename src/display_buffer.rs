//! Per-output frame posting.
//!
//! A display buffer owns one rectangle of the output space, shown on one or
//! more outputs in clone mode. Every frame it either scans a client buffer
//! out directly, or displays an image composited by the renderer.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use smithay::utils::{Buffer as BufferCoords, Physical, Rectangle, Transform};
use tracing::{error, warn};

use crate::buffer::Buffer;
use crate::kms::arena::{FramebufferArena, SlotState};
use crate::kms::{FbHandle, KmsOutput};

/// Expected render time when client buffers are scanned out directly.
const BYPASS_RENDER_TIME: Duration = Duration::from_millis(5);

/// Expected render time for composited frames.
const COMPOSITE_RENDER_TIME: Duration = Duration::from_millis(50);

/// Surface content candidate for display.
#[derive(Clone, Debug)]
pub struct DisplayElement {
    /// Target area in output space.
    pub screen_position: Rectangle<i32, Physical>,
    /// Sampled area of the buffer.
    pub source_position: Rectangle<f64, BufferCoords>,
    pub buffer: Arc<Buffer>,
}

impl DisplayElement {
    /// Element showing the entire buffer.
    pub fn new(buffer: Arc<Buffer>, screen_position: Rectangle<i32, Physical>) -> Self {
        let size = buffer.size().to_f64();
        let source_position = Rectangle::from_loc_and_size((0., 0.), size);
        Self { screen_position, source_position, buffer }
    }
}

/// Direct scanout policy.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub enum BypassOption {
    #[default]
    Allowed,
    Prohibited,
}

/// Observable posting state.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum PostingState {
    /// No flip outstanding.
    Idle,
    /// Waiting for the kernel to complete a flip.
    FlipScheduled,
    /// The next post will use a synchronous mode-set.
    NeedsSetCrtc,
}

/// Output area driven through KMS.
///
/// Posting requires exclusive access, so only one post can be in flight.
pub struct DisplayBuffer {
    outputs: Vec<Arc<dyn KmsOutput>>,
    area: Rectangle<i32, Physical>,
    transform: Transform,
    framebuffers: FramebufferArena,
    bypass: BypassOption,
    holding_client_buffers: bool,
    needs_set_crtc: bool,
    flipping_outputs: Vec<usize>,
    recommended_sleep: Duration,
    flip_timeout: Option<Duration>,
}

impl DisplayBuffer {
    /// Create a display buffer, showing `initial_fb` on all outputs.
    pub fn new(
        outputs: Vec<Arc<dyn KmsOutput>>,
        area: Rectangle<i32, Physical>,
        transform: Transform,
        initial_fb: FbHandle,
        bypass: BypassOption,
    ) -> Self {
        let mut display_buffer = Self {
            transform,
            outputs,
            bypass,
            area,
            framebuffers: FramebufferArena::new(),
            holding_client_buffers: Default::default(),
            flipping_outputs: Default::default(),
            recommended_sleep: Default::default(),
            needs_set_crtc: Default::default(),
            flip_timeout: Default::default(),
        };

        // Display the initial framebuffer right away.
        display_buffer.framebuffers.stage(initial_fb.clone());
        display_buffer.framebuffers.present();
        display_buffer.set_crtc(&initial_fb);

        display_buffer
    }

    /// Area of the output space shown by this display.
    pub fn view_area(&self) -> Rectangle<i32, Physical> {
        self.area
    }

    pub fn transformation(&self) -> Transform {
        self.transform
    }

    /// Update the output transform and the resulting view area.
    pub fn set_transformation(&mut self, transform: Transform, area: Rectangle<i32, Physical>) {
        self.transform = transform;
        self.area = area;
    }

    /// Bound the time spent waiting for a page flip.
    pub fn set_flip_timeout(&mut self, timeout: Option<Duration>) {
        self.flip_timeout = timeout;
    }

    pub fn outputs(&self) -> &[Arc<dyn KmsOutput>] {
        &self.outputs
    }

    /// Framebuffer in a posting stage.
    pub fn framebuffer(&self, state: SlotState) -> Option<&FbHandle> {
        self.framebuffers.get(state)
    }

    /// Try to display the elements without composition.
    ///
    /// Returns `false` if the elements need to be composited instead, in which
    /// case no state is modified.
    pub fn overlay(&mut self, elements: &[DisplayElement]) -> bool {
        if self.bypass == BypassOption::Prohibited || self.transform != Transform::Normal {
            return false;
        }

        // Bypass is only possible for a single fullscreen buffer.
        let element = match elements {
            [element] => element,
            _ => return false,
        };
        if element.screen_position != self.area {
            return false;
        }

        // Source must be the entire unscaled buffer.
        let size = element.buffer.size();
        let full_source = Rectangle::from_loc_and_size((0., 0.), size.to_f64());
        if element.source_position != full_source
            || size.w != self.area.size.w
            || size.h != self.area.size.h
        {
            return false;
        }

        let fb = match self.outputs.first().and_then(|output| output.fb_for(&element.buffer)) {
            Some(fb) => fb,
            None => return false,
        };
        self.framebuffers.stage(fb);
        self.holding_client_buffers = true;

        true
    }

    /// Stage a composited image for the next post.
    pub fn set_next_image(&mut self, framebuffer: FbHandle) {
        self.framebuffers.stage(framebuffer);
        self.holding_client_buffers = false;
    }

    /// Submit the staged framebuffer to all outputs.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn post(&mut self) {
        // Reclaim the framebuffer replaced by the last flip.
        self.wait_for_page_flip();

        let staged = self.framebuffers.get(SlotState::Staged).cloned();

        if let Some(fb) = staged.as_ref().filter(|_| !self.needs_set_crtc) {
            self.schedule_page_flips(fb);
        }

        if self.needs_set_crtc {
            let fb = staged.or_else(|| self.framebuffers.get(SlotState::Visible).cloned());
            if let Some(fb) = fb {
                self.set_crtc(&fb);
            }

            // Mode-sets are synchronous, so the framebuffer is visible immediately.
            self.framebuffers.present();
            self.needs_set_crtc = false;
        }

        // Client buffers are held until their flip completes, so release them early.
        let predicted_render_time = if self.holding_client_buffers {
            self.wait_for_page_flip();
            BYPASS_RENDER_TIME
        } else {
            // Double buffering is only possible with a single output.
            if self.outputs.len() == 1 {
                self.wait_for_page_flip();
            }
            COMPOSITE_RENDER_TIME
        };

        self.recommended_sleep = match self.outputs.as_slice() {
            [output] if output.max_refresh_rate() > 0 => {
                let frame_time = Duration::from_secs(1) / output.max_refresh_rate();
                frame_time.saturating_sub(predicted_render_time)
            },
            _ => Duration::ZERO,
        };
    }

    /// Delay before the next frame should be rendered.
    pub fn recommended_sleep(&self) -> Duration {
        self.recommended_sleep
    }

    /// Force a synchronous mode-set on the next post.
    pub fn schedule_set_crtc(&mut self) {
        self.needs_set_crtc = true;
    }

    /// Wait for the outstanding page flip of all outputs.
    ///
    /// This is a no-op if no flip is scheduled.
    pub fn wait_for_page_flip(&mut self) {
        if self.framebuffers.get(SlotState::Scheduled).is_none() {
            return;
        }

        for index in mem::take(&mut self.flipping_outputs) {
            let output = &self.outputs[index];
            if let Err(err) = output.wait_for_page_flip(self.flip_timeout) {
                error!("{err}");

                // Recover from lost flip events with a mode-set.
                self.needs_set_crtc = true;
            }
        }

        self.framebuffers.complete();
    }

    pub fn state(&self) -> PostingState {
        if self.needs_set_crtc {
            PostingState::NeedsSetCrtc
        } else if self.framebuffers.get(SlotState::Scheduled).is_some() {
            PostingState::FlipScheduled
        } else {
            PostingState::Idle
        }
    }

    /// Schedule a flip on every output.
    ///
    /// If any output rejects the flip, a mode-set is requested instead.
    fn schedule_page_flips(&mut self, fb: &FbHandle) {
        let mut accepted = Vec::with_capacity(self.outputs.len());
        for (index, output) in self.outputs.iter().enumerate() {
            if output.schedule_page_flip(fb) {
                accepted.push(index);
            } else {
                warn!("Page flip rejected by output {}, falling back to mode-set", output.name());
                self.needs_set_crtc = true;
            }
        }

        if !self.needs_set_crtc {
            self.framebuffers.schedule();
            self.flipping_outputs = accepted;
            return;
        }

        // Drain partial flips before the mode-set takes over.
        for index in accepted {
            let output = &self.outputs[index];
            if let Err(err) = output.wait_for_page_flip(self.flip_timeout) {
                error!("{err}");
            }
        }
    }

    /// Synchronously display a framebuffer on all outputs.
    fn set_crtc(&self, fb: &FbHandle) {
        for output in &self.outputs {
            if !output.set_crtc(fb) {
                error!("Failed to set CRTC for output {}", output.name());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use smithay::backend::allocator::Fourcc;
    use smithay::utils::Size;

    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::kms::{FlipTimeout, Framebuffer, FramebufferContent, MemoryStorage, PixelStorage};

    /// Output recording all KMS requests.
    struct MockOutput {
        name: &'static str,
        refresh_rate: u32,
        next_fb_id: AtomicU32,
        fb_for_failures: AtomicUsize,
        fail_set_crtc: AtomicBool,
        fail_page_flip: AtomicBool,
        lose_flips: AtomicBool,
        flip_pending: AtomicBool,
        set_crtcs: AtomicUsize,
        flips: AtomicUsize,
    }

    impl MockOutput {
        fn new(name: &'static str, refresh_rate: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                refresh_rate,
                next_fb_id: AtomicU32::new(1),
                fb_for_failures: Default::default(),
                fail_set_crtc: Default::default(),
                fail_page_flip: Default::default(),
                lose_flips: Default::default(),
                flip_pending: Default::default(),
                set_crtcs: Default::default(),
                flips: Default::default(),
            })
        }
    }

    impl KmsOutput for MockOutput {
        fn name(&self) -> &str {
            self.name
        }

        fn set_crtc(&self, _framebuffer: &FbHandle) -> bool {
            if self.fail_set_crtc.load(Ordering::SeqCst) {
                return false;
            }
            self.set_crtcs.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn schedule_page_flip(&self, _framebuffer: &FbHandle) -> bool {
            if self.fail_page_flip.load(Ordering::SeqCst) {
                return false;
            }

            assert!(!self.flip_pending.swap(true, Ordering::SeqCst), "flip already pending");
            self.flips.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn wait_for_page_flip(&self, timeout: Option<Duration>) -> Result<(), FlipTimeout> {
            if let Some(timeout) = timeout.filter(|_| self.lose_flips.load(Ordering::SeqCst)) {
                return Err(FlipTimeout { output: self.name.into(), timeout });
            }

            self.flip_pending.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn max_refresh_rate(&self) -> u32 {
            self.refresh_rate
        }

        fn fb_for(&self, buffer: &Arc<Buffer>) -> Option<FbHandle> {
            let failures = self.fb_for_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.fb_for_failures.store(failures - 1, Ordering::SeqCst);
                return None;
            }

            let id = self.next_fb_id.fetch_add(1, Ordering::SeqCst);
            let size = (buffer.size().w, buffer.size().h).into();
            let content = FramebufferContent::Client(buffer.clone());
            Some(Arc::new(Framebuffer::new(id, size, buffer.format(), content)))
        }

        fn create_dumb_framebuffer(&self, size: Size<i32, Physical>) -> io::Result<FbHandle> {
            let id = self.next_fb_id.fetch_add(1, Ordering::SeqCst);
            let storage: Box<dyn PixelStorage> = Box::new(MemoryStorage::new(size));
            let content = FramebufferContent::Dumb(Mutex::new(storage));
            Ok(Arc::new(Framebuffer::new(id, size, Fourcc::Xrgb8888, content)))
        }
    }

    /// In-memory log sink.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn area() -> Rectangle<i32, Physical> {
        Rectangle::from_loc_and_size((0, 0), (64, 32))
    }

    fn display_buffer(outputs: &[Arc<MockOutput>], bypass: BypassOption) -> DisplayBuffer {
        let initial_fb = outputs[0].create_dumb_framebuffer(area().size).unwrap();
        let outputs = outputs.iter().map(|output| output.clone() as Arc<dyn KmsOutput>).collect();
        DisplayBuffer::new(outputs, area(), Transform::Normal, initial_fb, bypass)
    }

    fn client_buffer(width: i32, height: i32) -> Arc<Buffer> {
        let allocator = BufferAllocator::software();
        Arc::new(allocator.alloc_software_buffer((width, height).into(), Fourcc::Argb8888).unwrap())
    }

    fn fullscreen(buffer: &Arc<Buffer>) -> DisplayElement {
        DisplayElement::new(buffer.clone(), area())
    }

    #[test]
    fn initial_framebuffer_is_mode_set() {
        let outputs = [MockOutput::new("DP-1", 60), MockOutput::new("DP-2", 60)];
        let display = display_buffer(&outputs, BypassOption::Allowed);

        assert_eq!(outputs[0].set_crtcs.load(Ordering::SeqCst), 1);
        assert_eq!(outputs[1].set_crtcs.load(Ordering::SeqCst), 1);
        assert!(display.framebuffer(SlotState::Visible).is_some());
        assert_eq!(display.state(), PostingState::Idle);
    }

    #[test]
    fn bypass_frames_are_throttled() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);
        let buffer = client_buffer(64, 32);

        for _ in 0..5 {
            assert!(display.overlay(&[fullscreen(&buffer)]));
            display.post();

            assert!(display.recommended_sleep() >= Duration::from_millis(8));
            assert_eq!(display.state(), PostingState::Idle);
        }

        assert_eq!(output.flips.load(Ordering::SeqCst), 5);
        let visible = display.framebuffer(SlotState::Visible).unwrap();
        assert_eq!(visible.client_buffer().map(|buffer| buffer.id()), Some(buffer.id()));
    }

    #[test]
    fn bypass_budget_survives_empty_post() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);
        let buffer = client_buffer(64, 32);

        assert!(display.overlay(&[fullscreen(&buffer)]));
        display.post();
        let sleep = display.recommended_sleep();
        assert!(sleep >= Duration::from_millis(8));

        // Nothing new to show, the client buffer is still on screen.
        display.post();
        assert_eq!(display.recommended_sleep(), sleep);

        let fb = output.create_dumb_framebuffer(area().size).unwrap();
        display.set_next_image(fb);
        display.post();
        assert_eq!(display.recommended_sleep(), Duration::ZERO);
    }

    #[test]
    fn composited_frames_are_not_throttled() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);

        for _ in 0..5 {
            let fb = output.create_dumb_framebuffer(area().size).unwrap();
            display.set_next_image(fb);
            display.post();

            assert_eq!(display.recommended_sleep(), Duration::ZERO);
        }
    }

    #[test]
    fn clone_mode_is_not_throttled() {
        let outputs = [MockOutput::new("DP-1", 60), MockOutput::new("DP-2", 60)];
        let mut display = display_buffer(&outputs, BypassOption::Allowed);
        let buffer = client_buffer(64, 32);

        assert!(display.overlay(&[fullscreen(&buffer)]));
        display.post();

        assert_eq!(display.recommended_sleep(), Duration::ZERO);
        assert_eq!(outputs[1].flips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlay_recovers_from_failed_import() {
        let output = MockOutput::new("DP-1", 60);
        output.fb_for_failures.store(1, Ordering::SeqCst);
        let mut display = display_buffer(&[output], BypassOption::Allowed);

        let buffer = client_buffer(64, 32);
        let elements = [fullscreen(&buffer)];
        assert!(!display.overlay(&elements));
        assert!(display.framebuffer(SlotState::Staged).is_none());

        assert!(display.overlay(&elements));
        assert!(display.framebuffer(SlotState::Staged).is_some());
    }

    #[test]
    fn overlay_declines_without_side_effects() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);

        let staged = output.create_dumb_framebuffer(area().size).unwrap();
        display.set_next_image(staged.clone());

        let buffer = client_buffer(64, 32);

        // Moved element.
        let mut moved = fullscreen(&buffer);
        moved.screen_position.loc = (1, 0).into();

        // Cropped source.
        let mut cropped = fullscreen(&buffer);
        cropped.source_position = Rectangle::from_loc_and_size((1., 0.), (63., 32.));

        // Scaled source.
        let mut scaled = fullscreen(&buffer);
        scaled.source_position.size = (32., 16.).into();

        // Buffer smaller than the output.
        let stretched = DisplayElement::new(client_buffer(32, 16), area());

        assert!(!display.overlay(&[moved]));
        assert!(!display.overlay(&[cropped]));
        assert!(!display.overlay(&[scaled]));
        assert!(!display.overlay(&[stretched]));
        assert!(!display.overlay(&[fullscreen(&buffer), fullscreen(&buffer)]));
        assert!(!display.overlay(&[]));

        let current = display.framebuffer(SlotState::Staged).unwrap();
        assert!(Arc::ptr_eq(current, &staged));
    }

    #[test]
    fn rotated_output_cannot_bypass() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output], BypassOption::Allowed);
        let buffer = client_buffer(64, 32);

        display.set_transformation(Transform::_90, area());
        assert!(!display.overlay(&[fullscreen(&buffer)]));

        display.set_transformation(Transform::Normal, area());
        assert!(display.overlay(&[fullscreen(&buffer)]));
    }

    #[test]
    fn prohibited_bypass() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output], BypassOption::Prohibited);
        let buffer = client_buffer(64, 32);

        assert!(!display.overlay(&[fullscreen(&buffer)]));
    }

    #[test]
    fn repeated_post_does_not_hang() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);
        let buffer = client_buffer(64, 32);

        assert!(display.overlay(&[fullscreen(&buffer)]));
        display.post();
        let visible = display.framebuffer(SlotState::Visible).cloned().unwrap();

        display.post();
        display.wait_for_page_flip();

        assert_eq!(output.flips.load(Ordering::SeqCst), 1);
        let still_visible = display.framebuffer(SlotState::Visible).unwrap();
        assert!(Arc::ptr_eq(&visible, still_visible));
    }

    #[test]
    fn forced_mode_set() {
        let output = MockOutput::new("DP-1", 60);
        let mut display = display_buffer(&[output.clone()], BypassOption::Allowed);

        display.schedule_set_crtc();
        assert_eq!(display.state(), PostingState::NeedsSetCrtc);

        let fb = output.create_dumb_framebuffer(area().size).unwrap();
        display.set_next_image(fb.clone());
        display.post();

        assert_eq!(output.flips.load(Ordering::SeqCst), 0);
        assert_eq!(output.set_crtcs.load(Ordering::SeqCst), 2);
        assert_eq!(display.state(), PostingState::Idle);
        assert!(Arc::ptr_eq(display.framebuffer(SlotState::Visible).unwrap(), &fb));

        // Without new content the visible framebuffer is mode-set again.
        display.schedule_set_crtc();
        display.post();
        assert_eq!(output.set_crtcs.load(Ordering::SeqCst), 3);
        assert!(Arc::ptr_eq(display.framebuffer(SlotState::Visible).unwrap(), &fb));
    }

    #[test]
    fn failed_mode_set_names_output() {
        let outputs = [MockOutput::new("DP-1", 60), MockOutput::new("DP-2", 60)];
        let mut display = display_buffer(&outputs, BypassOption::Allowed);
        outputs[0].fail_page_flip.store(true, Ordering::SeqCst);
        outputs[0].fail_set_crtc.store(true, Ordering::SeqCst);

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let fb = outputs[1].create_dumb_framebuffer(area().size).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            display.set_next_image(fb.clone());
            display.post();
        });

        // The frame is still posted on the working output.
        assert_eq!(outputs[1].set_crtcs.load(Ordering::SeqCst), 2);
        assert!(!outputs[1].flip_pending.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(display.framebuffer(SlotState::Visible).unwrap(), &fb));
        assert_eq!(display.state(), PostingState::Idle);

        let logs = logs.contents();
        assert!(logs.contains("Failed to set CRTC for output DP-1"), "{logs}");
        assert!(!logs.contains("DP-2"), "{logs}");
    }

    #[test]
    fn lost_flip_forces_mode_set() {
        let output = MockOutput::new("DP-1", 60);
        let outputs = [output.clone(), MockOutput::new("DP-2", 60)];
        let mut display = display_buffer(&outputs, BypassOption::Allowed);
        display.set_flip_timeout(Some(Duration::from_millis(1)));

        let fb = output.create_dumb_framebuffer(area().size).unwrap();
        display.set_next_image(fb);
        display.post();
        assert_eq!(display.state(), PostingState::FlipScheduled);

        output.lose_flips.store(true, Ordering::SeqCst);
        display.wait_for_page_flip();
        assert_eq!(display.state(), PostingState::NeedsSetCrtc);

        output.lose_flips.store(false, Ordering::SeqCst);
        output.flip_pending.store(false, Ordering::SeqCst);
        display.post();
        assert_eq!(display.state(), PostingState::Idle);
        assert_eq!(output.set_crtcs.load(Ordering::SeqCst), 2);
    }
}
