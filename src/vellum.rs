//! Vellum display server state.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use std::{env, io, process};

use smithay::reexports::calloop::signals::{Signal, Signals};
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{LoopHandle, RegistrationToken};
use smithay::utils::{Physical, Point, Rectangle, Size, Transform};
use tracing::{error, info, warn};
use vellum_ipc::{Orientation, DISPLAY_ENV};

use crate::allocator::BufferAllocator;
use crate::buffer::BufferId;
use crate::buffer_map::{BufferMap, BufferMapError, Owner};
use crate::config::{Config, INITIAL_FB_FILL};
use crate::display_buffer::{DisplayBuffer, DisplayElement};
use crate::geometry;
use crate::ipc_server::SubscriberSink;
use crate::kms::arena::SlotState;
use crate::kms::KmsOutput;
use crate::renderer::{SoftwareRenderer, Swapchain};
use crate::scene::{Scene, SurfaceId};
use crate::test_pattern::{self, TestPattern};
use crate::udev::Udev;

/// Device backend driving the outputs.
pub enum Backend {
    Udev(Udev),
    Headless,
}

/// Shared display server state.
pub struct Vellum {
    pub event_loop: LoopHandle<'static, Self>,
    pub subscribers: Arc<SubscriberSink>,
    pub buffer_map: Arc<BufferMap>,
    pub socket_name: String,
    pub terminated: bool,
    pub backend: Backend,
    pub scene: Scene,

    scheduled_redraw: Option<RegistrationToken>,
    test_pattern: Option<TestPattern>,
    pending_release: Vec<BufferId>,
    orientation: Orientation,
    screens: Vec<Screen>,
    config: Config,
    stalled: bool,
}

impl Vellum {
    /// Initialize the display server.
    pub fn new(
        event_loop: LoopHandle<'static, Self>,
        backend: Backend,
        allocator: Arc<BufferAllocator>,
        config: Config,
    ) -> Self {
        let subscribers = Arc::new(SubscriberSink::new());
        let buffer_map = Arc::new(BufferMap::new(subscribers.clone(), allocator));

        // Log and set the IPC socket name for children.
        let socket_name = process::id().to_string();
        env::set_var(DISPLAY_ENV, &socket_name);
        info!("IPC socket: {socket_name}");

        Self {
            event_loop,
            subscribers,
            buffer_map,
            socket_name,
            backend,
            config,
            scheduled_redraw: Default::default(),
            pending_release: Default::default(),
            test_pattern: Default::default(),
            orientation: Default::default(),
            terminated: Default::default(),
            screens: Default::default(),
            scene: Default::default(),
            stalled: true,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace all screens, usually after an output configuration change.
    pub fn set_screens(&mut self, screens: Vec<Screen>) {
        self.screens = screens;
        self.arrange();

        self.scene.damage();
        self.unstall();
    }

    pub fn screens(&self) -> &[Screen] {
        &self.screens
    }

    /// Handle everything necessary to draw a single frame.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn create_frame(&mut self) {
        // Clear rendering stall status.
        self.stalled = false;

        // Redraw only when there is damage present.
        if self.screens.is_empty() || !self.scene.take_dirty() {
            self.release_buffers();
            self.stalled = true;
            return;
        }

        let elements = self.scene.elements();
        let sleep = self.screens.iter_mut().map(|screen| screen.draw(&elements)).min();

        self.release_buffers();

        // Check for new content once the frame is on screen.
        self.schedule_redraw(sleep.unwrap_or_default());
    }

    /// Start rendering again if we're currently stalled.
    pub fn unstall(&mut self) {
        if self.stalled {
            self.create_frame();
        }
    }

    /// Request a redraw once `duration` has passed.
    pub fn schedule_redraw(&mut self, duration: Duration) {
        self.cancel_scheduled_redraw();

        let timer = Timer::from_duration(duration);
        let result = self.event_loop.insert_source(timer, |_, _, vellum| {
            vellum.scheduled_redraw = None;
            vellum.create_frame();
            TimeoutAction::Drop
        });

        match result {
            Ok(token) => self.scheduled_redraw = Some(token),
            Err(err) => error!("Failed to schedule redraw: {err}"),
        }
    }

    /// Cancel the pending redraw.
    pub fn cancel_scheduled_redraw(&mut self) {
        if let Some(token) = self.scheduled_redraw.take() {
            self.event_loop.remove(token);
        }
    }

    /// Display a client buffer on a surface.
    ///
    /// The buffer previously attached to the surface is handed back to the
    /// client once it is no longer on screen. Only buffers owned by the
    /// client can be submitted.
    pub fn submit(
        &mut self,
        surface: SurfaceId,
        id: BufferId,
        location: Point<i32, Physical>,
    ) -> Result<(), BufferMapError> {
        let buffer = self.buffer_map.get(id)?;
        if self.buffer_map.owner(id) != Some(Owner::Client) {
            return Err(BufferMapError::NotClientOwned(id));
        }
        self.buffer_map.receive_buffer(id);

        if let Some(previous) = self.scene.attach(surface, buffer, location) {
            if previous.id() != id {
                self.pending_release.push(previous.id());
            }
        }

        self.unstall();

        Ok(())
    }

    /// Force a synchronous mode-set on all outputs.
    pub fn schedule_set_crtc(&mut self) {
        for screen in &mut self.screens {
            screen.display_buffer.schedule_set_crtc();
        }

        self.scene.damage();
        self.unstall();
    }

    /// Update the orientation of all outputs.
    pub fn set_orientation(&mut self, orientation: Orientation) {
        if self.orientation == orientation {
            return;
        }

        info!(?orientation, "Changing output orientation");
        self.orientation = orientation;
        self.arrange();

        self.scene.damage();
        self.unstall();
    }

    /// Start the built-in test pattern client.
    pub fn start_test_pattern(&mut self) {
        let area = match self.screens.first() {
            Some(screen) => screen.display_buffer.view_area(),
            None => {
                warn!("Cannot start test pattern without outputs");
                return;
            },
        };

        match TestPattern::new(&self.buffer_map, area) {
            Ok(pattern) => self.test_pattern = Some(pattern),
            Err(err) => {
                error!("Could not create test pattern: {err}");
                return;
            },
        }

        let timer = Timer::immediate();
        let result = self.event_loop.insert_source(timer, |_, _, vellum| {
            vellum.update_test_pattern();
            TimeoutAction::ToDuration(test_pattern::FRAME_INTERVAL)
        });
        if let Err(err) = result {
            error!("Could not start test pattern: {err}");
        }
    }

    /// Submit the next test pattern frame.
    fn update_test_pattern(&mut self) {
        let pattern = match &mut self.test_pattern {
            Some(pattern) => pattern,
            None => return,
        };

        let surface = pattern.surface();
        if let Some((id, location)) = pattern.next_frame(&self.buffer_map) {
            if let Err(err) = self.submit(surface, id, location) {
                error!("Test pattern submit failed: {err}");
            }
        }
    }

    /// Lay screens out from left to right.
    fn arrange(&mut self) {
        let transform = self.orientation.transform();

        let mut x = 0;
        for screen in &mut self.screens {
            screen.place((x, 0).into(), transform);
            x += screen.display_buffer.view_area().size.w;
        }
    }

    /// Hand replaced buffers back to their client once they are off screen.
    fn release_buffers(&mut self) {
        let buffer_map = &self.buffer_map;
        let screens = &self.screens;
        self.pending_release.retain(|id| {
            let in_use = screens.iter().any(|screen| screen.scans_out(*id));
            if !in_use {
                buffer_map.send_buffer(*id);
            }
            in_use
        });
    }
}

/// Display buffer with its composition resources.
pub struct Screen {
    display_buffer: DisplayBuffer,
    renderer: SoftwareRenderer,
    swapchain: Swapchain,
    mode_size: Size<i32, Physical>,
}

impl Screen {
    /// Create a screen showing the same content on all `outputs`.
    pub fn new(
        outputs: Vec<Arc<dyn KmsOutput>>,
        mode_size: Size<i32, Physical>,
        config: &Config,
    ) -> io::Result<Self> {
        let primary = match outputs.first() {
            Some(output) => output.clone(),
            None => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "screen without outputs"))
            },
        };

        // Show a blank frame until the first composition.
        let initial_fb = primary.create_dumb_framebuffer(mode_size)?;
        initial_fb.fill(INITIAL_FB_FILL)?;

        let swapchain = Swapchain::new(primary.as_ref(), mode_size)?;

        let area = Rectangle::from_loc_and_size((0, 0), mode_size);
        let mut display_buffer =
            DisplayBuffer::new(outputs, area, Transform::Normal, initial_fb, config.bypass());
        display_buffer.set_flip_timeout(config.flip_timeout());

        Ok(Self { display_buffer, swapchain, mode_size, renderer: SoftwareRenderer::new() })
    }

    pub fn display_buffer(&self) -> &DisplayBuffer {
        &self.display_buffer
    }

    /// Draw and post a frame, returning the delay before the next one.
    fn draw(&mut self, elements: &[DisplayElement]) -> Duration {
        if !self.display_buffer.overlay(elements) {
            self.composite(elements);
        }

        self.display_buffer.post();

        self.display_buffer.recommended_sleep()
    }

    /// Render elements into the next swapchain image.
    fn composite(&mut self, elements: &[DisplayElement]) {
        let framebuffer = match self.swapchain.acquire() {
            Some(framebuffer) => framebuffer,
            None => {
                warn!("No free framebuffer, skipping composition");
                return;
            },
        };

        let area = self.display_buffer.view_area();
        let transform = self.display_buffer.transformation();
        match self.renderer.render(&framebuffer, area, transform, elements) {
            Ok(()) => self.display_buffer.set_next_image(framebuffer),
            Err(err) => error!("Composition failed: {err}"),
        }
    }

    /// Move the screen in output space.
    fn place(&mut self, origin: Point<i32, Physical>, transform: Transform) {
        let size = geometry::transformed_size(transform, self.mode_size);
        let area = Rectangle::from_loc_and_size(origin, size);
        self.display_buffer.set_transformation(transform, area);
    }

    /// Check if a client buffer is on screen or about to be.
    fn scans_out(&self, id: BufferId) -> bool {
        [SlotState::Scheduled, SlotState::Visible].into_iter().any(|state| {
            let framebuffer = self.display_buffer.framebuffer(state);
            let buffer = framebuffer.and_then(|framebuffer| framebuffer.client_buffer());
            buffer.map_or(false, |buffer| buffer.id() == id)
        })
    }
}

/// Terminate the event loop on SIGINT and SIGTERM.
pub fn handle_signals(event_loop: &LoopHandle<'static, Vellum>) -> Result<(), Box<dyn Error>> {
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    event_loop.insert_source(signals, |event, _, vellum| {
        info!("Received {:?}, shutting down", event.signal());
        vellum.terminated = true;
    })?;
    Ok(())
}
