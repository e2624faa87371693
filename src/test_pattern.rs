//! Built-in animated client.

use std::time::Duration;

use smithay::backend::allocator::Fourcc;
use smithay::utils::{Physical, Point, Rectangle};
use tracing::warn;

use crate::buffer::{BufferId, BufferProperties, BufferUsage};
use crate::buffer_map::{BufferMap, BufferMapError, Owner};
use crate::scene::SurfaceId;

/// Delay between test pattern frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Frames before switching between fullscreen and inset placement.
const PHASE_FRAMES: u32 = 180;

/// Offset of the inset placement, which forces composition.
const INSET: i32 = 32;

/// Client drawing a moving gradient.
pub struct TestPattern {
    surface: SurfaceId,
    buffers: [BufferId; 2],
    area: Rectangle<i32, Physical>,
    frame: u32,
}

impl TestPattern {
    /// Create the pattern's buffers, covering `area`.
    pub fn new(
        buffer_map: &BufferMap,
        area: Rectangle<i32, Physical>,
    ) -> Result<Self, BufferMapError> {
        let size = (area.size.w, area.size.h);
        let properties = BufferProperties::new(size, Fourcc::Xrgb8888, BufferUsage::Software);
        let buffers = [buffer_map.add_buffer(&properties)?, buffer_map.add_buffer(&properties)?];

        // Buffers start out owned by the client.
        for id in buffers {
            buffer_map.send_buffer(id);
        }

        Ok(Self { buffers, area, surface: SurfaceId::new(), frame: 0 })
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Paint the next frame.
    ///
    /// Returns the painted buffer and its location, or `None` if no buffer is
    /// owned by the client.
    pub fn next_frame(
        &mut self,
        buffer_map: &BufferMap,
    ) -> Option<(BufferId, Point<i32, Physical>)> {
        let mut buffers = self.buffers.into_iter();
        let id = buffers.find(|id| buffer_map.owner(*id) == Some(Owner::Client))?;
        let buffer = buffer_map.get(id).ok()?;

        let frame = self.frame;
        let stride = buffer.stride() as usize;
        if let Err(err) = buffer.with_pixels_mut(|pixels| paint(pixels, stride, frame)) {
            warn!("Test pattern unable to draw: {err}");
            return None;
        }

        let location = if (frame / PHASE_FRAMES) % 2 == 0 {
            self.area.loc
        } else {
            self.area.loc + Point::from((INSET, INSET))
        };

        self.frame = self.frame.wrapping_add(1);

        Some((id, location))
    }
}

/// Draw an XRGB8888 gradient, scrolling with the frame number.
fn paint(pixels: &mut [u8], stride: usize, frame: u32) {
    let offset = frame as usize * 2;
    for (y, row) in pixels.chunks_exact_mut(stride).enumerate() {
        for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
            pixel.copy_from_slice(&[(x + offset) as u8, (y + offset) as u8, frame as u8, 0xff]);
        }
    }
}
