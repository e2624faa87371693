//! CPU composition fallback.

use std::io;
use std::sync::Arc;

use smithay::backend::allocator::Fourcc;
use smithay::utils::{Physical, Rectangle, Size, Transform};
use tracing::{trace, warn};

use crate::buffer::Buffer;
use crate::display_buffer::DisplayElement;
use crate::geometry::{self, RectangleExt};
use crate::kms::{FbHandle, KmsOutput};
use crate::sync::SyncPoint;

/// Number of framebuffers per display.
pub const SWAPCHAIN_DEPTH: usize = 3;

/// Background color, as XRGB8888 bytes in memory order.
pub const CLEAR_COLOR: [u8; 4] = [0x1e, 0x1e, 0x1e, 0xff];

/// Rotating set of composition targets.
pub struct Swapchain {
    framebuffers: Vec<FbHandle>,
}

impl Swapchain {
    pub fn new(output: &dyn KmsOutput, size: Size<i32, Physical>) -> io::Result<Self> {
        let framebuffers = (0..SWAPCHAIN_DEPTH)
            .map(|_| output.create_dumb_framebuffer(size))
            .collect::<io::Result<_>>()?;
        Ok(Self { framebuffers })
    }

    /// Get a framebuffer which is not in use by the display.
    pub fn acquire(&self) -> Option<FbHandle> {
        self.framebuffers.iter().find(|fb| Arc::strong_count(fb) == 1).cloned()
    }
}

/// Pixel composition on the CPU.
#[derive(Default)]
pub struct SoftwareRenderer {
    frame: u64,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composite elements into a framebuffer covering `area`.
    ///
    /// The `area` is in logical output space, the target is rotated according
    /// to `transform`.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn render(
        &mut self,
        target: &FbHandle,
        area: Rectangle<i32, Physical>,
        transform: Transform,
        elements: &[DisplayElement],
    ) -> io::Result<()> {
        self.frame += 1;

        let width = target.size().w as usize;
        target.with_pixels(|pixels, pitch| {
            // Clear to background color.
            for row in pixels.chunks_exact_mut(pitch as usize) {
                for pixel in row[..width * 4].chunks_exact_mut(4) {
                    pixel.copy_from_slice(&CLEAR_COLOR);
                }
            }

            let mut canvas = Canvas { pixels, pitch: pitch as usize, area, transform };
            for element in elements {
                let binding = element.buffer.bind();
                draw_element(&mut canvas, element);
                binding.finish(SyncPoint::new(self.frame));
            }
        })
    }
}

/// Composition destination.
struct Canvas<'a> {
    pixels: &'a mut [u8],
    pitch: usize,
    area: Rectangle<i32, Physical>,
    transform: Transform,
}

impl Canvas<'_> {
    /// Framebuffer pixel at a position in output space.
    fn pixel_mut(&mut self, x: i32, y: i32) -> &mut [u8] {
        let (x, y) = (x - self.area.loc.x, y - self.area.loc.y);
        let (x, y) = geometry::transform_pixel(self.transform, self.area.size, x, y);
        let offset = y as usize * self.pitch + x as usize * 4;
        &mut self.pixels[offset..offset + 4]
    }
}

/// Scale a single element into the target.
fn draw_element(canvas: &mut Canvas<'_>, element: &DisplayElement) {
    let area = canvas.area;
    let screen = element.screen_position;
    let dst = match screen.clip(&area) {
        Some(dst) => dst,
        None => return,
    };

    let buffer = &element.buffer;
    let layout = match pixel_layout(buffer.format()) {
        Some(layout) => layout,
        None => {
            warn!("Skipping buffer {} with format {:?}", buffer.id(), buffer.format());
            return;
        },
    };

    let src = element.source_position;
    let scale_x = src.size.w / screen.size.w as f64;
    let scale_y = src.size.h / screen.size.h as f64;

    let drawn = buffer.with_pixels(|source| {
        let stride = buffer.stride() as usize;
        let size = buffer.size();

        for y in dst.loc.y..dst.loc.y + dst.size.h {
            let src_y = src.loc.y + (y - screen.loc.y) as f64 * scale_y + scale_y / 2.;
            let src_y = (src_y as i32).clamp(0, size.h - 1) as usize;

            for x in dst.loc.x..dst.loc.x + dst.size.w {
                let src_x = src.loc.x + (x - screen.loc.x) as f64 * scale_x + scale_x / 2.;
                let src_x = (src_x as i32).clamp(0, size.w - 1) as usize;

                let offset = src_y * stride + src_x * 4;
                let (bgr, alpha) = layout.read(&source[offset..offset + 4]);

                blend(canvas.pixel_mut(x, y), bgr, alpha);
            }
        }
    });

    if drawn.is_none() {
        trace!("Skipping buffer {} without CPU mapping", buffer.id());
    }
}

/// Premultiplied source-over blend into an XRGB8888 pixel.
fn blend(pixel: &mut [u8], bgr: [u8; 3], alpha: Option<u8>) {
    let alpha = match alpha {
        Some(alpha) => alpha as u32,
        None => {
            pixel[..3].copy_from_slice(&bgr);
            return;
        },
    };

    for (dst, src) in pixel[..3].iter_mut().zip(bgr) {
        let below = (*dst as u32 * (255 - alpha) + 127) / 255;
        *dst = (src as u32 + below).min(255) as u8;
    }
}

/// Byte order of supported 32-bit formats.
#[derive(Copy, Clone, Debug)]
struct PixelLayout {
    red: usize,
    blue: usize,
    alpha: bool,
}

impl PixelLayout {
    /// Extract color channels and alpha from a pixel.
    fn read(&self, pixel: &[u8]) -> ([u8; 3], Option<u8>) {
        let bgr = [pixel[self.blue], pixel[1], pixel[self.red]];
        (bgr, self.alpha.then_some(pixel[3]))
    }
}

fn pixel_layout(format: Fourcc) -> Option<PixelLayout> {
    match format {
        Fourcc::Argb8888 => Some(PixelLayout { red: 2, blue: 0, alpha: true }),
        Fourcc::Xrgb8888 => Some(PixelLayout { red: 2, blue: 0, alpha: false }),
        Fourcc::Abgr8888 => Some(PixelLayout { red: 0, blue: 2, alpha: true }),
        Fourcc::Xbgr8888 => Some(PixelLayout { red: 0, blue: 2, alpha: false }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::buffer::ConsumedCallback;
    use crate::kms::virtual_output::VirtualOutput;

    fn area() -> Rectangle<i32, Physical> {
        Rectangle::from_loc_and_size((0, 0), (4, 2))
    }

    fn solid_buffer(format: Fourcc, size: (i32, i32), pixel: [u8; 4]) -> Arc<Buffer> {
        let allocator = BufferAllocator::software();
        let buffer = allocator.alloc_software_buffer(size.into(), format).unwrap();
        buffer.with_pixels_mut(|pixels| {
            for chunk in pixels.chunks_exact_mut(4) {
                chunk.copy_from_slice(&pixel);
            }
        })
        .unwrap();
        Arc::new(buffer)
    }

    fn pixel_at(fb: &FbHandle, x: usize, y: usize) -> [u8; 4] {
        let mut result = [0; 4];
        fb.with_pixels(|pixels, pitch| {
            let offset = y * pitch as usize + x * 4;
            result.copy_from_slice(&pixels[offset..offset + 4]);
        })
        .unwrap();
        result
    }

    #[test]
    fn swapchain_skips_displayed_framebuffers() {
        let output = VirtualOutput::new("VIRTUAL-1", area().size, 60);
        let swapchain = Swapchain::new(&output, area().size).unwrap();

        let first = swapchain.acquire().unwrap();
        let second = swapchain.acquire().unwrap();
        assert_ne!(first.id(), second.id());

        // Acquired handles stay reserved until they are dropped.
        let first_id = first.id();
        let _first = first.clone();
        let _second = second;
        let third = swapchain.acquire().unwrap();
        assert_ne!(third.id(), first_id);

        let _third = third;
        assert!(swapchain.acquire().is_none());
    }

    #[test]
    fn clear_without_elements() {
        let output = VirtualOutput::new("VIRTUAL-1", area().size, 60);
        let fb = output.create_dumb_framebuffer(area().size).unwrap();

        SoftwareRenderer::new().render(&fb, area(), Transform::Normal, &[]).unwrap();
        assert_eq!(pixel_at(&fb, 3, 1), CLEAR_COLOR);
    }

    #[test]
    fn formats_and_clipping() {
        let output = VirtualOutput::new("VIRTUAL-1", area().size, 60);
        let fb = output.create_dumb_framebuffer(area().size).unwrap();

        // Opaque red in ABGR memory order, partially outside the output.
        let red = solid_buffer(Fourcc::Abgr8888, (2, 2), [0xff, 0, 0, 0xff]);
        let left = DisplayElement::new(red, Rectangle::from_loc_and_size((-1, 0), (2, 2)));

        // Premultiplied half-transparent black over the background.
        let shade = solid_buffer(Fourcc::Argb8888, (1, 1), [0, 0, 0, 0x80]);
        let right = DisplayElement::new(shade, Rectangle::from_loc_and_size((3, 0), (1, 2)));

        SoftwareRenderer::new().render(&fb, area(), Transform::Normal, &[left, right]).unwrap();

        assert_eq!(pixel_at(&fb, 0, 1)[..3], [0, 0, 0xff]);
        assert_eq!(pixel_at(&fb, 1, 0), CLEAR_COLOR);
        assert_eq!(pixel_at(&fb, 3, 1)[..3], [0x0f, 0x0f, 0x0f]);
    }

    #[test]
    fn scaled_source() {
        let output = VirtualOutput::new("VIRTUAL-1", area().size, 60);
        let fb = output.create_dumb_framebuffer(area().size).unwrap();

        // Left half blue, right half green.
        let buffer = solid_buffer(Fourcc::Xrgb8888, (2, 1), [0xff, 0, 0, 0]);
        buffer.with_pixels_mut(|pixels| pixels[4..8].copy_from_slice(&[0, 0xff, 0, 0])).unwrap();

        let element = DisplayElement::new(buffer, area());
        SoftwareRenderer::new().render(&fb, area(), Transform::Normal, &[element]).unwrap();

        assert_eq!(pixel_at(&fb, 1, 1)[..3], [0xff, 0, 0]);
        assert_eq!(pixel_at(&fb, 2, 0)[..3], [0, 0xff, 0]);
    }

    #[test]
    fn sampled_buffers_are_consumed() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let counter = consumed.clone();
        let on_consumed: ConsumedCallback = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let allocator = BufferAllocator::software();
        let buffer = allocator.alloc_software_buffer((4, 2).into(), Fourcc::Argb8888).unwrap();
        let buffer = Arc::new(buffer.with_callbacks(Some(on_consumed), None));

        let output = VirtualOutput::new("VIRTUAL-1", area().size, 60);
        let fb = output.create_dumb_framebuffer(area().size).unwrap();
        let element = DisplayElement::new(buffer.clone(), area());
        SoftwareRenderer::new().render(&fb, area(), Transform::Normal, &[element]).unwrap();

        assert_eq!(consumed.load(Ordering::SeqCst), 1);
        assert!(!buffer.sync().is_reserved());
    }

    #[test]
    fn rotated_output() {
        // Portrait panel showing a landscape area.
        let panel = Size::from((2, 4));
        let output = VirtualOutput::new("VIRTUAL-1", panel, 60);
        let fb = output.create_dumb_framebuffer(panel).unwrap();

        let red = solid_buffer(Fourcc::Xrgb8888, (1, 1), [0, 0, 0xff, 0]);
        let corner = DisplayElement::new(red, Rectangle::from_loc_and_size((0, 0), (1, 1)));
        SoftwareRenderer::new().render(&fb, area(), Transform::_90, &[corner]).unwrap();

        assert_eq!(pixel_at(&fb, 1, 0)[..3], [0, 0, 0xff]);
        assert_eq!(pixel_at(&fb, 0, 0), CLEAR_COLOR);
        assert_eq!(pixel_at(&fb, 0, 3), CLEAR_COLOR);
    }
}
