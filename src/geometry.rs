//! Extensions to Smithay's geometry module.

use std::cmp;

use smithay::utils::{Physical, Point, Rectangle, Size, Transform};

pub trait RectangleExt: Sized {
    /// Area shared by both rectangles.
    ///
    /// Returns `None` if the rectangles do not overlap.
    fn clip(&self, bounds: &Self) -> Option<Self>;
}

impl<K> RectangleExt for Rectangle<i32, K> {
    fn clip(&self, bounds: &Self) -> Option<Self> {
        let left = cmp::max(self.loc.x, bounds.loc.x);
        let top = cmp::max(self.loc.y, bounds.loc.y);
        let right = cmp::min(self.loc.x + self.size.w, bounds.loc.x + bounds.size.w);
        let bottom = cmp::min(self.loc.y + self.size.h, bounds.loc.y + bounds.size.h);

        if right <= left || bottom <= top {
            return None;
        }

        let loc = Point::from((left, top));
        let size = Size::from((right - left, bottom - top));
        Some(Rectangle::from_loc_and_size(loc, size))
    }
}

/// Position of a pixel after applying an output transform.
///
/// The `size` is the untransformed size of the logical output area.
pub fn transform_pixel(
    transform: Transform,
    size: Size<i32, Physical>,
    x: i32,
    y: i32,
) -> (i32, i32) {
    let (w, h) = (size.w, size.h);
    match transform {
        Transform::Normal => (x, y),
        Transform::_90 => (h - 1 - y, x),
        Transform::_180 => (w - 1 - x, h - 1 - y),
        Transform::_270 => (y, w - 1 - x),
        Transform::Flipped => (w - 1 - x, y),
        Transform::Flipped90 => (h - 1 - y, w - 1 - x),
        Transform::Flipped180 => (x, h - 1 - y),
        Transform::Flipped270 => (y, x),
    }
}

/// Logical size of an output with the given transform applied.
pub fn transformed_size(transform: Transform, size: Size<i32, Physical>) -> Size<i32, Physical> {
    match transform {
        Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270 => {
            (size.h, size.w).into()
        },
        _ => size,
    }
}
