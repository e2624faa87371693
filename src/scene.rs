//! Surface stacking.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use smithay::utils::{Physical, Point, Rectangle};

use crate::buffer::Buffer;
use crate::display_buffer::DisplayElement;

/// Unique surface identifier.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct SurfaceId(u32);

impl SurfaceId {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer attached to a surface.
#[derive(Debug)]
struct SurfaceState {
    buffer: Arc<Buffer>,
    location: Point<i32, Physical>,
}

/// Surfaces in stacking order, from bottom to top.
#[derive(Default, Debug)]
pub struct Scene {
    surfaces: IndexMap<SurfaceId, SurfaceState>,
    dirty: bool,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new buffer to a surface.
    ///
    /// New surfaces are placed on top of the stack. The previously attached
    /// buffer is returned, so it can be handed back to its client.
    pub fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Arc<Buffer>,
        location: Point<i32, Physical>,
    ) -> Option<Arc<Buffer>> {
        self.dirty = true;

        let state = SurfaceState { buffer, location };
        self.surfaces.insert(surface, state).map(|previous| previous.buffer)
    }

    /// Remove a surface, returning its buffer.
    pub fn remove(&mut self, surface: SurfaceId) -> Option<Arc<Buffer>> {
        let state = self.surfaces.shift_remove(&surface)?;
        self.dirty = true;
        Some(state.buffer)
    }

    /// Move a surface to the top of the stack.
    pub fn raise(&mut self, surface: SurfaceId) {
        if let Some(index) = self.surfaces.get_index_of(&surface) {
            let last = self.surfaces.len() - 1;
            self.surfaces.move_index(index, last);
            self.dirty = true;
        }
    }

    /// Display elements for all surfaces, from bottom to top.
    pub fn elements(&self) -> Vec<DisplayElement> {
        self.surfaces
            .values()
            .map(|state| {
                let size = state.buffer.size();
                let rect = Rectangle::from_loc_and_size(state.location, (size.w, size.h));
                DisplayElement::new(state.buffer.clone(), rect)
            })
            .collect()
    }

    /// Check for changes since the last call, clearing the change flag.
    pub fn take_dirty(&mut self) -> bool {
        mem::take(&mut self.dirty)
    }

    /// Mark the scene as changed.
    pub fn damage(&mut self) {
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

#[cfg(test)]
mod test {
    use smithay::backend::allocator::Fourcc;

    use super::*;
    use crate::allocator::BufferAllocator;

    fn buffer(width: i32, height: i32) -> Arc<Buffer> {
        let allocator = BufferAllocator::software();
        Arc::new(allocator.alloc_software_buffer((width, height).into(), Fourcc::Argb8888).unwrap())
    }

    #[test]
    fn attach_returns_previous() {
        let mut scene = Scene::new();
        let surface = SurfaceId::new();

        let first = buffer(4, 4);
        assert!(scene.attach(surface, first.clone(), (0, 0).into()).is_none());

        let second = buffer(4, 4);
        let previous = scene.attach(surface, second.clone(), (0, 0).into()).unwrap();
        assert_eq!(previous.id(), first.id());
        assert_eq!(scene.len(), 1);

        let removed = scene.remove(surface).unwrap();
        assert_eq!(removed.id(), second.id());
        assert!(scene.is_empty());
    }

    #[test]
    fn stacking_order() {
        let mut scene = Scene::new();
        let bottom = SurfaceId::new();
        let top = SurfaceId::new();

        let background = buffer(8, 8);
        let cursor = buffer(2, 2);
        scene.attach(bottom, background.clone(), (0, 0).into());
        scene.attach(top, cursor.clone(), (3, 5).into());

        let elements = scene.elements();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].buffer.id(), background.id());
        assert_eq!(elements[1].buffer.id(), cursor.id());
        assert_eq!(elements[1].screen_position, Rectangle::from_loc_and_size((3, 5), (2, 2)));

        // Reattaching keeps the stacking position.
        scene.attach(bottom, buffer(8, 8), (0, 0).into());
        assert_eq!(scene.elements()[1].buffer.id(), cursor.id());

        scene.raise(bottom);
        assert_eq!(scene.elements()[0].buffer.id(), cursor.id());
    }

    #[test]
    fn dirty_tracking() {
        let mut scene = Scene::new();
        assert!(!scene.take_dirty());

        scene.attach(SurfaceId::new(), buffer(1, 1), (0, 0).into());
        assert!(scene.take_dirty());
        assert!(!scene.take_dirty());

        // Unknown surfaces do not change anything.
        assert!(scene.remove(SurfaceId::new()).is_none());
        assert!(!scene.take_dirty());
    }
}
