//! Framebuffer slots of a display buffer.
//!
//! A display holds at most one framebuffer waiting for submission, one
//! submitted to the kernel, and one currently on screen. Each is tracked as a
//! slot with an explicit state, so the transitions between them are checked in
//! one place.

use crate::kms::FbHandle;

/// Index of a framebuffer slot.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct SlotId(usize);

/// Lifecycle stage of a framebuffer.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum SlotState {
    /// Waiting for the next post.
    Staged,
    /// Submitted to the kernel, waiting for vblank.
    Scheduled,
    /// Currently scanned out.
    Visible,
}

struct Slot {
    framebuffer: FbHandle,
    state: SlotState,
}

/// Fixed set of framebuffer slots.
#[derive(Default)]
pub struct FramebufferArena {
    slots: Vec<Option<Slot>>,
}

impl FramebufferArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a framebuffer for the next post.
    ///
    /// Replaces any framebuffer staged previously.
    pub fn stage(&mut self, framebuffer: FbHandle) -> SlotId {
        if let Some(id) = self.find(SlotState::Staged) {
            self.slots[id.0] = None;
        }

        self.insert(Slot { framebuffer, state: SlotState::Staged })
    }

    /// Mark the staged framebuffer as submitted to the kernel.
    ///
    /// # Panics
    ///
    /// Panics if a flip is already scheduled, since a display can only have a
    /// single outstanding flip.
    pub fn schedule(&mut self) -> Option<SlotId> {
        if self.find(SlotState::Scheduled).is_some() {
            panic!("framebuffer scheduled while previous page flip is still pending");
        }

        let id = self.find(SlotState::Staged)?;
        self.transition(id, SlotState::Scheduled);
        Some(id)
    }

    /// Move the scheduled framebuffer on screen after its flip completed.
    pub fn complete(&mut self) -> Option<SlotId> {
        let id = self.find(SlotState::Scheduled)?;
        self.transition(id, SlotState::Visible);
        Some(id)
    }

    /// Move the staged framebuffer on screen after a synchronous mode-set.
    pub fn present(&mut self) -> Option<SlotId> {
        let id = self.find(SlotState::Staged)?;
        self.transition(id, SlotState::Visible);
        Some(id)
    }

    /// Discard the staged framebuffer.
    pub fn unstage(&mut self) {
        if let Some(id) = self.find(SlotState::Staged) {
            self.slots[id.0] = None;
        }
    }

    /// Framebuffer in the requested state.
    pub fn get(&self, state: SlotState) -> Option<&FbHandle> {
        self.find(state).and_then(|id| self.slot(id)).map(|slot| &slot.framebuffer)
    }

    /// Current state of a slot.
    ///
    /// Returns `None` once the slot was freed.
    pub fn state(&self, id: SlotId) -> Option<SlotState> {
        self.slot(id).map(|slot| slot.state)
    }

    /// Change a slot's state, freeing the slot previously in that state.
    fn transition(&mut self, id: SlotId, state: SlotState) {
        if let Some(previous) = self.find(state) {
            self.slots[previous.0] = None;
        }

        match self.slots.get_mut(id.0) {
            Some(Some(slot)) => slot.state = state,
            _ => panic!("invalid framebuffer slot {id:?}"),
        }
    }

    fn insert(&mut self, slot: Slot) -> SlotId {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(slot);
                SlotId(index)
            },
            None => {
                self.slots.push(Some(slot));
                SlotId(self.slots.len() - 1)
            },
        }
    }

    fn find(&self, state: SlotState) -> Option<SlotId> {
        let index = self.slots.iter().position(|slot| {
            slot.as_ref().map_or(false, |slot| slot.state == state)
        })?;
        Some(SlotId(index))
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use smithay::backend::allocator::Fourcc;

    use super::*;
    use crate::kms::{Framebuffer, FramebufferContent, MemoryStorage, PixelStorage};

    fn framebuffer(id: u32) -> FbHandle {
        let storage: Box<dyn PixelStorage> = Box::new(MemoryStorage::new((1, 1).into()));
        let content = FramebufferContent::Dumb(Mutex::new(storage));
        Arc::new(Framebuffer::new(id, (1, 1).into(), Fourcc::Xrgb8888, content))
    }

    #[test]
    fn flip_lifecycle() {
        let mut arena = FramebufferArena::new();

        let first = arena.stage(framebuffer(1));
        arena.present();
        assert_eq!(arena.state(first), Some(SlotState::Visible));

        let second = arena.stage(framebuffer(2));
        assert_eq!(arena.schedule(), Some(second));
        assert_eq!(arena.get(SlotState::Visible).map(|fb| fb.id()), Some(1));

        arena.complete();
        assert_eq!(arena.state(first), None);
        assert_eq!(arena.state(second), Some(SlotState::Visible));
        assert!(arena.get(SlotState::Scheduled).is_none());
    }

    #[test]
    fn restaging_replaces_framebuffer() {
        let mut arena = FramebufferArena::new();
        let fb = framebuffer(1);

        arena.stage(fb.clone());
        arena.stage(framebuffer(2));

        assert_eq!(Arc::strong_count(&fb), 1);
        assert_eq!(arena.get(SlotState::Staged).map(|fb| fb.id()), Some(2));
    }

    #[test]
    fn nothing_staged() {
        let mut arena = FramebufferArena::new();
        assert_eq!(arena.schedule(), None);
        assert_eq!(arena.complete(), None);
        assert_eq!(arena.present(), None);
    }

    #[test]
    #[should_panic]
    fn double_schedule_panics() {
        let mut arena = FramebufferArena::new();
        arena.stage(framebuffer(1));
        arena.schedule();

        arena.stage(framebuffer(2));
        arena.schedule();
    }
}
