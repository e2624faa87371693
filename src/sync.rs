//! Consumer fences for buffers sampled by the compositor.
//!
//! A fence slot is reserved when sampling of a buffer starts, and fulfilled
//! with a sync point once the read has been submitted. Reservation and
//! fulfilment are separate calls which are allowed to happen on different
//! threads; a producer latching new content waits for outstanding
//! reservations before taking the last fence.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Opaque handle of a GPU fence.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct SyncPoint(u64);

impl SyncPoint {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Default, Debug)]
struct SyncState {
    reserved: bool,
    fence: Option<SyncPoint>,
}

/// Single in-flight consumer fence.
#[derive(Default, Debug)]
pub struct ConsumerSync {
    state: Mutex<SyncState>,
    released: Condvar,
}

impl ConsumerSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the fence slot, blocking while another reservation is active.
    pub fn reserve(&self) {
        let mut state = self.wait_unreserved();
        state.reserved = true;
    }

    /// Fulfil the active reservation.
    ///
    /// Returns the fence which was replaced, since nobody waited on it.
    pub fn set(&self, sync_point: SyncPoint) -> Option<SyncPoint> {
        let mut state = self.lock();
        let replaced = state.fence.replace(sync_point);
        state.reserved = false;
        drop(state);

        self.released.notify_all();

        replaced
    }

    /// Drop the active reservation without providing a fence.
    pub fn cancel(&self) {
        self.lock().reserved = false;
        self.released.notify_all();
    }

    /// Take the latest fence once no reservation is active.
    pub fn take(&self) -> Option<SyncPoint> {
        self.wait_unreserved().fence.take()
    }

    pub fn is_reserved(&self) -> bool {
        self.lock().reserved
    }

    fn wait_unreserved(&self) -> MutexGuard<'_, SyncState> {
        let state = self.lock();
        self.released
            .wait_while(state, |state| state.reserved)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn set_replaces_previous_fence() {
        let sync = ConsumerSync::new();

        sync.reserve();
        assert_eq!(sync.set(SyncPoint::new(1)), None);

        sync.reserve();
        assert_eq!(sync.set(SyncPoint::new(2)), Some(SyncPoint::new(1)));

        assert_eq!(sync.take(), Some(SyncPoint::new(2)));
        assert_eq!(sync.take(), None);
    }

    #[test]
    fn reservation_fulfilled_on_other_thread() {
        let sync = Arc::new(ConsumerSync::new());
        sync.reserve();

        // Taking the fence must wait for the render thread's fulfilment.
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || {
                let fence = sync.take();
                tx.send(fence).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let consumer = {
            let sync = sync.clone();
            thread::spawn(move || sync.set(SyncPoint::new(9)))
        };
        consumer.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(SyncPoint::new(9)));
        waiter.join().unwrap();
    }

    #[test]
    fn cancel_releases_reservation() {
        let sync = ConsumerSync::new();
        sync.reserve();
        assert!(sync.is_reserved());

        sync.cancel();
        assert!(!sync.is_reserved());
        assert_eq!(sync.take(), None);
    }
}
