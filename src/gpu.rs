//! GPU execution context.
//!
//! GL state is bound to one thread at a time. Instead of pairing
//! make-current and release-current calls manually, the context is owned by a
//! [`GpuExecutor`] and lent out through scoped guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use smithay::backend::egl::context::EGLContext;
use thiserror::Error;
use tracing::error;

use crate::sync::SyncPoint;

/// Errors while binding the GPU context.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("could not make GPU context current: {0}")]
    MakeCurrent(String),
}

/// Context which can be bound to the calling thread.
pub trait GpuContext: Send {
    /// Bind the context to the current thread.
    fn make_current(&mut self) -> Result<(), ContextError>;

    /// Unbind the context from the current thread.
    fn release_current(&mut self);
}

/// EGL rendering context.
pub struct EglGpuContext {
    context: EGLContext,
}

impl EglGpuContext {
    pub fn new(context: EGLContext) -> Self {
        Self { context }
    }
}

impl GpuContext for EglGpuContext {
    fn make_current(&mut self) -> Result<(), ContextError> {
        unsafe { self.context.make_current() }
            .map_err(|err| ContextError::MakeCurrent(err.to_string()))
    }

    fn release_current(&mut self) {
        if let Err(err) = unsafe { self.context.unbind() } {
            error!("Failed to release EGL context: {err}");
        }
    }
}

/// Context without any GPU state, used without hardware acceleration.
#[derive(Default, Debug)]
pub struct HeadlessGpuContext {
    current: bool,
}

impl GpuContext for HeadlessGpuContext {
    fn make_current(&mut self) -> Result<(), ContextError> {
        self.current = true;
        Ok(())
    }

    fn release_current(&mut self) {
        self.current = false;
    }
}

/// Exclusive owner of the GPU context.
pub struct GpuExecutor {
    context: Mutex<Box<dyn GpuContext>>,
    fences: AtomicU64,
}

impl GpuExecutor {
    pub fn new(context: impl GpuContext + 'static) -> Self {
        Self { context: Mutex::new(Box::new(context)), fences: AtomicU64::new(0) }
    }

    /// Bind the context to this thread until the guard is dropped.
    ///
    /// Blocks while another thread holds the context.
    pub fn acquire(&self) -> Result<ContextGuard<'_>, ContextError> {
        let mut context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        context.make_current()?;
        Ok(ContextGuard { context })
    }

    /// Mark the end of the GPU work submitted so far.
    pub fn insert_fence(&self) -> SyncPoint {
        SyncPoint::new(self.fences.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Scoped binding of the GPU context.
pub struct ContextGuard<'a> {
    context: MutexGuard<'a, Box<dyn GpuContext>>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.context.release_current();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    /// Context recording its binding state.
    struct RecordingContext {
        events: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl GpuContext for RecordingContext {
        fn make_current(&mut self) -> Result<(), ContextError> {
            self.events.lock().unwrap().push("make_current");
            if self.fail {
                return Err(ContextError::MakeCurrent("lost".into()));
            }
            Ok(())
        }

        fn release_current(&mut self) {
            self.events.lock().unwrap().push("release_current");
        }
    }

    fn failing_work(executor: &GpuExecutor) -> Result<(), Box<dyn std::error::Error>> {
        let _guard = executor.acquire()?;
        Err("import failed".into())
    }

    #[test]
    fn released_on_error_path() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let executor = GpuExecutor::new(RecordingContext { events: events.clone(), fail: false });

        assert!(failing_work(&executor).is_err());
        assert_eq!(*events.lock().unwrap(), ["make_current", "release_current"]);
    }

    #[test]
    fn failed_bind_is_not_released() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let executor = GpuExecutor::new(RecordingContext { events: events.clone(), fail: true });

        assert!(executor.acquire().is_err());
        assert_eq!(*events.lock().unwrap(), ["make_current"]);
    }

    #[test]
    fn fences_are_ordered() {
        let executor = GpuExecutor::new(HeadlessGpuContext::default());
        let first = executor.insert_fence();
        let second = executor.insert_fence();
        assert!(second.sequence() > first.sequence());
    }
}
