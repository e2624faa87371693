//! Buffer ownership tracking.
//!
//! Every buffer shared with a client is either owned by the server, which may
//! sample or scan it out, or by the client, which may draw into it. The map is
//! accessed from both the IPC handler and the compositor, so all state lives
//! behind a single lock which is never held while notifying the sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

use crate::allocator::{AllocError, BufferAllocator};
use crate::buffer::{Buffer, BufferId, BufferProperties};

/// Receiver for buffer lifecycle announcements.
pub trait BufferSink: Send + Sync {
    /// A new buffer was created.
    fn add_buffer(&self, buffer: &Buffer);

    /// A buffer was destroyed.
    fn remove_buffer(&self, buffer: &Buffer);

    /// A buffer was handed to the client.
    fn update_buffer(&self, buffer: &Buffer);
}

/// Party allowed to access a buffer.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Owner {
    Server,
    Client,
}

/// Buffer ownership errors.
#[derive(Error, Debug)]
pub enum BufferMapError {
    #[error("cannot find buffer by id {0}")]
    NotFound(BufferId),
    #[error("buffer {0} is not owned by the client")]
    NotClientOwned(BufferId),
    #[error(transparent)]
    Allocation(#[from] AllocError),
}

struct Entry {
    buffer: Arc<Buffer>,
    owner: Owner,
}

/// Registry of client-visible buffers.
pub struct BufferMap {
    sink: Arc<dyn BufferSink>,
    allocator: Arc<BufferAllocator>,
    buffers: Mutex<HashMap<BufferId, Entry>>,
}

impl BufferMap {
    pub fn new(sink: Arc<dyn BufferSink>, allocator: Arc<BufferAllocator>) -> Self {
        Self { sink, allocator, buffers: Default::default() }
    }

    /// Allocate and register a new server-owned buffer.
    pub fn add_buffer(&self, properties: &BufferProperties) -> Result<BufferId, BufferMapError> {
        let buffer = self.allocator.alloc_buffer(properties)?;
        let id = buffer.id();

        self.lock().insert(id, Entry { buffer: buffer.clone(), owner: Owner::Server });
        debug!(%id, size = ?buffer.size(), format = ?buffer.format(), "Added buffer");

        self.sink.add_buffer(&buffer);

        Ok(id)
    }

    /// Retract a buffer.
    ///
    /// Callers must ensure the buffer is no longer scanned out.
    pub fn remove_buffer(&self, id: BufferId) -> Result<(), BufferMapError> {
        let entry = self.lock().remove(&id).ok_or(BufferMapError::NotFound(id))?;
        debug!(%id, "Removed buffer");

        self.sink.remove_buffer(&entry.buffer);

        Ok(())
    }

    /// Hand a buffer to its client.
    ///
    /// Unknown buffers are ignored, since they might have been removed already.
    pub fn send_buffer(&self, id: BufferId) {
        let buffer = {
            let mut buffers = self.lock();
            match buffers.get_mut(&id) {
                Some(entry) => {
                    entry.owner = Owner::Client;
                    entry.buffer.clone()
                },
                None => {
                    trace!(%id, "Ignoring send of unknown buffer");
                    return;
                },
            }
        };

        self.sink.update_buffer(&buffer);
    }

    /// Take a buffer back from its client.
    pub fn receive_buffer(&self, id: BufferId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.owner = Owner::Server;
        }
    }

    /// Look up a buffer by a client-supplied ID.
    pub fn get(&self, id: BufferId) -> Result<Arc<Buffer>, BufferMapError> {
        self.lock().get(&id).map(|entry| entry.buffer.clone()).ok_or(BufferMapError::NotFound(id))
    }

    /// Current owner of a buffer.
    pub fn owner(&self, id: BufferId) -> Option<Owner> {
        self.lock().get(&id).map(|entry| entry.owner)
    }

    /// Number of buffers currently owned by clients.
    pub fn client_owned_buffer_count(&self) -> usize {
        self.lock().values().filter(|entry| entry.owner == Owner::Client).count()
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BufferId, Entry>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
