//! IPC socket server.

use std::error::Error;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::{Interest, LoopHandle, Mode as TriggerMode, PostAction};
use tracing::{debug, error, warn};
use vellum_ipc::{self, BufferEvent, IpcMessage};

use crate::buffer::Buffer;
use crate::buffer_map::BufferSink;
use crate::vellum::Vellum;

/// Maximum time a subscriber may block buffer announcements.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Create an IPC socket.
pub fn spawn_ipc_socket(
    event_loop: &LoopHandle<'static, Vellum>,
    socket_name: &str,
) -> Result<PathBuf, Box<dyn Error>> {
    let socket_path = vellum_ipc::socket_path(socket_name);

    // Try to delete the socket if it exists already.
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    // Spawn unix socket event source.
    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;
    let source = Generic::new(listener, Interest::READ, TriggerMode::Level);

    // Add source to calloop loop.
    let mut message_buffer = String::new();
    event_loop.insert_source(source, move |_, listener, vellum| {
        loop {
            match listener.accept() {
                Ok((stream, _)) => handle_message(&mut message_buffer, stream, vellum),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("IPC socket accept failed: {err}");
                    break;
                },
            }
        }
        Ok(PostAction::Continue)
    })?;

    Ok(socket_path)
}

/// Handle IPC socket messages.
fn handle_message(buffer: &mut String, stream: UnixStream, vellum: &mut Vellum) {
    buffer.clear();

    // Accepted sockets inherit the listener's non-blocking mode.
    if let Err(err) = stream.set_nonblocking(false) {
        warn!("ignoring ipc connection: {err}");
        return;
    }

    // Read new content to buffer.
    let mut reader = BufReader::new(stream);
    if let Ok(0) | Err(_) = reader.read_line(buffer) {
        return;
    }

    // Read pending events on socket.
    let message: IpcMessage = match serde_json::from_str(buffer) {
        Ok(message) => message,
        Err(err) => {
            warn!("ignoring invalid ipc message: {err}");
            return;
        },
    };

    // Handle IPC events.
    let mut stream = reader.into_inner();
    match message {
        IpcMessage::SetCrtc => vellum.schedule_set_crtc(),
        IpcMessage::Orientation { orientation } => vellum.set_orientation(orientation),
        IpcMessage::Stats => {
            let buffers = vellum.buffer_map.len();
            let client_owned = vellum.buffer_map.client_owned_buffer_count();
            let reply = IpcMessage::StatsReply { buffers, client_owned };
            crate::trace_error(send_reply(&mut stream, &reply));
        },
        IpcMessage::Subscribe => {
            if let Err(err) = stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)) {
                warn!("ignoring buffer subscriber: {err}");
                return;
            }
            vellum.subscribers.subscribe(stream);
        },
        IpcMessage::StatsReply { .. } => warn!("ignoring invalid ipc message: unexpected reply"),
    }
}

/// Write a message as a single JSON line.
fn send_reply(stream: &mut UnixStream, message: &IpcMessage) -> Result<(), Box<dyn Error>> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    stream.write_all(json.as_bytes())?;
    Ok(())
}

/// Buffer announcements for IPC subscribers.
///
/// Subscribers which fail to receive an announcement are dropped.
#[derive(Default)]
pub struct SubscriberSink {
    subscribers: Mutex<Vec<Box<dyn Write + Send>>>,
}

impl SubscriberSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start sending announcements to a new subscriber.
    pub fn subscribe(&self, subscriber: impl Write + Send + 'static) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.push(Box::new(subscriber));
    }

    /// Number of connected subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn broadcast(&self, event: BufferEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subscribers.is_empty() {
            return;
        }

        let mut json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                error!("Could not serialize buffer event: {err}");
                return;
            },
        };
        json.push('\n');

        subscribers.retain_mut(|subscriber| {
            match subscriber.write_all(json.as_bytes()).and_then(|_| subscriber.flush()) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Dropping buffer subscriber: {err}");
                    false
                },
            }
        });
    }
}

impl BufferSink for SubscriberSink {
    fn add_buffer(&self, buffer: &Buffer) {
        let size = buffer.size();
        self.broadcast(BufferEvent::Add {
            id: buffer.id().as_u32(),
            width: size.w as u32,
            height: size.h as u32,
            format: buffer.format() as u32,
            stride: buffer.stride(),
        });
    }

    fn remove_buffer(&self, buffer: &Buffer) {
        self.broadcast(BufferEvent::Remove { id: buffer.id().as_u32() });
    }

    fn update_buffer(&self, buffer: &Buffer) {
        self.broadcast(BufferEvent::Update { id: buffer.id().as_u32() });
    }
}
