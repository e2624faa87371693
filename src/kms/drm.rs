//! Kernel DRM outputs.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::hash::Hash;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use smithay::backend::allocator::{Buffer as _, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::{Buffer as _, DrmModifier, Handle as GemHandle, PlanarBuffer};
use smithay::reexports::drm::control::connector::State as ConnectorState;
use smithay::reexports::drm::control::dumbbuffer::DumbBuffer;
use smithay::reexports::drm::control::{
    self, connector, crtc, framebuffer, Device as ControlDevice, Event, FbCmd2Flags, Mode,
    PageFlipFlags,
};
use smithay::utils::{Physical, Size};
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferId};
use crate::kms::{FbHandle, FlipTimeout, Framebuffer, FramebufferContent, KmsOutput, PixelStorage};

/// Maximum time a mode-set waits for a pending flip to complete.
const FLIP_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// DRM device shared by all its outputs.
pub struct DrmCard {
    fd: DrmDeviceFd,

    // Flip events which have not been consumed by their output yet.
    flips: Mutex<FlipTracker<crtc::Handle>>,
}

impl DrmCard {
    pub fn new(fd: DrmDeviceFd) -> Arc<Self> {
        Arc::new(Self { fd, flips: Default::default() })
    }

    pub fn fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    /// Create an output for every connected connector.
    pub fn outputs(self: &Arc<Self>) -> Result<Vec<DrmOutput>, Box<dyn Error>> {
        let resources = self.fd.resource_handles()?;
        let mut used_crtcs = HashSet::new();
        let mut outputs = Vec::new();

        for handle in resources.connectors() {
            let connector = match self.fd.get_connector(*handle, true) {
                Ok(connector) if connector.state() == ConnectorState::Connected => connector,
                _ => continue,
            };

            // Use the preferred mode.
            let mode = match connector.modes().first() {
                Some(mode) => *mode,
                None => continue,
            };

            let crtc = connector
                // Get all available encoders.
                .encoders()
                .iter()
                .flat_map(|handle| self.fd.get_encoder(*handle))
                // Get all CRTCs compatible with the encoder.
                .flat_map(|encoder| resources.filter_crtcs(encoder.possible_crtcs()))
                .find(|crtc| !used_crtcs.contains(crtc));
            let crtc = match crtc {
                Some(crtc) => crtc,
                None => {
                    debug!("No free CRTC for connector {:?}", connector.interface());
                    continue;
                },
            };
            used_crtcs.insert(crtc);

            let name = format!("{:?}-{}", connector.interface(), connector.interface_id());
            let (width, height) = mode.size();
            info!("Found output {name}: {width}x{height}@{}Hz", mode.vrefresh());

            outputs.push(DrmOutput {
                crtc,
                mode,
                name,
                card: self.clone(),
                connector: connector.handle(),
                flip_pending: AtomicBool::new(false),
                imports: Default::default(),
            });
        }

        Ok(outputs)
    }

    /// Block until the page flip of `crtc` completed.
    ///
    /// Returns `false` if the deadline passed first.
    fn wait_for_flip(&self, crtc: crtc::Handle, deadline: Option<Instant>) -> io::Result<bool> {
        let mut flips = self.lock_flips();

        loop {
            if flips.take(crtc) {
                return Ok(true);
            }

            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => {
                        remaining.as_millis().clamp(1, i32::MAX as u128) as i32
                    },
                    _ => return Ok(false),
                },
                None => -1,
            };

            let mut poll_fd = libc::pollfd {
                fd: self.fd.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            match unsafe { libc::poll(&mut poll_fd, 1, timeout) } {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                },
                0 => (),
                _ => self.dispatch_events(&mut flips)?,
            }
        }
    }

    /// Stop waiting for the pending flip of `crtc`.
    ///
    /// Its event will be discarded once it arrives, so it cannot complete a
    /// later flip.
    fn abandon_flip(&self, crtc: crtc::Handle) {
        self.lock_flips().abandon(crtc);
    }

    /// Read pending DRM events.
    fn dispatch_events(&self, flips: &mut FlipTracker<crtc::Handle>) -> io::Result<()> {
        for event in self.fd.receive_events()? {
            if let Event::PageFlip(event) = event {
                flips.complete(event.crtc);
            }
        }
        Ok(())
    }

    fn lock_flips(&self) -> MutexGuard<'_, FlipTracker<crtc::Handle>> {
        self.flips.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Page flip events of all CRTCs on a device.
#[derive(Debug)]
struct FlipTracker<K> {
    completed: HashSet<K>,
    // Number of events still expected for flips nobody waits on anymore.
    abandoned: HashMap<K, u32>,
}

impl<K> Default for FlipTracker<K> {
    fn default() -> Self {
        Self { completed: HashSet::new(), abandoned: HashMap::new() }
    }
}

impl<K: Eq + Hash + Copy> FlipTracker<K> {
    /// Record a flip event.
    fn complete(&mut self, crtc: K) {
        match self.abandoned.get_mut(&crtc) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.abandoned.remove(&crtc);
                }
            },
            None => {
                self.completed.insert(crtc);
            },
        }
    }

    /// Consume the completion of the current flip.
    fn take(&mut self, crtc: K) -> bool {
        self.completed.remove(&crtc)
    }

    /// Forget the current flip, discarding its event if it is still pending.
    fn abandon(&mut self, crtc: K) {
        if !self.completed.remove(&crtc) {
            *self.abandoned.entry(crtc).or_default() += 1;
        }
    }
}

/// Connector driven by a CRTC.
pub struct DrmOutput {
    name: String,
    card: Arc<DrmCard>,
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: Mode,
    flip_pending: AtomicBool,
    imports: Mutex<HashMap<BufferId, Weak<Framebuffer>>>,
}

impl DrmOutput {
    /// Output resolution.
    pub fn size(&self) -> Size<i32, Physical> {
        let (width, height) = self.mode.size();
        (width as i32, height as i32).into()
    }

    /// Import a dma-buf as kernel framebuffer.
    fn import(&self, buffer: &Arc<Buffer>) -> io::Result<Framebuffer> {
        let dmabuf = buffer
            .dmabuf()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no dma-buf backing"))?;

        let fd = &self.card.fd;
        let mut planes = DmabufPlanes {
            size: (dmabuf.width(), dmabuf.height()),
            format: dmabuf.format().code,
            modifier: match dmabuf.format().modifier {
                Modifier::Invalid => None,
                modifier => Some(modifier),
            },
            pitches: [0; 4],
            offsets: [0; 4],
            handles: [None; 4],
        };

        let mut gem_handles = Vec::new();
        let planes_iter = dmabuf.handles().zip(dmabuf.strides()).zip(dmabuf.offsets());
        for (i, ((plane_fd, stride), offset)) in planes_iter.enumerate().take(4) {
            let gem_handle = match fd.prime_fd_to_buffer(plane_fd) {
                Ok(gem_handle) => gem_handle,
                Err(err) => {
                    close_gem_handles(fd, &gem_handles);
                    return Err(err);
                },
            };
            gem_handles.push(gem_handle);

            planes.handles[i] = Some(gem_handle);
            planes.pitches[i] = stride;
            planes.offsets[i] = offset;
        }

        let flags =
            if planes.modifier.is_some() { FbCmd2Flags::MODIFIERS } else { FbCmd2Flags::empty() };
        let fb = match fd.add_planar_framebuffer(&planes, flags) {
            Ok(fb) => fb,
            Err(err) => {
                close_gem_handles(fd, &gem_handles);
                return Err(err);
            },
        };

        let size = buffer.size();
        let content = FramebufferContent::Client(buffer.clone());
        let size = (size.w, size.h).into();
        let framebuffer = Framebuffer::new(fb.into(), size, buffer.format(), content);

        // Remove the framebuffer and its GEM references once it is unused.
        let fd = fd.clone();
        Ok(framebuffer.with_release(Box::new(move |id| {
            destroy_framebuffer(&fd, id);
            close_gem_handles(&fd, &gem_handles);
        })))
    }

    fn lock_imports(&self) -> MutexGuard<'_, HashMap<BufferId, Weak<Framebuffer>>> {
        self.imports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KmsOutput for DrmOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_crtc(&self, framebuffer: &FbHandle) -> bool {
        let fb = match control::from_u32::<framebuffer::Handle>(framebuffer.id()) {
            Some(fb) => fb,
            None => return false,
        };

        // Let the outstanding flip finish, so its event is not mistaken for a later one.
        if self.flip_pending.swap(false, Ordering::Relaxed) {
            let deadline = Some(Instant::now() + FLIP_DRAIN_TIMEOUT);
            match self.card.wait_for_flip(self.crtc, deadline) {
                Ok(true) => (),
                Ok(false) => {
                    warn!(output = %self.name, "Abandoning page flip for mode-set");
                    self.card.abandon_flip(self.crtc);
                },
                Err(err) => error!(output = %self.name, "Failed to read DRM events: {err}"),
            }
        }

        let result =
            self.card.fd.set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(self.mode));
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(output = %self.name, "Mode-set rejected: {err}");
                false
            },
        }
    }

    fn schedule_page_flip(&self, framebuffer: &FbHandle) -> bool {
        let fb = match control::from_u32::<framebuffer::Handle>(framebuffer.id()) {
            Some(fb) => fb,
            None => return false,
        };

        match self.card.fd.page_flip(self.crtc, fb, PageFlipFlags::EVENT, None) {
            Ok(()) => {
                self.flip_pending.store(true, Ordering::Relaxed);
                true
            },
            Err(err) => {
                debug!(output = %self.name, "Page flip rejected: {err}");
                false
            },
        }
    }

    fn wait_for_page_flip(&self, timeout: Option<Duration>) -> Result<(), FlipTimeout> {
        if !self.flip_pending.load(Ordering::Relaxed) {
            return Ok(());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        match self.card.wait_for_flip(self.crtc, deadline) {
            Ok(true) => (),
            Ok(false) => {
                // The caller moves on, so the late event must not complete the next flip.
                self.card.abandon_flip(self.crtc);
                self.flip_pending.store(false, Ordering::Relaxed);

                let timeout = timeout.unwrap_or_default();
                return Err(FlipTimeout { output: self.name.clone(), timeout });
            },
            // Treat broken devices like completed flips, to avoid blocking forever.
            Err(err) => error!(output = %self.name, "Failed to read DRM events: {err}"),
        }

        self.flip_pending.store(false, Ordering::Relaxed);

        Ok(())
    }

    fn max_refresh_rate(&self) -> u32 {
        self.mode.vrefresh()
    }

    fn fb_for(&self, buffer: &Arc<Buffer>) -> Option<FbHandle> {
        // Shared memory cannot be scanned out.
        buffer.dmabuf()?;

        let mut imports = self.lock_imports();
        if let Some(fb) = imports.get(&buffer.id()).and_then(Weak::upgrade) {
            return Some(fb);
        }

        let fb = match self.import(buffer) {
            Ok(fb) => Arc::new(fb),
            Err(err) => {
                debug!(output = %self.name, id = %buffer.id(), "Scanout import failed: {err}");
                return None;
            },
        };

        imports.retain(|_, fb| fb.strong_count() > 0);
        imports.insert(buffer.id(), Arc::downgrade(&fb));

        Some(fb)
    }

    fn create_dumb_framebuffer(&self, size: Size<i32, Physical>) -> io::Result<FbHandle> {
        if size.w <= 0 || size.h <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty framebuffer"));
        }

        let fd = &self.card.fd;
        let dumb = fd.create_dumb_buffer((size.w as u32, size.h as u32), Fourcc::Xrgb8888, 32)?;
        let fb = match fd.add_framebuffer(&dumb, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                let _ = fd.destroy_dumb_buffer(dumb);
                return Err(err);
            },
        };

        let storage: Box<dyn PixelStorage> =
            Box::new(DumbStorage { fd: fd.clone(), buffer: Some(dumb) });
        let content = FramebufferContent::Dumb(Mutex::new(storage));
        let framebuffer = Framebuffer::new(fb.into(), size, Fourcc::Xrgb8888, content);

        let fd = fd.clone();
        let release = Box::new(move |id| destroy_framebuffer(&fd, id));

        Ok(Arc::new(framebuffer.with_release(release)))
    }
}

/// Kernel-allocated CPU-mappable buffer.
struct DumbStorage {
    fd: DrmDeviceFd,
    buffer: Option<DumbBuffer>,
}

impl Drop for DumbStorage {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(err) = self.fd.destroy_dumb_buffer(buffer) {
                error!("Failed to destroy dumb buffer: {err}");
            }
        }
    }
}

impl PixelStorage for DumbStorage {
    fn with_pixels(&mut self, f: &mut dyn FnMut(&mut [u8], u32)) -> io::Result<()> {
        let buffer = match &mut self.buffer {
            Some(buffer) => buffer,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "dumb buffer destroyed")),
        };

        let pitch = buffer.pitch();
        let mut mapping = self.fd.map_dumb_buffer(buffer)?;
        f(mapping.as_mut(), pitch);

        Ok(())
    }
}

/// Plane layout of an imported dma-buf.
struct DmabufPlanes {
    size: (u32, u32),
    format: Fourcc,
    modifier: Option<DrmModifier>,
    pitches: [u32; 4],
    offsets: [u32; 4],
    handles: [Option<GemHandle>; 4],
}

impl PlanarBuffer for DmabufPlanes {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<GemHandle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

fn destroy_framebuffer(fd: &DrmDeviceFd, id: u32) {
    let fb = match control::from_u32::<framebuffer::Handle>(id) {
        Some(fb) => fb,
        None => return,
    };

    if let Err(err) = fd.destroy_framebuffer(fb) {
        error!("Failed to remove framebuffer {id}: {err}");
    }
}

fn close_gem_handles(fd: &DrmDeviceFd, handles: &[GemHandle]) {
    // Planes may share the same GEM object.
    let mut closed = HashSet::new();
    for handle in handles {
        if closed.insert(*handle) {
            let _ = fd.close_buffer(*handle);
        }
    }
}
