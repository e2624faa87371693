//! Udev backend.

use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::os::linux::fs::MetadataExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process;
use std::sync::Arc;

use smithay::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags};
use smithay::backend::drm::DrmDeviceFd;
use smithay::backend::session::libseat::LibSeatSession;
use smithay::backend::session::{Event as SessionEvent, Session};
use smithay::backend::udev::{UdevBackend, UdevEvent};
use smithay::reexports::calloop::EventLoop;
use smithay::reexports::nix::fcntl::OFlag;
use smithay::reexports::nix::sys::stat::dev_t as DeviceId;
use smithay::utils::DeviceFd;
use tracing::{error, info, warn};

use crate::allocator::BufferAllocator;
use crate::config::Config;
use crate::gpu::{EglGpuContext, GpuExecutor, HeadlessGpuContext};
use crate::kms::drm::DrmCard;
use crate::kms::KmsOutput;
use crate::platform::{
    self, Capability, CapabilityTag, DisplayPlatform, PlatformConfig, PlatformSupport,
};
use crate::vellum::{self, Backend, Screen, Vellum};
use crate::{headless, ipc_server};

pub fn run(config: Config) {
    // Initialize the VT session.
    let (session, notifier) = match LibSeatSession::new() {
        Ok(session) => session,
        Err(_) => {
            eprintln!(
                "[error] Unable to start libseat session: Ensure logind/seatd service is running \
                 with no active session"
            );
            process::exit(666);
        },
    };

    let platform_config = PlatformConfig { device: config.device.clone(), seat: session.seat() };
    let mut platform = match platform::probe(&platform_config) {
        PlatformSupport::Display(platform) => platform,
        PlatformSupport::Rendering(platform) => {
            info!("No display device, {:?} only supports rendering", platform.path());
            return headless::run(config);
        },
        PlatformSupport::Unsupported => {
            info!("No graphics device found, falling back to headless mode");
            return headless::run(config);
        },
    };

    let mut udev = Udev::new(session);
    let device_fd = match platform.open(|path| udev.open(path)) {
        Ok(device_fd) => device_fd,
        Err(err) => {
            error!("{err}");
            return;
        },
    };

    if platform.try_acquire(CapabilityTag::DumbBuffers).is_none() {
        error!("Device {:?} does not support dumb buffers", platform.path());
        return;
    }

    let allocator = Arc::new(allocator(&platform));
    udev.add_device(platform.path(), device_fd);

    let mut event_loop = EventLoop::try_new().expect("event loop");
    let mut vellum = Vellum::new(event_loop.handle(), Backend::Udev(udev), allocator, config);
    update_screens(&mut vellum);

    // Register notifier for handling session events.
    event_loop
        .handle()
        .insert_source(notifier, |event, _, vellum| match event {
            SessionEvent::ActivateSession => {
                info!("Session activated, restoring outputs");
                vellum.schedule_set_crtc();
            },
            SessionEvent::PauseSession => info!("Session paused"),
        })
        .expect("insert notifier source");

    // Handle device events.
    let seat_name = platform_config.seat;
    let backend = UdevBackend::new(&seat_name).expect("init udev");
    event_loop
        .handle()
        .insert_source(backend, |event, _, vellum| match event {
            UdevEvent::Added { path, .. } => info!("Ignoring new graphics device {path:?}"),
            UdevEvent::Changed { device_id } => change_device(vellum, device_id),
            UdevEvent::Removed { device_id } => remove_device(vellum, device_id),
        })
        .expect("insert udev source");

    // Start IPC socket listener.
    ipc_server::spawn_ipc_socket(&event_loop.handle(), &vellum.socket_name)
        .expect("spawn IPC socket");

    vellum::handle_signals(&event_loop.handle()).expect("signal handler");

    if vellum.config().test_pattern {
        vellum.start_test_pattern();
    }

    // Continously dispatch event loop.
    while !vellum.terminated {
        if let Err(error) = event_loop.dispatch(None, &mut vellum) {
            eprintln!("Event loop error: {error}");
            break;
        }
    }
}

/// Udev backend shared state.
pub struct Udev {
    session: LibSeatSession,
    card: Option<Arc<DrmCard>>,
    device_id: Option<DeviceId>,
}

impl Udev {
    fn new(session: LibSeatSession) -> Self {
        Self { session, card: Default::default(), device_id: Default::default() }
    }

    /// Open a device node through the session.
    fn open(&mut self, path: &Path) -> Result<DrmDeviceFd, Box<dyn Error>> {
        let open_flags = OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_NOCTTY | OFlag::O_NONBLOCK;
        let fd = self.session.open(path, open_flags)?;
        Ok(unsafe { DrmDeviceFd::new(DeviceFd::from_raw_fd(fd)) })
    }

    /// Start driving the outputs of a device.
    fn add_device(&mut self, path: &Path, device_fd: DrmDeviceFd) {
        self.device_id = match fs::metadata(path) {
            Ok(metadata) => Some(metadata.st_rdev()),
            Err(err) => {
                warn!("Unable to identify {path:?}, hot-plug disabled: {err}");
                None
            },
        };
        self.card = Some(DrmCard::new(device_fd));
    }

    /// Check if udev events for `device_id` concern our device.
    fn is_active_device(&self, device_id: DeviceId) -> bool {
        self.device_id == Some(device_id)
    }
}

/// Create the buffer allocator for a display device.
fn allocator(platform: &DisplayPlatform) -> BufferAllocator {
    let gbm = match platform.try_acquire(CapabilityTag::Gbm) {
        Some(Capability::Gbm(gbm)) => {
            Some(GbmAllocator::new(gbm, GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT))
        },
        _ => None,
    };

    match platform.try_acquire(CapabilityTag::DmabufImport) {
        Some(Capability::DmabufImport(import)) => {
            let gpu = GpuExecutor::new(EglGpuContext::new(import.context));
            BufferAllocator::new(gpu, gbm, import.formats)
        },
        _ if gbm.is_some() => {
            info!("Dma-buf import unavailable, client buffers are limited to shm");
            let gpu = GpuExecutor::new(HeadlessGpuContext::default());
            BufferAllocator::new(gpu, gbm, HashSet::new())
        },
        _ => {
            warn!("No GPU support available, using software buffers only");
            BufferAllocator::software()
        },
    }
}

/// Recreate screens from the device's connected outputs.
fn update_screens(vellum: &mut Vellum) {
    let card = match &vellum.backend {
        Backend::Udev(Udev { card: Some(card), .. }) => card.clone(),
        _ => return,
    };

    let outputs = match card.outputs() {
        Ok(outputs) => outputs,
        Err(err) => {
            error!("Unable to query outputs: {err}");
            return;
        },
    };

    let mut screens = Vec::new();
    for output in outputs {
        let size = output.size();
        let name = output.name().to_owned();
        let output: Arc<dyn KmsOutput> = Arc::new(output);
        match Screen::new(vec![output], size, vellum.config()) {
            Ok(screen) => screens.push(screen),
            Err(err) => error!(output = %name, "Unable to create screen: {err}"),
        }
    }

    if screens.is_empty() {
        warn!("No connected outputs");
    }

    vellum.set_screens(screens);
}

/// Names of all currently driven outputs.
fn output_names(vellum: &Vellum) -> Vec<String> {
    let outputs = vellum.screens().iter().flat_map(|screen| screen.display_buffer().outputs());
    outputs.map(|output| output.name().to_owned()).collect()
}

/// Handle connector changes of a device.
fn change_device(vellum: &mut Vellum, device_id: DeviceId) {
    let card = match &vellum.backend {
        Backend::Udev(udev) if udev.is_active_device(device_id) => udev.card.clone(),
        _ => return,
    };
    let card = match card {
        Some(card) => card,
        None => return,
    };

    let connected: Vec<String> = match card.outputs() {
        Ok(outputs) => outputs.iter().map(|output| output.name().to_owned()).collect(),
        Err(err) => {
            error!("Unable to query outputs: {err}");
            return;
        },
    };

    if connected != output_names(vellum) {
        info!("Output configuration changed: {connected:?}");
        update_screens(vellum);
    }

    // Pick up the new hardware state.
    vellum.schedule_set_crtc();
}

/// Stop using a removed device.
fn remove_device(vellum: &mut Vellum, device_id: DeviceId) {
    match &mut vellum.backend {
        Backend::Udev(udev) if udev.is_active_device(device_id) => {
            info!("Display device removed");
            udev.card = None;
            udev.device_id = None;
        },
        _ => return,
    }

    vellum.set_screens(Vec::new());
}

