//! Graphics platform negotiation.
//!
//! Probing picks a device and reports which kind of platform it can support.
//! Optional device features are requested through [`CapabilityTag`]s once
//! the device node has been opened.

use std::collections::HashSet;
use std::error::Error;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::{fs, io};

use smithay::backend::allocator::gbm::GbmDevice;
use smithay::backend::allocator::Format;
use smithay::backend::drm::DrmDeviceFd;
use smithay::backend::egl::context::EGLContext;
use smithay::backend::egl::display::EGLDisplay;
use smithay::reexports::drm::{Device as _, DriverCapability};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Location of DRM devices in sysfs.
const DRM_SYSFS: &str = "/sys/class/drm";

/// Platform setup errors.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("device enumeration failed: {0}")]
    Enumeration(#[from] io::Error),
    #[error("could not open {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },
}

/// Device selection options.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    /// Device node forced by the user.
    pub device: Option<PathBuf>,
    /// Seat whose devices are considered.
    pub seat: String,
}

/// Result of platform probing.
pub enum PlatformSupport {
    /// Device capable of driving outputs.
    Display(DisplayPlatform),
    /// Device which can only be used for rendering.
    Rendering(RenderingPlatform),
    Unsupported,
}

/// Optional features of a display device.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum CapabilityTag {
    /// CPU-mappable scanout buffers.
    DumbBuffers,
    /// GPU buffer allocation.
    Gbm,
    /// Sampling from client dma-bufs.
    DmabufImport,
}

/// Acquired device feature.
pub enum Capability {
    DumbBuffers,
    Gbm(GbmDevice<DrmDeviceFd>),
    DmabufImport(DmabufImport),
}

/// GPU state for sampling client buffers.
pub struct DmabufImport {
    pub context: EGLContext,
    pub formats: HashSet<Format>,
}

type Acquire = fn(&DrmDeviceFd) -> Option<Capability>;

/// Handlers for every capability.
const CAPABILITIES: [(CapabilityTag, Acquire); 3] = [
    (CapabilityTag::DumbBuffers, acquire_dumb_buffers),
    (CapabilityTag::Gbm, acquire_gbm),
    (CapabilityTag::DmabufImport, acquire_dmabuf_import),
];

/// KMS capable device.
pub struct DisplayPlatform {
    path: PathBuf,
    connectors: Vec<String>,
    device: Option<DrmDeviceFd>,
}

impl DisplayPlatform {
    fn new(path: PathBuf, connectors: Vec<String>) -> Self {
        Self { path, connectors, device: None }
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the device's connectors known to sysfs.
    pub fn connectors(&self) -> &[String] {
        &self.connectors
    }

    /// Open the device node.
    ///
    /// Opening is delegated to the caller, since it usually requires access
    /// through the seat's session.
    pub fn open<F>(&mut self, open: F) -> Result<DrmDeviceFd, PlatformError>
    where
        F: FnOnce(&Path) -> Result<DrmDeviceFd, Box<dyn Error>>,
    {
        let device = open(&self.path).map_err(|err| {
            let reason = err.to_string();
            PlatformError::Open { path: self.path.clone(), reason }
        })?;
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Try to acquire an optional device feature.
    ///
    /// Returns `None` if the device is not open or lacks the capability.
    pub fn try_acquire(&self, tag: CapabilityTag) -> Option<Capability> {
        let device = self.device.as_ref()?;
        let (_, acquire) = CAPABILITIES.iter().find(|(handler_tag, _)| *handler_tag == tag)?;

        let capability = acquire(device);
        debug!(?tag, available = capability.is_some(), "Acquiring device capability");
        capability
    }
}

/// Device usable for offscreen work only.
#[derive(Debug)]
pub struct RenderingPlatform {
    path: PathBuf,
}

impl RenderingPlatform {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Find the best graphics platform for this system.
pub fn probe(config: &PlatformConfig) -> PlatformSupport {
    // Respect user device choice, even if it has no connectors yet.
    if let Some(path) = &config.device {
        let connectors = path
            .file_name()
            .map(|name| connectors(&Path::new(DRM_SYSFS).join(name), name))
            .unwrap_or_default();
        return PlatformSupport::Display(DisplayPlatform::new(path.clone(), connectors));
    }

    let candidates = match enumerate(&config.seat) {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!("Unable to probe graphics devices: {err}");
            return PlatformSupport::Unsupported;
        },
    };

    select(candidates)
}

/// DRM card found on the seat.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    connectors: Vec<String>,
    boot_vga: bool,
}

/// List all DRM cards of a seat.
fn enumerate(seat: &str) -> Result<Vec<Candidate>, PlatformError> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut candidates = Vec::new();
    for device in enumerator.scan_devices()? {
        let device_seat = device.property_value("ID_SEAT").unwrap_or(OsStr::new("seat0"));
        if device_seat != OsStr::new(seat) {
            continue;
        }

        let path = match device.devnode() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };

        let boot_vga = device
            .parent()
            .map_or(false, |parent| parent.attribute_value("boot_vga") == Some(OsStr::new("1")));

        let connectors = connectors(device.syspath(), device.sysname());
        candidates.push(Candidate { path, connectors, boot_vga });
    }

    Ok(candidates)
}

/// Pick the most capable device.
///
/// Cards with connectors are preferred, using the boot GPU to break ties.
fn select(candidates: Vec<Candidate>) -> PlatformSupport {
    let display = candidates
        .iter()
        .filter(|candidate| !candidate.connectors.is_empty())
        .min_by_key(|candidate| !candidate.boot_vga);

    if let Some(candidate) = display {
        info!("Using display device {:?}", candidate.path);
        let platform = DisplayPlatform::new(candidate.path.clone(), candidate.connectors.clone());
        return PlatformSupport::Display(platform);
    }

    match candidates.into_iter().next() {
        Some(candidate) => {
            info!("Device {:?} has no outputs, using it for rendering only", candidate.path);
            PlatformSupport::Rendering(RenderingPlatform { path: candidate.path })
        },
        None => PlatformSupport::Unsupported,
    }
}

/// Connector names of a card from its sysfs directory.
///
/// Connectors are listed as `<card>-<connector>` subdirectories.
fn connectors(syspath: &Path, sysname: &OsStr) -> Vec<String> {
    let prefix = format!("{}-", sysname.to_string_lossy());

    let entries = match fs::read_dir(syspath) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut connectors: Vec<_> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix(&prefix).map(String::from)
        })
        .collect();
    connectors.sort();

    connectors
}

fn acquire_dumb_buffers(device: &DrmDeviceFd) -> Option<Capability> {
    let supported = device.get_driver_capability(DriverCapability::DumbBuffer).ok()?;
    (supported != 0).then_some(Capability::DumbBuffers)
}

fn acquire_gbm(device: &DrmDeviceFd) -> Option<Capability> {
    match GbmDevice::new(device.clone()) {
        Ok(gbm) => Some(Capability::Gbm(gbm)),
        Err(err) => {
            debug!("GBM unavailable: {err}");
            None
        },
    }
}

fn acquire_dmabuf_import(device: &DrmDeviceFd) -> Option<Capability> {
    let gbm = GbmDevice::new(device.clone()).ok()?;

    let display = match EGLDisplay::new(gbm) {
        Ok(display) => display,
        Err(err) => {
            debug!("EGL unavailable: {err}");
            return None;
        },
    };
    let formats = display.dmabuf_texture_formats().iter().copied().collect();

    let context = match EGLContext::new(&display) {
        Ok(context) => context,
        Err(err) => {
            debug!("EGL context creation failed: {err}");
            return None;
        },
    };

    Some(Capability::DmabufImport(DmabufImport { context, formats }))
}
