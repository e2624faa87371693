//! Vellum display server interface.
//!
//! This library provides abstractions for interacting with Vellum's external
//! interfaces, both for control tools and for clients tracking their buffers.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, process};

#[cfg(feature = "clap")]
use clap::Subcommand;
use serde::{Deserialize, Serialize};
#[cfg(feature = "smithay")]
use smithay::utils::Transform;

/// Environment variable used to select the IPC socket.
pub const DISPLAY_ENV: &str = "VELLUM_DISPLAY";

/// IPC message format.
#[cfg_attr(feature = "clap", derive(Subcommand))]
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug)]
pub enum IpcMessage {
    /// Force a synchronous mode-set on the next frame.
    SetCrtc,
    /// Change the output transform.
    Orientation {
        /// New orientation of all outputs.
        orientation: Orientation,
    },
    /// Query buffer statistics.
    Stats,
    /// Reply for the stats message.
    #[cfg_attr(feature = "clap", clap(skip))]
    StatsReply {
        /// Number of buffers known to the server.
        buffers: usize,
        /// Number of buffers currently owned by clients.
        client_owned: usize,
    },
    /// Print buffer announcements until the server goes away.
    Subscribe,
}

/// Buffer announcement sent to subscribed clients.
#[derive(Deserialize, Serialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BufferEvent {
    /// A new buffer was created.
    Add { id: u32, width: u32, height: u32, format: u32, stride: u32 },
    /// A buffer was destroyed.
    Remove { id: u32 },
    /// Buffer content is available to the client.
    Update { id: u32 },
}

impl Display for BufferEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { id, width, height, format, stride } => {
                write!(f, "add {id} {width}x{height} format={format:#010x} stride={stride}")
            },
            Self::Remove { id } => write!(f, "remove {id}"),
            Self::Update { id } => write!(f, "update {id}"),
        }
    }
}

/// Output orientation.
#[derive(Deserialize, Serialize, PartialEq, Eq, Copy, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    /// Unrotated output.
    #[default]
    Normal,

    /// Rotated by 90 degrees.
    Rotate90,

    /// Rotated by 180 degrees.
    Rotate180,

    /// Rotated by 270 degrees.
    Rotate270,
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "rotate90" | "90" => Ok(Self::Rotate90),
            "rotate180" | "180" => Ok(Self::Rotate180),
            "rotate270" | "270" => Ok(Self::Rotate270),
            _ => Err(format!("Got {s:?}, expected normal or rotate{{90,180,270}}")),
        }
    }
}

#[cfg(feature = "smithay")]
impl Orientation {
    /// Display rendering transform for this orientation.
    pub fn transform(&self) -> Transform {
        match self {
            Self::Normal => Transform::Normal,
            Self::Rotate90 => Transform::_90,
            Self::Rotate180 => Transform::_180,
            Self::Rotate270 => Transform::_270,
        }
    }
}

/// Send a message to the Vellum IPC socket.
///
/// Returns the server's reply for messages which expect one.
pub fn send_message(message: &IpcMessage) -> Result<Option<IpcMessage>, Box<dyn Error>> {
    let mut socket = connect()?;

    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    socket.write_all(json.as_bytes())?;
    let _ = socket.flush();

    // Only stats requests are answered.
    if !matches!(message, IpcMessage::Stats) {
        return Ok(None);
    }

    let mut reply = String::new();
    BufReader::new(socket).read_line(&mut reply)?;
    Ok(Some(serde_json::from_str(&reply)?))
}

/// Subscribe to buffer announcements.
///
/// The callback is invoked for every event until the server closes the
/// connection.
pub fn subscribe<F: FnMut(BufferEvent)>(mut callback: F) -> Result<(), Box<dyn Error>> {
    let mut socket = connect()?;

    let mut json = serde_json::to_string(&IpcMessage::Subscribe)?;
    json.push('\n');
    socket.write_all(json.as_bytes())?;

    for line in BufReader::new(socket).lines() {
        let event = serde_json::from_str(&line?)?;
        callback(event);
    }

    Ok(())
}

/// Connect to the IPC socket of the current display.
fn connect() -> Result<UnixStream, Box<dyn Error>> {
    let socket_name = match env::var(DISPLAY_ENV) {
        Ok(socket_name) => socket_name,
        Err(_) => {
            eprintln!("Error: {DISPLAY_ENV} is not set");
            process::exit(101);
        },
    };

    let socket_path = socket_path(&socket_name);

    // Ensure Vellum's IPC listener is running.
    if !socket_path.exists() {
        eprintln!("Error: IPC socket not found, ensure Vellum is running");
        process::exit(102);
    }

    Ok(UnixStream::connect(&socket_path)?)
}

/// Path for the IPC socket file.
pub fn socket_path(socket_name: &str) -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(env::temp_dir).join(format!("vellum-{socket_name}.sock"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn orientation_from_str() {
        assert_eq!(Orientation::from_str("Normal"), Ok(Orientation::Normal));
        assert_eq!(Orientation::from_str("90"), Ok(Orientation::Rotate90));
        assert_eq!(Orientation::from_str("rotate270"), Ok(Orientation::Rotate270));
        assert!(Orientation::from_str("sideways").is_err());
    }

    #[test]
    fn buffer_event_wire_format() {
        let event = BufferEvent::Update { id: 7 };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"update","id":7}"#);

        let parsed: BufferEvent = serde_json::from_str(r#"{"event":"remove","id":3}"#).unwrap();
        assert_eq!(parsed, BufferEvent::Remove { id: 3 });
    }

    #[test]
    fn buffer_event_display() {
        let format = 0x34325258;
        let event = BufferEvent::Add { id: 2, width: 640, height: 480, format, stride: 2560 };
        assert_eq!(event.to_string(), "add 2 640x480 format=0x34325258 stride=2560");
        assert_eq!(BufferEvent::Remove { id: 2 }.to_string(), "remove 2");
    }
}
