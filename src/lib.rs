//! Vellum display server core.
//!
//! This library tracks buffer ownership between clients and the server and
//! posts composited or directly scanned out frames to KMS outputs.

use std::fmt::Display;

use tracing::error;

pub mod allocator;
pub mod buffer;
pub mod buffer_map;
pub mod config;
pub mod display_buffer;
pub mod geometry;
pub mod gpu;
pub mod headless;
pub mod ipc_server;
pub mod kms;
pub mod platform;
pub mod renderer;
pub mod scene;
pub mod shm;
pub mod sync;
pub mod test_pattern;
pub mod udev;
pub mod vellum;

use crate::config::Config;

/// Start the display server.
///
/// Virtual outputs are used when headless mode is requested, otherwise the
/// best graphics device of the seat drives the outputs.
pub fn run(config: Config) {
    if config.headless.is_some() {
        headless::run(config);
    } else {
        udev::run(config);
    }
}

/// Log an error, ignoring success.
pub fn trace_error<T, E: Display>(result: Result<T, E>) {
    if let Err(err) = &result {
        error!("{err}");
    }
}
