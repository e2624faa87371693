//! Headless backend.

use std::error::Error;
use std::sync::Arc;

use smithay::reexports::calloop::EventLoop;
use tracing::{error, info};

use crate::allocator::BufferAllocator;
use crate::config::Config;
use crate::ipc_server;
use crate::kms::virtual_output::VirtualOutput;
use crate::kms::KmsOutput;
use crate::vellum::{self, Backend, Screen, Vellum};

pub fn run(config: Config) {
    let mut event_loop = EventLoop::try_new().expect("event loop");
    let allocator = Arc::new(BufferAllocator::software());
    let mut vellum = Vellum::new(event_loop.handle(), Backend::Headless, allocator, config);

    match virtual_screen(vellum.config()) {
        Ok(screen) => vellum.set_screens(vec![screen]),
        Err(err) => {
            error!("Could not create virtual outputs: {err}");
            return;
        },
    }

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

/// Create a screen cloned across all virtual outputs.
fn virtual_screen(config: &Config) -> Result<Screen, Box<dyn Error>> {
    let mode = config.headless.unwrap_or_default();

    let outputs: Vec<Arc<dyn KmsOutput>> = (1..=config.outputs.max(1))
        .map(|index| {
            let name = format!("VIRTUAL-{index}");
            info!("Created output {name}: {}x{}@{}Hz", mode.size.w, mode.size.h, mode.refresh_rate);
            Arc::new(VirtualOutput::new(name, mode.size, mode.refresh_rate)) as Arc<dyn KmsOutput>
        })
        .collect();

    Ok(Screen::new(outputs, mode.size, config)?)
}
