//! Display server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use smithay::utils::{Physical, Size};

use crate::display_buffer::BypassOption;

/// Byte used to fill the framebuffer shown before the first frame.
pub const INITIAL_FB_FILL: u8 = 24;

/// Virtual output mode used when none is specified.
pub const DEFAULT_HEADLESS_MODE: &str = "1280x720@60";

/// Refresh rate used when a headless mode omits it.
const DEFAULT_REFRESH_RATE: u32 = 60;

/// Runtime options.
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// DRM device used for display, skipping device probing.
    #[clap(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Run on virtual outputs instead of real hardware.
    #[clap(long, value_name = "WxH@HZ", num_args = 0..=1)]
    #[clap(default_missing_value = DEFAULT_HEADLESS_MODE)]
    pub headless: Option<HeadlessMode>,

    /// Number of virtual outputs showing the same content.
    #[clap(long, value_name = "N", default_value_t = 1)]
    pub outputs: usize,

    /// Always composite, never scan client buffers out directly.
    #[clap(long)]
    pub no_bypass: bool,

    /// Maximum time to wait for a page flip.
    #[clap(long, value_name = "MS")]
    pub flip_timeout_ms: Option<u64>,

    /// Show an animated test pattern.
    #[clap(long)]
    pub test_pattern: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outputs: 1,
            test_pattern: Default::default(),
            flip_timeout_ms: Default::default(),
            no_bypass: Default::default(),
            headless: Default::default(),
            device: Default::default(),
        }
    }
}

impl Config {
    /// Direct scanout policy.
    pub fn bypass(&self) -> BypassOption {
        if self.no_bypass {
            BypassOption::Prohibited
        } else {
            BypassOption::Allowed
        }
    }

    /// Page flip timeout, `None` waits forever.
    pub fn flip_timeout(&self) -> Option<Duration> {
        self.flip_timeout_ms.map(Duration::from_millis)
    }
}

/// Virtual output mode.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct HeadlessMode {
    pub size: Size<i32, Physical>,
    pub refresh_rate: u32,
}

impl Default for HeadlessMode {
    fn default() -> Self {
        Self { size: (1280, 720).into(), refresh_rate: DEFAULT_REFRESH_RATE }
    }
}

impl FromStr for HeadlessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Got {s:?}, expected WIDTHxHEIGHT[@REFRESH_RATE]");

        let (size, refresh_rate) = match s.split_once('@') {
            Some((size, refresh_rate)) => {
                (size, refresh_rate.parse::<u32>().map_err(|_| invalid())?)
            },
            None => (s, DEFAULT_REFRESH_RATE),
        };

        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let width = width.parse::<u16>().map_err(|_| invalid())?;
        let height = height.parse::<u16>().map_err(|_| invalid())?;

        if width == 0 || height == 0 || refresh_rate == 0 {
            return Err(invalid());
        }

        Ok(Self { size: (width as i32, height as i32).into(), refresh_rate })
    }
}

#[cfg(test)]
mod test {
    use std::iter;

    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Options {
        #[clap(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        Options::parse_from(iter::once("vellum").chain(args.iter().copied())).config
    }

    #[test]
    fn headless_mode() {
        let mode = HeadlessMode::from_str("800x600@30").unwrap();
        assert_eq!(mode.size, Size::from((800, 600)));
        assert_eq!(mode.refresh_rate, 30);

        let mode = HeadlessMode::from_str("640x480").unwrap();
        assert_eq!(mode.refresh_rate, DEFAULT_REFRESH_RATE);

        assert!(HeadlessMode::from_str("640").is_err());
        assert!(HeadlessMode::from_str("0x480").is_err());
        assert!(HeadlessMode::from_str("640x480@0").is_err());
        assert!(HeadlessMode::from_str("-1x480").is_err());
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.headless, None);
        assert_eq!(config.outputs, 1);
        assert_eq!(config.bypass(), BypassOption::Allowed);
        assert_eq!(config.flip_timeout(), None);
    }

    #[test]
    fn headless_without_mode() {
        let config = parse(&["--headless", "--outputs", "2", "--no-bypass"]);
        assert_eq!(config.headless, Some(HeadlessMode::default()));
        assert_eq!(config.outputs, 2);
        assert_eq!(config.bypass(), BypassOption::Prohibited);
    }

    #[test]
    fn flip_timeout() {
        let config = parse(&["--headless=320x240", "--flip-timeout-ms", "40"]);
        assert_eq!(config.headless.map(|mode| mode.size), Some(Size::from((320, 240))));
        assert_eq!(config.flip_timeout(), Some(Duration::from_millis(40)));
    }
}
