//! USB Video Class streaming engine: format negotiation, transfer pool,
//! payload reassembly and frame delivery.

pub mod catalog;
pub mod control;
pub mod device;
pub mod error;
pub mod stream;
pub mod usb;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use catalog::{DeviceInfo, FrameFormat, StreamProfile};
pub use control::{StreamCtrl, StreamRequest};
pub use device::DeviceHandle;
pub use error::{Result, TransportError, UvcError};
pub use stream::{Frame, FrameMetadata, PollTimeout, StatsSnapshot, StreamHandle};

/// Global configuration that can be atomically swapped at runtime.
///
/// Streams take a snapshot when they are opened.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub streaming: StreamingConfig,
    pub log: LogConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Concurrent transfers kept in flight per stream
    pub transfer_count: usize,
    pub transfer_timeout_ms: u64,
    pub control_timeout_ms: u64,
    /// Bytes reserved for the most recent payload header
    pub metadata_capacity: usize,
    /// Upper bound on packets per isochronous transfer
    pub max_iso_packets: usize,
    /// Frame buffer size when neither device nor descriptor report one
    pub frame_buffer_size: usize,
    /// Pin the dispatch thread to this core
    pub dispatch_cpu: Option<usize>,
}

impl StreamingConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            transfer_count: 20,
            transfer_timeout_ms: 5000,
            control_timeout_ms: 5000,
            metadata_capacity: 2048,
            max_iso_packets: 32,
            frame_buffer_size: 4 * 1024 * 1024,
            dispatch_cpu: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "uvc_stream=info".into(),
        }
    }
}

/// Synthetic camera driven by the `uvc-stream` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub format: FrameFormat,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    /// Stop after this many frames
    pub frames: u64,
    /// Image bytes per bulk payload
    pub payload_size: usize,
    /// Host-side completion threads
    pub workers: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            format: FrameFormat::Yuyv,
            width: 640,
            height: 480,
            fps: 30,
            frames: 90,
            payload_size: 16 * 1024,
            workers: 2,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `UVC_SECTION__KEY`
    /// environment variables, e.g. `UVC_STREAMING__TRANSFER_COUNT`.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix("UVC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_an_empty_source() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.streaming.transfer_count, 20);
        assert_eq!(config.streaming.metadata_capacity, 2048);
        assert_eq!(config.demo.format, FrameFormat::Yuyv);
        assert_eq!(config.streaming.control_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_use_a_single_underscore_prefix() {
        std::env::set_var("UVC_STREAMING__MAX_ISO_PACKETS", "8");
        let config = Config::load(None);
        std::env::remove_var("UVC_STREAMING__MAX_ISO_PACKETS");

        let config = config.unwrap();
        assert_eq!(config.streaming.max_iso_packets, 8);
        assert_eq!(config.streaming.transfer_count, 20);
    }
}
