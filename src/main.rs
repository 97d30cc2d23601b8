//! UVC streaming demo against a simulated camera

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use uvc_stream::catalog::{
    DeviceQuirks, FormatDescriptor, FrameDescriptor, FrameIntervals, StreamingInterface,
    INTERVAL_UNITS_PER_SEC,
};
use uvc_stream::usb::mock::{MockConfig, MockTransport};
use uvc_stream::{Config, DemoConfig, DeviceHandle, DeviceInfo, Frame, StreamProfile};

const INTERFACE: u8 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    init_tracing(&config.log.filter);
    uvc_stream::CONFIG.store(Arc::new(config.clone()));

    info!("uvc-stream launching...");
    let demo = config.demo;
    let info = camera(&demo)?;
    let transport = Arc::new(MockTransport::new(
        MockConfig::new(info.clone()).workers(demo.workers),
    ));
    let device = DeviceHandle::new(transport.clone(), info);

    let ctrl = device.probe_and_commit(StreamProfile {
        interface: Some(INTERFACE),
        format: demo.format,
        width: demo.width,
        height: demo.height,
        fps: demo.fps,
    })?;
    let mut stream = device.open_stream(&ctrl)?;

    // Frames leave the dispatch thread through a small queue; late ones are dropped
    let (tx, rx) = flume::bounded::<Frame>(4);
    stream.start_with_callback(move |frame| {
        let _ = tx.try_send(frame.clone());
    })?;

    let generator = tokio::spawn(generate(transport.clone(), demo.clone()));

    let mut received = 0u64;
    while received < demo.frames {
        tokio::select! {
            frame = rx.recv_async() => {
                let Ok(frame) = frame else { break };
                received += 1;
                info!(
                    sequence = frame.sequence(),
                    bytes = frame.len(),
                    latency_us = frame.timestamp.elapsed().as_micros() as u64,
                    "frame"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
        }
    }

    generator.abort();
    stream.stop()?;
    info!(received, stats = ?stream.stats(), "streaming finished");
    stream.close()?;

    info!("uvc-stream shutting down");
    Ok(())
}

fn init_tracing(filter: &str) {
    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn frame_size(demo: &DemoConfig) -> usize {
    let pixels = usize::from(demo.width) * usize::from(demo.height);
    match demo.format.bits_per_pixel() {
        // compressed: reserve a raw 16bpp frame
        0 => pixels * 2,
        bpp => pixels * usize::from(bpp) / 8,
    }
}

/// Catalog of the simulated camera: one interface offering the configured
/// format and size.
fn camera(demo: &DemoConfig) -> Result<DeviceInfo> {
    let guid = demo
        .format
        .guid()
        .ok_or_else(|| eyre!("{:?} is not a concrete format", demo.format))?;
    if demo.fps == 0 {
        return Err(eyre!("demo frame rate must be positive"));
    }
    let interval = INTERVAL_UNITS_PER_SEC / demo.fps;

    Ok(DeviceInfo {
        uvc_version: 0x0110,
        clock_frequency: 48_000_000,
        streaming: vec![StreamingInterface {
            interface_number: INTERFACE,
            endpoint_address: 0x81,
            formats: vec![FormatDescriptor {
                index: 1,
                guid,
                bits_per_pixel: demo.format.bits_per_pixel(),
                frames: vec![FrameDescriptor {
                    index: 1,
                    width: demo.width,
                    height: demo.height,
                    max_video_frame_buffer_size: u32::try_from(frame_size(demo))?,
                    default_interval: interval,
                    intervals: FrameIntervals::Discrete(vec![interval]),
                }],
            }],
        }],
        quirks: DeviceQuirks::default(),
    })
}

/// Camera side: emit one frame per interval as header-prefixed bulk
/// payloads, toggling the frame ID and marking the last payload EOF.
async fn generate(transport: Arc<MockTransport>, demo: DemoConfig) {
    let size = frame_size(&demo);
    let chunk = demo.payload_size.max(1);
    let period = Duration::from_secs(1) / demo.fps.max(1);
    let mut ticker = tokio::time::interval(period);
    let mut fid = 0u8;

    for sequence in 0u64.. {
        ticker.tick().await;
        let fill = sequence as u8;
        let mut offset = 0;
        while offset < size {
            let len = chunk.min(size - offset);
            offset += len;
            let eof = if offset == size { 0x02 } else { 0 };
            let mut payload = vec![2, fid | eof];
            payload.resize(2 + len, fill);
            transport.deliver_bulk(payload);
        }
        fid ^= 1;
    }
}
