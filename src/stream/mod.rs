//! Open streams and their lifecycle.
//!
//! A [`StreamHandle`] owns one negotiated stream on one interface. All
//! state the USB completion threads touch lives in [`StreamShared`] behind
//! a single mutex; the handle, the dispatch thread and every in-flight
//! transfer hold it through an `Arc`.

mod delivery;
mod frame;
pub mod payload;
mod stats;
mod transfer;

pub use delivery::{FrameCallback, PollTimeout};
pub use frame::{Frame, FrameMetadata};
pub use stats::StatsSnapshot;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{DeviceInfo, FrameFormat};
use crate::control::{query_stream_ctrl, ControlSelector, RequestCode, StreamCtrl};
use crate::device::DeviceInner;
use crate::error::{Result, UvcError};
use crate::usb::TransferKind;
use crate::StreamingConfig;
use frame::FrameLayout;
use payload::Reassembler;
use stats::StreamStats;
use transfer::{SlotState, TransferPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Opened,
    Running,
    Stopping,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Opened => "opened",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Closed => "closed",
        }
    }
}

/// Everything guarded by the stream lock.
pub(crate) struct StreamState {
    phase: Phase,
    ctrl: StreamCtrl,
    layout: FrameLayout,
    reassembler: Reassembler,
    slots: Vec<SlotState>,
    plan: Option<TransferPlan>,
    has_callback: bool,
    /// Newest sequence handed to a poller
    last_polled: u64,
}

impl StreamState {
    /// Copy of the published frame.
    fn frame(&self) -> Frame {
        let held = self.reassembler.held();
        let layout = &self.layout;
        Frame {
            data: Bytes::copy_from_slice(self.reassembler.held_data()),
            metadata: Bytes::copy_from_slice(self.reassembler.held_metadata()),
            meta: Arc::new(FrameMetadata {
                sequence: held.sequence,
                width: layout.width,
                height: layout.height,
                stride: layout.stride,
                bits_per_pixel: layout.bits_per_pixel,
                format: layout.format,
                pts: (held.pts != 0).then_some(held.pts),
                scr: (held.scr != 0).then_some(held.scr),
            }),
            timestamp: Instant::now(),
        }
    }
}

pub(crate) struct StreamShared {
    this: Weak<StreamShared>,
    device: Arc<DeviceInner>,
    interface: u8,
    settings: StreamingConfig,
    state: Mutex<StreamState>,
    /// Broadcast on every publish and on stop
    frame_ready: Condvar,
    /// One per slot, signalled when the slot is freed
    slot_released: Box<[Condvar]>,
    stats: StreamStats,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frame geometry for `ctrl`. Indices missing from the interface's
/// catalog are rejected.
pub(crate) fn frame_layout(info: &DeviceInfo, ctrl: &StreamCtrl) -> Result<FrameLayout> {
    let Some(stream_if) = info.stream_interface(ctrl.interface) else {
        return Err(UvcError::InvalidParameter(format!(
            "no streaming interface {}",
            ctrl.interface
        )));
    };
    let Some((format, frame)) = stream_if.find_frame_desc(ctrl.format_index, ctrl.frame_index)
    else {
        return Err(UvcError::InvalidParameter(format!(
            "no format {} frame {} on interface {}",
            ctrl.format_index, ctrl.frame_index, ctrl.interface
        )));
    };
    let frame_format = format.frame_format();
    let width = u32::from(frame.width);
    let bits_per_pixel = match frame_format.bits_per_pixel() {
        0 => format.bits_per_pixel,
        bpp => bpp,
    };
    let stride = match frame_format {
        FrameFormat::Unknown => width * u32::from(bits_per_pixel) / 8,
        known => known.stride(width),
    };
    Ok(FrameLayout {
        format: frame_format,
        width,
        height: u32::from(frame.height),
        stride,
        bits_per_pixel,
    })
}

/// Bytes to reserve per frame buffer: device answer, then descriptor, then
/// the configured fallback.
fn frame_capacity(info: &DeviceInfo, ctrl: &StreamCtrl, settings: &StreamingConfig) -> usize {
    if ctrl.max_video_frame_size != 0 {
        return ctrl.max_video_frame_size as usize;
    }
    info.stream_interface(ctrl.interface)
        .and_then(|s| s.find_frame_desc(ctrl.format_index, ctrl.frame_index))
        .map(|(_, frame)| frame.max_video_frame_buffer_size as usize)
        .filter(|&size| size != 0)
        .unwrap_or(settings.frame_buffer_size)
}

/// An open stream on one streaming interface.
///
/// Dropping the handle closes the stream.
pub struct StreamHandle {
    shared: Arc<StreamShared>,
    dispatch: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Build the stream context for an interface that is already claimed
    /// and committed.
    pub(crate) fn new(
        device: Arc<DeviceInner>,
        ctrl: StreamCtrl,
        layout: FrameLayout,
        settings: StreamingConfig,
    ) -> Self {
        let info = device.info();
        let reassembler = Reassembler::new(
            frame_capacity(info, &ctrl, &settings),
            settings.metadata_capacity,
            info.quirks.isight,
        );
        let slot_count = settings.transfer_count.max(1);

        let shared = Arc::new_cyclic(|this| StreamShared {
            this: this.clone(),
            device,
            interface: ctrl.interface,
            state: Mutex::new(StreamState {
                phase: Phase::Opened,
                ctrl,
                layout,
                reassembler,
                slots: vec![SlotState::Idle; slot_count],
                plan: None,
                has_callback: false,
                last_polled: 0,
            }),
            frame_ready: Condvar::new(),
            slot_released: (0..slot_count).map(|_| Condvar::new()).collect(),
            stats: StreamStats::default(),
            settings,
        });

        Self {
            shared,
            dispatch: None,
        }
    }

    pub fn interface(&self) -> u8 {
        self.shared.interface
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    /// The control block this stream was committed with.
    pub fn ctrl(&self) -> StreamCtrl {
        self.shared.lock().ctrl
    }

    /// Transfers currently owned by the host stack.
    pub fn live_transfers(&self) -> usize {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|s| s.is_live())
            .count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Start streaming for frames pulled with [`get_frame`](Self::get_frame).
    pub fn start(&mut self) -> Result<()> {
        self.start_inner(None)
    }

    /// Start streaming and hand every new frame to `callback` on a
    /// dedicated thread. The frame is only borrowed for the call.
    pub fn start_with_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.start_inner(Some(Box::new(callback)))
    }

    #[instrument(skip_all, fields(interface = self.shared.interface))]
    fn start_inner(&mut self, callback: Option<FrameCallback>) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        match state.phase {
            Phase::Opened => {}
            Phase::Running => return Err(UvcError::Busy),
            other => {
                return Err(UvcError::InvalidState {
                    expected: Phase::Opened.as_str(),
                    actual: other.as_str(),
                })
            }
        }

        state.layout = frame_layout(shared.device.info(), &state.ctrl)?;
        let transport = &*shared.device.transport;
        let plan = TransferPlan::prepare(transport, &state.ctrl, &shared.settings)?;

        let held = state.reassembler.held_sequence();
        state.phase = Phase::Running;
        state.has_callback = callback.is_some();
        state.last_polled = held;
        state.plan = Some(plan);
        state.slots.fill(SlotState::Idle);

        let (mut state, submitted) = shared.submit_all(state, &plan);
        if let Err(error) = submitted {
            Self::rolled_back(&mut state);
            drop(state);
            shared.reset_endpoint(&plan);
            return Err(error);
        }
        drop(state);

        if let Some(callback) = callback {
            match delivery::spawn_dispatch(shared.clone(), callback, held) {
                Ok(handle) => self.dispatch = Some(handle),
                Err(error) => {
                    warn!(%error, "dispatch thread failed to start, rolling back");
                    let mut state = shared.lock();
                    state.phase = Phase::Stopping;
                    let mut state = shared.drain_slots(state);
                    Self::rolled_back(&mut state);
                    drop(state);
                    shared.reset_endpoint(&plan);
                    return Err(error.into());
                }
            }
        }

        info!(
            kind = ?plan.kind,
            transfers = shared.settings.transfer_count.max(1),
            buffer = plan.packets * plan.packet_len,
            callback = self.dispatch.is_some(),
            "stream started"
        );
        Ok(())
    }

    fn rolled_back(state: &mut StreamState) {
        state.phase = Phase::Opened;
        state.has_callback = false;
        state.plan = None;
    }

    /// Cancel every in-flight transfer and wait until the host stack has
    /// returned all of them. Joins the dispatch thread, if any.
    #[instrument(skip_all, fields(interface = self.shared.interface))]
    pub fn stop(&mut self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.phase != Phase::Running {
            return Err(UvcError::InvalidState {
                expected: Phase::Running.as_str(),
                actual: state.phase.as_str(),
            });
        }

        state.phase = Phase::Stopping;
        shared.frame_ready.notify_all();
        let mut state = shared.drain_slots(state);

        state.reassembler.reset();
        let plan = state.plan.take();
        state.has_callback = false;
        state.phase = Phase::Opened;
        shared.frame_ready.notify_all();
        drop(state);

        if let Some(handle) = self.dispatch.take() {
            if handle.thread().id() == thread::current().id() {
                debug!("stop called from the frame callback, not joining");
            } else if handle.join().is_err() {
                warn!("frame callback panicked");
            }
        }
        if let Some(plan) = plan {
            shared.reset_endpoint(&plan);
        }

        info!(stats = ?shared.stats.snapshot(), "stream stopped");
        Ok(())
    }

    /// Return the next frame newer than the last one polled.
    ///
    /// `timeout` follows the microsecond convention of [`PollTimeout`]:
    /// `-1` never blocks, `0` blocks until a frame arrives, a positive
    /// value fails with [`UvcError::Timeout`] once it elapses.
    pub fn get_frame(&self, timeout: impl Into<PollTimeout>) -> Result<Option<Frame>> {
        self.shared.poll_frame(timeout.into())
    }

    /// Commit a different control block on this stream's interface while
    /// it is not streaming.
    #[instrument(skip_all, fields(interface = self.shared.interface))]
    pub fn reconfigure(&mut self, ctrl: &StreamCtrl) -> Result<()> {
        let shared = &self.shared;
        if ctrl.interface != shared.interface {
            return Err(UvcError::InvalidParameter(format!(
                "control block targets interface {}, stream is on {}",
                ctrl.interface, shared.interface
            )));
        }

        let mut state = shared.lock();
        match state.phase {
            Phase::Opened => {}
            Phase::Running => return Err(UvcError::Busy),
            other => {
                return Err(UvcError::InvalidState {
                    expected: Phase::Opened.as_str(),
                    actual: other.as_str(),
                })
            }
        }

        let info = shared.device.info();
        let layout = frame_layout(info, ctrl)?;
        let mut committed = *ctrl;
        query_stream_ctrl(
            &*shared.device.transport,
            info,
            &mut committed,
            ControlSelector::Commit,
            RequestCode::SetCur,
            shared.settings.control_timeout(),
        )?;

        state.layout = layout;
        state
            .reassembler
            .resize(frame_capacity(info, &committed, &shared.settings));
        state.ctrl = committed;
        debug!(
            format_index = committed.format_index,
            frame_index = committed.frame_index,
            "stream recommitted"
        );
        Ok(())
    }

    /// Stop if running and release the interface.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let phase = self.phase();
        if phase == Phase::Closed {
            return Ok(());
        }
        let stopped = if phase == Phase::Running {
            self.stop()
        } else {
            Ok(())
        };

        self.shared.lock().phase = Phase::Closed;
        self.shared.device.stream_closed(self.shared.interface);
        info!(interface = self.shared.interface, "stream closed");
        stopped
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(%error, "failed to close stream");
        }
    }
}

impl StreamShared {
    /// Clear a stalled endpoint after streaming and park isochronous
    /// interfaces on the zero-bandwidth alternate setting.
    fn reset_endpoint(&self, plan: &TransferPlan) {
        let transport = &self.device.transport;
        if let Err(error) = transport.clear_halt(plan.endpoint) {
            debug!(%error, endpoint = plan.endpoint, "clear halt failed");
        }
        if plan.kind == TransferKind::Isochronous {
            if let Err(error) = transport.set_alt_setting(plan.interface, 0) {
                debug!(%error, interface = plan.interface, "could not reset alternate setting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FormatDescriptor, FrameDescriptor, FrameIntervals, StreamingInterface};

    fn info() -> DeviceInfo {
        DeviceInfo {
            uvc_version: 0x0110,
            clock_frequency: 48_000_000,
            streaming: vec![StreamingInterface {
                interface_number: 1,
                endpoint_address: 0x81,
                formats: vec![FormatDescriptor {
                    index: 1,
                    guid: FrameFormat::Nv12.guid().unwrap_or_default(),
                    bits_per_pixel: 12,
                    frames: vec![FrameDescriptor {
                        index: 1,
                        width: 320,
                        height: 240,
                        max_video_frame_buffer_size: 115_200,
                        default_interval: 333_333,
                        intervals: FrameIntervals::Discrete(vec![333_333]),
                    }],
                }],
            }],
            quirks: Default::default(),
        }
    }

    #[test]
    fn layout_follows_the_committed_frame() {
        let ctrl = StreamCtrl {
            interface: 1,
            format_index: 1,
            frame_index: 1,
            ..StreamCtrl::default()
        };
        let layout = frame_layout(&info(), &ctrl).unwrap();
        assert_eq!(layout.format, FrameFormat::Nv12);
        assert_eq!((layout.width, layout.height), (320, 240));
        assert_eq!(layout.stride, 320);
        assert_eq!(layout.bits_per_pixel, 12);
    }

    #[test]
    fn layout_rejects_indices_outside_the_catalog() {
        let unlisted = StreamCtrl {
            interface: 1,
            format_index: 9,
            frame_index: 9,
            ..StreamCtrl::default()
        };
        assert!(matches!(
            frame_layout(&info(), &unlisted),
            Err(UvcError::InvalidParameter(_))
        ));
        assert!(matches!(
            frame_layout(&info(), &StreamCtrl::default()),
            Err(UvcError::InvalidParameter(_))
        ));
    }

    #[test]
    fn frame_capacity_fallbacks() {
        let settings = StreamingConfig::default();
        let mut ctrl = StreamCtrl {
            interface: 1,
            format_index: 1,
            frame_index: 1,
            max_video_frame_size: 4096,
            ..StreamCtrl::default()
        };
        assert_eq!(frame_capacity(&info(), &ctrl, &settings), 4096);

        ctrl.max_video_frame_size = 0;
        assert_eq!(frame_capacity(&info(), &ctrl, &settings), 115_200);

        ctrl.frame_index = 9;
        assert_eq!(
            frame_capacity(&info(), &ctrl, &settings),
            settings.frame_buffer_size
        );
    }
}
