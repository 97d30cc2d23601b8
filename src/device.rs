//! Device handle: negotiation entry point and stream factory

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::catalog::DeviceInfo;
use crate::control::negotiate::negotiate;
use crate::control::{query_stream_ctrl, ControlSelector, RequestCode, StreamCtrl, StreamRequest};
use crate::error::{Result, UvcError};
use crate::stream::{frame_layout, StreamHandle};
use crate::usb::UsbTransport;
use crate::{StreamingConfig, CONFIG};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct DeviceInner {
    pub(crate) transport: Arc<dyn UsbTransport>,
    info: DeviceInfo,
    claimed: Mutex<HashSet<u8>>,
    /// Interfaces with an open stream
    streams: Mutex<HashSet<u8>>,
    /// Interface being negotiated and how many callers are at it
    negotiating: Mutex<Option<(u8, usize)>>,
}

impl DeviceInner {
    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn claim(&self, interface: u8) -> Result<()> {
        let mut claimed = lock(&self.claimed);
        if claimed.contains(&interface) {
            return Ok(());
        }
        self.transport.claim_interface(interface)?;
        claimed.insert(interface);
        debug!(interface, "interface claimed");
        Ok(())
    }

    fn release(&self, interface: u8) {
        if !lock(&self.claimed).remove(&interface) {
            return;
        }
        match self.transport.release_interface(interface) {
            Ok(()) => debug!(interface, "interface released"),
            Err(error) => warn!(interface, %error, "failed to release interface"),
        }
    }

    pub(crate) fn stream_closed(&self, interface: u8) {
        lock(&self.streams).remove(&interface);
        self.release(interface);
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let claimed: Vec<u8> = lock(&self.claimed).iter().copied().collect();
        for interface in claimed {
            self.release(interface);
        }
    }
}

/// Marks an interface as being negotiated for as long as it lives.
struct NegotiationGuard<'a> {
    active: &'a Mutex<Option<(u8, usize)>>,
}

impl<'a> NegotiationGuard<'a> {
    fn enter(active: &'a Mutex<Option<(u8, usize)>>, interface: u8) -> Result<Self> {
        let mut current = lock(active);
        match current.as_mut() {
            Some((busy, _)) if *busy != interface => {
                return Err(UvcError::AlreadyNegotiating {
                    active: *busy,
                    requested: interface,
                })
            }
            Some((_, callers)) => *callers += 1,
            None => *current = Some((interface, 1)),
        }
        Ok(Self { active })
    }
}

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        let mut current = lock(self.active);
        if let Some((_, callers)) = current.as_mut() {
            *callers -= 1;
            if *callers == 0 {
                *current = None;
            }
        }
    }
}

/// An opened UVC device.
///
/// Cloning is cheap and every clone refers to the same device; claimed
/// interfaces are released when the last clone and the last stream go away.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    pub fn new(transport: Arc<dyn UsbTransport>, info: DeviceInfo) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                transport,
                info,
                claimed: Mutex::new(HashSet::new()),
                streams: Mutex::new(HashSet::new()),
                negotiating: Mutex::new(None),
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Negotiate a stream format with the device.
    ///
    /// A [`StreamProfile`](crate::StreamProfile) is matched against the
    /// catalog first; a [`StreamCtrl`] is probed as given. The returned
    /// block carries whatever the device settled on and is committed by
    /// [`open_stream`](Self::open_stream).
    #[instrument(skip_all)]
    pub fn probe_and_commit(&self, request: impl Into<StreamRequest>) -> Result<StreamCtrl> {
        let inner = &self.inner;
        let resolved = request.into().resolve(&inner.info)?;
        let interface = resolved.ctrl.interface;

        let _negotiating = NegotiationGuard::enter(&inner.negotiating, interface)?;
        inner.claim(interface)?;

        let timeout = CONFIG.load().streaming.control_timeout();
        let ctrl = negotiate(&*inner.transport, &inner.info, resolved, timeout)?;
        info!(
            interface,
            format_index = ctrl.format_index,
            frame_index = ctrl.frame_index,
            frame_interval = ctrl.frame_interval,
            max_video_frame_size = ctrl.max_video_frame_size,
            max_payload_transfer_size = ctrl.max_payload_transfer_size,
            "stream negotiated"
        );
        Ok(ctrl)
    }

    /// Commit `ctrl` and open a stream on its interface with the current
    /// global streaming configuration.
    pub fn open_stream(&self, ctrl: &StreamCtrl) -> Result<StreamHandle> {
        let settings = CONFIG.load().streaming.clone();
        self.open_stream_with(ctrl, settings)
    }

    #[instrument(skip_all, fields(interface = ctrl.interface))]
    pub fn open_stream_with(
        &self,
        ctrl: &StreamCtrl,
        settings: StreamingConfig,
    ) -> Result<StreamHandle> {
        let inner = &self.inner;
        let interface = ctrl.interface;
        let layout = frame_layout(&inner.info, ctrl)?;
        if !lock(&inner.streams).insert(interface) {
            return Err(UvcError::Busy);
        }

        let mut committed = *ctrl;
        let opened = inner.claim(interface).and_then(|()| {
            query_stream_ctrl(
                &*inner.transport,
                &inner.info,
                &mut committed,
                ControlSelector::Commit,
                RequestCode::SetCur,
                settings.control_timeout(),
            )
        });
        if let Err(error) = opened {
            lock(&inner.streams).remove(&interface);
            return Err(error);
        }

        info!(interface, "stream opened");
        Ok(StreamHandle::new(inner.clone(), committed, layout, settings))
    }
}
