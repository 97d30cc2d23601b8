//! Transfer pool: slot bookkeeping and the completion handler

use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::payload::PayloadOutcome;
use super::{Phase, StreamShared, StreamState};
use crate::control::StreamCtrl;
use crate::error::{Result, TransportError, UvcError};
use crate::usb::{CompletionSink, Transfer, TransferId, TransferKind, TransferStatus, UsbTransport};
use crate::StreamingConfig;

/// Lifecycle of one pre-allocated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Allocated, not handed to the host stack
    Idle,
    Submitted,
    /// Cancel requested, waiting for the host stack to give it back
    Cancelling,
    /// Buffer released, never resubmitted
    Freed,
}

impl SlotState {
    pub fn is_live(self) -> bool {
        matches!(self, SlotState::Submitted | SlotState::Cancelling)
    }
}

/// Shape of the transfers a stream submits, fixed at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferPlan {
    pub interface: u8,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub alt_setting: u8,
    /// Packets per transfer, 1 for bulk
    pub packets: usize,
    /// Bytes per packet, the whole buffer for bulk
    pub packet_len: usize,
    pub timeout: Duration,
}

impl TransferPlan {
    /// Resolve the streaming endpoint and size transfers for `ctrl`.
    /// Isochronous interfaces are switched to the first alternate setting
    /// with enough bandwidth.
    pub fn prepare(
        transport: &dyn UsbTransport,
        ctrl: &StreamCtrl,
        settings: &StreamingConfig,
    ) -> Result<Self> {
        let interface = ctrl.interface;
        let endpoint = transport.resolve_endpoint(interface)?;
        let timeout = settings.transfer_timeout();

        match endpoint.transfer_kind() {
            TransferKind::Bulk => {
                let packet_len = match ctrl.max_payload_transfer_size {
                    0 => ctrl.max_video_frame_size as usize,
                    n => n as usize,
                };
                if packet_len == 0 {
                    return Err(UvcError::InvalidParameter(
                        "negotiated payload size is zero".into(),
                    ));
                }
                Ok(Self {
                    interface,
                    endpoint: endpoint.address,
                    kind: TransferKind::Bulk,
                    alt_setting: 0,
                    packets: 1,
                    packet_len,
                    timeout,
                })
            }
            TransferKind::Isochronous => {
                let payload = (ctrl.max_payload_transfer_size as usize).max(1);
                let alt = endpoint.select_alt_setting(payload).ok_or_else(|| {
                    UvcError::InvalidParameter(format!(
                        "no alternate setting of interface {interface} carries {payload} bytes per packet"
                    ))
                })?;
                transport.set_alt_setting(interface, alt.number)?;

                let packet_len = alt.bytes_per_packet();
                let packets = (ctrl.max_video_frame_size as usize)
                    .div_ceil(packet_len)
                    .clamp(1, settings.max_iso_packets.max(1));
                debug!(
                    interface,
                    alt_setting = alt.number,
                    packet_len,
                    packets,
                    "isochronous transfers"
                );
                Ok(Self {
                    interface,
                    endpoint: endpoint.address,
                    kind: TransferKind::Isochronous,
                    alt_setting: alt.number,
                    packets,
                    packet_len,
                    timeout,
                })
            }
        }
    }

    pub fn transfer(&self, slot: usize) -> Transfer {
        let id = TransferId {
            interface: self.interface,
            slot,
        };
        match self.kind {
            TransferKind::Bulk => Transfer::bulk(id, self.endpoint, self.packet_len, self.timeout),
            TransferKind::Isochronous => Transfer::isochronous(
                id,
                self.endpoint,
                self.packets,
                self.packet_len,
                self.timeout,
            ),
        }
    }
}

impl CompletionSink for StreamShared {
    fn transfer_complete(&self, transfer: Transfer) {
        let slot = transfer.id.slot;
        let mut state = self.lock();

        let slot_state = state.slots.get(slot).copied();
        if !slot_state.is_some_and(SlotState::is_live) {
            warn!(slot, ?slot_state, "completion for a slot that is not in flight");
            return;
        }
        let running = state.phase == Phase::Running && slot_state == Some(SlotState::Submitted);

        match transfer.status {
            TransferStatus::Completed => {
                if running {
                    let published = self.consume(&mut state, &transfer);
                    if published > 0 {
                        self.stats.frames_published(published);
                        self.frame_ready.notify_all();
                    }
                }
                self.resubmit_or_retire(&mut state, transfer, running);
            }
            TransferStatus::Cancelled | TransferStatus::NoDevice => {
                self.retire(&mut state, slot, transfer.status);
            }
            status => {
                debug!(slot, ?status, "transfer failed");
                self.stats.transfer_error();
                self.resubmit_or_retire(&mut state, transfer, running);
            }
        }
    }
}

impl StreamShared {
    /// Feed every payload of a completed transfer to the reassembler.
    /// Returns the number of frames published.
    fn consume(&self, state: &mut StreamState, transfer: &Transfer) -> u64 {
        let mut published = 0;
        match transfer.kind {
            TransferKind::Bulk => {
                published += self.consume_payload(state, transfer.bulk_data());
            }
            TransferKind::Isochronous => {
                for index in 0..transfer.iso_packets.len() {
                    match transfer.iso_packet_data(index) {
                        Some(payload) => published += self.consume_payload(state, payload),
                        None => trace!(slot = transfer.id.slot, index, "bad iso packet skipped"),
                    }
                }
            }
        }
        published
    }

    fn consume_payload(&self, state: &mut StreamState, payload: &[u8]) -> u64 {
        match state.reassembler.process_payload(payload) {
            PayloadOutcome::Empty => 0,
            PayloadOutcome::Dropped(_) => {
                self.stats.payload_dropped();
                0
            }
            PayloadOutcome::Consumed {
                published,
                forced,
                truncated,
            } => {
                if forced {
                    self.stats.forced_swap();
                }
                if truncated > 0 {
                    self.stats.bytes_truncated(truncated);
                }
                u64::from(published)
            }
        }
    }

    fn resubmit_or_retire(&self, state: &mut StreamState, transfer: Transfer, running: bool) {
        let slot = transfer.id.slot;
        if !running {
            self.retire(state, slot, transfer.status);
            return;
        }
        let Some(sink) = self.this.upgrade() else {
            self.retire(state, slot, transfer.status);
            return;
        };

        match self.device.transport.submit(transfer, sink) {
            Ok(()) => self.stats.transfer_resubmitted(),
            Err(error) => {
                warn!(slot, %error, "resubmit failed, retiring transfer");
                self.retire(state, slot, TransferStatus::Error);
            }
        }
    }

    /// Mark `slot` freed and wake whoever waits for it. The transfer and
    /// its buffer are dropped by the caller.
    fn retire(&self, state: &mut StreamState, slot: usize, status: TransferStatus) {
        if state.phase == Phase::Running {
            warn!(slot, ?status, "transfer retired while streaming");
        } else {
            trace!(slot, ?status, "transfer retired");
        }
        state.slots[slot] = SlotState::Freed;
        self.stats.transfer_retired();
        self.slot_released[slot].notify_all();
    }

    /// Cancel every live slot and block until the host stack hands each one
    /// back. Expects the phase to be something other than `Running`.
    pub(crate) fn drain_slots<'a>(
        &'a self,
        mut state: MutexGuard<'a, StreamState>,
    ) -> MutexGuard<'a, StreamState> {
        let transport = &self.device.transport;
        for slot in 0..state.slots.len() {
            if state.slots[slot] != SlotState::Submitted {
                continue;
            }
            let id = TransferId {
                interface: self.interface,
                slot,
            };
            match transport.cancel(id) {
                // NotFound: completion already on its way back
                Ok(()) | Err(TransportError::NotFound) => {
                    state.slots[slot] = SlotState::Cancelling;
                }
                Err(error) => {
                    warn!(slot, %error, "cancel failed, abandoning transfer");
                    state.slots[slot] = SlotState::Freed;
                    self.stats.transfer_retired();
                }
            }
        }

        for slot in 0..state.slots.len() {
            state = self.slot_released[slot]
                .wait_while(state, |s| s.slots[slot].is_live())
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state
    }

    /// Submit a fresh transfer into every slot. On the first failure the
    /// already-submitted slots are drained and the error returned.
    pub(crate) fn submit_all<'a>(
        &'a self,
        mut state: MutexGuard<'a, StreamState>,
        plan: &TransferPlan,
    ) -> (MutexGuard<'a, StreamState>, Result<()>) {
        let Some(sink) = self.this.upgrade() else {
            return (state, Err(UvcError::NotFound));
        };
        let sink: Arc<dyn CompletionSink> = sink;
        for slot in 0..state.slots.len() {
            match self.device.transport.submit(plan.transfer(slot), sink.clone()) {
                Ok(()) => state.slots[slot] = SlotState::Submitted,
                Err(error) => {
                    warn!(slot, %error, "submit failed, rolling back");
                    state.phase = Phase::Stopping;
                    let state = self.drain_slots(state);
                    return (state, Err(error.into()));
                }
            }
        }
        (state, Ok(()))
    }
}
