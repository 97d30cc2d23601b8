//! In-process stand-in for a host USB stack with a camera behind it.
//!
//! Completions are delivered from the mock's own event threads, the way a
//! real stack calls back from its event loop. Tests and the demo binary
//! script the camera side: which payloads arrive, which transfers fail,
//! when the device disappears, and how it answers probe/commit requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use super::{
    AltSetting, CompletionSink, EndpointInfo, Transfer, TransferId, TransferKind,
    TransferStatus, UsbTransport, REQ_TYPE_GET, REQ_TYPE_SET,
};
use crate::catalog::DeviceInfo;
use crate::control::{ControlSelector, RequestCode};
use crate::error::TransportError;

/// Behaviour of the simulated camera.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub info: DeviceInfo,
    /// Streaming endpoint per interface number
    pub endpoints: HashMap<u8, EndpointInfo>,
    /// `dwMaxPayloadTransferSize` reported on probe
    pub max_payload_transfer_size: u32,
    /// Report `dwMaxVideoFrameSize == 0` like some broken firmware does
    pub report_zero_frame_size: bool,
    /// Frame interval the device substitutes on probe
    pub corrected_interval: Option<u32>,
    /// Number of event threads delivering completions
    pub workers: usize,
}

impl MockConfig {
    /// Bulk endpoints on every streaming interface of `info`.
    pub fn new(info: DeviceInfo) -> Self {
        let endpoints = info
            .streaming
            .iter()
            .map(|s| {
                let endpoint = EndpointInfo {
                    address: s.endpoint_address,
                    alt_settings: vec![AltSetting {
                        number: 0,
                        max_packet_size: 512,
                    }],
                };
                (s.interface_number, endpoint)
            })
            .collect();

        Self {
            info,
            endpoints,
            max_payload_transfer_size: 32 * 1024,
            report_zero_frame_size: false,
            corrected_interval: None,
            workers: 1,
        }
    }

    /// Give `interface` a zero-bandwidth setting followed by one alternate
    /// setting per entry of `packet_sizes`.
    pub fn isochronous(mut self, interface: u8, packet_sizes: &[u16]) -> Self {
        if let Some(endpoint) = self.endpoints.get_mut(&interface) {
            endpoint.alt_settings = std::iter::once(0)
                .chain(packet_sizes.iter().copied())
                .enumerate()
                .map(|(number, max_packet_size)| AltSetting {
                    number: number as u8,
                    max_packet_size,
                })
                .collect();
        }
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// A control request as the device saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

enum Delivery {
    Bulk(Vec<u8>),
    Iso(Vec<Option<Vec<u8>>>),
    Status(TransferStatus),
}

struct Pending {
    transfer: Transfer,
    sink: Arc<dyn CompletionSink>,
}

enum Event {
    Deliver(Delivery),
    Complete(Pending),
    Shutdown,
}

#[derive(Default)]
struct MockState {
    pending: VecDeque<Pending>,
    claimed: HashSet<u8>,
    alt_settings: HashMap<u8, u8>,
    probe: HashMap<u8, Vec<u8>>,
    commit: HashMap<u8, Vec<u8>>,
    control_log: Vec<ControlRequest>,
    failing_control: Option<TransportError>,
    submit_budget: Option<usize>,
    unplugged: bool,
    halts_cleared: Vec<u8>,
    dropped_deliveries: usize,
    in_flight: usize,
}

struct Shared {
    config: MockConfig,
    state: Mutex<MockState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the oldest pending transfer the next piece of camera output.
    fn fill_next(&self, delivery: Delivery) -> Option<Pending> {
        let mut state = self.lock();
        let Some(mut pending) = state.pending.pop_front() else {
            state.dropped_deliveries += 1;
            trace!("no transfer pending, delivery dropped");
            return None;
        };
        drop(state);

        let transfer = &mut pending.transfer;
        match delivery {
            Delivery::Status(status) => {
                transfer.status = status;
                transfer.actual_length = 0;
            }
            Delivery::Bulk(bytes) => {
                fill_packets(transfer, vec![Some(bytes)]);
            }
            Delivery::Iso(packets) => {
                fill_packets(transfer, packets);
            }
        }
        Some(pending)
    }

    fn finish_event(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn answer_probe(&self, interface: u8, block: &mut Vec<u8>) {
        if block.len() < 26 {
            block.resize(26, 0);
        }
        let config = &self.config;
        let frame = config
            .info
            .stream_interface(interface)
            .and_then(|s| s.find_frame_desc(block[2], block[3]))
            .map(|(_, frame)| frame);

        if let Some(frame) = frame {
            let frame_size = if config.report_zero_frame_size {
                0
            } else {
                frame.max_video_frame_buffer_size
            };
            block[18..22].copy_from_slice(&frame_size.to_le_bytes());
        }
        block[22..26].copy_from_slice(&config.max_payload_transfer_size.to_le_bytes());
        if let Some(interval) = config.corrected_interval {
            block[4..8].copy_from_slice(&interval.to_le_bytes());
        }
        if block.len() >= 34 && block[26..30] == [0; 4] {
            block[26..30].copy_from_slice(&config.info.clock_frequency.to_le_bytes());
        }
    }

    fn limits_block(&self, interface: u8, len: usize) -> Vec<u8> {
        let mut block = vec![0u8; len.max(26)];
        if let Some(stream_if) = self.config.info.stream_interface(interface) {
            let formats = &stream_if.formats;
            block[2] = formats.iter().map(|f| f.index).max().unwrap_or(0);
            block[3] = formats
                .iter()
                .flat_map(|f| f.frames.iter().map(|fr| fr.index))
                .max()
                .unwrap_or(0);
            let frame_size = formats
                .iter()
                .flat_map(|f| f.frames.iter().map(|fr| fr.max_video_frame_buffer_size))
                .max()
                .unwrap_or(0);
            block[18..22].copy_from_slice(&frame_size.to_le_bytes());
        }
        block[22..26].copy_from_slice(&self.config.max_payload_transfer_size.to_le_bytes());
        block.truncate(len);
        block
    }
}

fn fill_packets(transfer: &mut Transfer, packets: Vec<Option<Vec<u8>>>) {
    transfer.status = TransferStatus::Completed;
    match transfer.kind {
        TransferKind::Bulk => {
            let bytes = packets.into_iter().flatten().next().unwrap_or_default();
            let n = bytes.len().min(transfer.buffer.len());
            transfer.buffer[..n].copy_from_slice(&bytes[..n]);
            transfer.actual_length = n;
        }
        TransferKind::Isochronous => {
            let mut total = 0;
            let mut packets = packets.into_iter();
            for index in 0..transfer.iso_packets.len() {
                let length = transfer.iso_packets[index].length;
                let (ok, actual) = match packets.next() {
                    Some(Some(bytes)) => {
                        let n = bytes.len().min(length);
                        let start = index * length;
                        transfer.buffer[start..start + n].copy_from_slice(&bytes[..n]);
                        (true, n)
                    }
                    Some(None) => (false, 0),
                    None => (true, 0),
                };
                let packet = &mut transfer.iso_packets[index];
                packet.ok = ok;
                packet.actual_length = actual;
                total += actual;
            }
            transfer.actual_length = total;
        }
    }
}

fn run_worker(shared: Arc<Shared>, events: flume::Receiver<Event>) {
    while let Ok(event) = events.recv() {
        let completion = match event {
            Event::Shutdown => break,
            Event::Complete(pending) => Some(pending),
            Event::Deliver(delivery) => shared.fill_next(delivery),
        };
        if let Some(Pending { transfer, sink }) = completion {
            sink.transfer_complete(transfer);
        }
        shared.finish_event();
    }
}

/// Simulated host stack plus camera.
pub struct MockTransport {
    shared: Arc<Shared>,
    events: flume::Sender<Event>,
    workers: Vec<JoinHandle<()>>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        let (events, rx) = flume::unbounded();
        let workers = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(MockState::default()),
            idle: Condvar::new(),
        });

        let workers = (0..workers)
            .filter_map(|n| {
                let shared = shared.clone();
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("mock-usb-{n}"))
                    .spawn(move || run_worker(shared, rx))
                    .ok()
            })
            .collect();

        Self {
            shared,
            events,
            workers,
        }
    }

    fn post(&self, event: Event) {
        self.shared.lock().in_flight += 1;
        if self.events.send(event).is_err() {
            self.shared.finish_event();
        }
    }

    /// Next pending transfer receives `payload` as one bulk payload (or as
    /// packet 0 of an isochronous transfer).
    pub fn deliver_bulk(&self, payload: impl Into<Vec<u8>>) {
        self.post(Event::Deliver(Delivery::Bulk(payload.into())));
    }

    /// Next pending isochronous transfer receives one payload per packet;
    /// `None` marks a packet the host controller reported as failed.
    pub fn deliver_iso(&self, packets: Vec<Option<Vec<u8>>>) {
        self.post(Event::Deliver(Delivery::Iso(packets)));
    }

    /// Next pending transfer completes with `status` and no data.
    pub fn deliver_status(&self, status: TransferStatus) {
        self.post(Event::Deliver(Delivery::Status(status)));
    }

    /// Block until every scripted event has been handed to its sink.
    pub fn wait_idle(&self) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .idle
            .wait_while(state, |s| s.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Simulate the device going away: every pending transfer completes
    /// with `NoDevice` and further requests fail.
    pub fn unplug(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.shared.lock();
            state.unplugged = true;
            state.pending.drain(..).collect()
        };
        debug!(transfers = drained.len(), "mock device unplugged");
        for mut pending in drained {
            pending.transfer.status = TransferStatus::NoDevice;
            self.post(Event::Complete(pending));
        }
    }

    /// Accept `count` more submissions, then fail every one after that.
    pub fn fail_submissions_after(&self, count: usize) {
        self.shared.lock().submit_budget = Some(count);
    }

    /// Make every control request fail with `error` (or succeed again).
    pub fn fail_control(&self, error: Option<TransportError>) {
        self.shared.lock().failing_control = error;
    }

    pub fn pending_transfers(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn control_log(&self) -> Vec<ControlRequest> {
        self.shared.lock().control_log.clone()
    }

    pub fn committed(&self, interface: u8) -> Option<Vec<u8>> {
        self.shared.lock().commit.get(&interface).cloned()
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.shared.lock().claimed.contains(&interface)
    }

    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.shared.lock().alt_settings.get(&interface).copied()
    }

    pub fn halts_cleared(&self) -> Vec<u8> {
        self.shared.lock().halts_cleared.clone()
    }

    /// Deliveries that found no pending transfer.
    pub fn dropped_deliveries(&self) -> usize {
        self.shared.lock().dropped_deliveries
    }
}

impl UsbTransport for MockTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.shared.lock();
        if state.unplugged {
            return Err(TransportError::NoDevice);
        }
        if let Some(error) = state.failing_control.clone() {
            return Err(error);
        }
        state.control_log.push(ControlRequest {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });

        let interface = index as u8;
        let probe = match (value >> 8) as u8 {
            s if s == ControlSelector::Probe as u8 => true,
            s if s == ControlSelector::Commit as u8 => false,
            _ => return Err(TransportError::Pipe),
        };
        let blocks = if probe {
            &mut state.probe
        } else {
            &mut state.commit
        };

        let answer = match (request_type, request) {
            (REQ_TYPE_SET, r) if r == RequestCode::SetCur as u8 => {
                blocks.insert(interface, data.to_vec());
                return Ok(data.len());
            }
            (REQ_TYPE_GET, r) if r == RequestCode::GetCur as u8 => {
                let mut block = blocks
                    .get(&interface)
                    .cloned()
                    .unwrap_or_else(|| vec![0; data.len()]);
                if probe {
                    self.shared.answer_probe(interface, &mut block);
                }
                block
            }
            (REQ_TYPE_GET, r)
                if r == RequestCode::GetMax as u8
                    || r == RequestCode::GetMin as u8
                    || r == RequestCode::GetDef as u8 =>
            {
                self.shared.limits_block(interface, data.len())
            }
            _ => return Err(TransportError::Pipe),
        };

        let n = answer.len().min(data.len());
        data[..n].copy_from_slice(&answer[..n]);
        Ok(n)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if state.unplugged {
            return Err(TransportError::NoDevice);
        }
        state.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        if self.shared.lock().claimed.remove(&interface) {
            Ok(())
        } else {
            Err(TransportError::NotFound)
        }
    }

    fn resolve_endpoint(&self, interface: u8) -> Result<EndpointInfo, TransportError> {
        self.shared
            .config
            .endpoints
            .get(&interface)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let known = self
            .shared
            .config
            .endpoints
            .get(&interface)
            .is_some_and(|e| e.alt_settings.iter().any(|a| a.number == alt_setting));
        if !known {
            return Err(TransportError::InvalidParam);
        }
        self.shared.lock().alt_settings.insert(interface, alt_setting);
        Ok(())
    }

    fn submit(
        &self,
        mut transfer: Transfer,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if state.unplugged {
            return Err(TransportError::NoDevice);
        }
        match state.submit_budget {
            Some(0) => return Err(TransportError::Io),
            Some(ref mut left) => *left -= 1,
            None => {}
        }

        transfer.status = TransferStatus::Pending;
        transfer.actual_length = 0;
        for packet in &mut transfer.iso_packets {
            packet.actual_length = 0;
            packet.ok = false;
        }
        state.pending.push_back(Pending { transfer, sink });
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<(), TransportError> {
        let pending = {
            let mut state = self.shared.lock();
            let position = state
                .pending
                .iter()
                .position(|p| p.transfer.id == id)
                .ok_or(TransportError::NotFound)?;
            state.pending.remove(position)
        };
        if let Some(mut pending) = pending {
            pending.transfer.status = TransferStatus::Cancelled;
            self.post(Event::Complete(pending));
        }
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        self.shared.lock().halts_cleared.push(endpoint);
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.events.send(Event::Shutdown);
        }
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // the last handle may be released from inside a completion
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        DeviceQuirks, FormatDescriptor, FrameDescriptor, FrameFormat, FrameIntervals,
        StreamingInterface,
    };

    struct Collect(flume::Sender<Transfer>);

    impl CompletionSink for Collect {
        fn transfer_complete(&self, transfer: Transfer) {
            let _ = self.0.send(transfer);
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            uvc_version: 0x0100,
            clock_frequency: 30_000_000,
            streaming: vec![StreamingInterface {
                interface_number: 1,
                endpoint_address: 0x81,
                formats: vec![FormatDescriptor {
                    index: 1,
                    guid: FrameFormat::Yuyv.guid().unwrap(),
                    bits_per_pixel: 16,
                    frames: vec![FrameDescriptor {
                        index: 1,
                        width: 160,
                        height: 120,
                        max_video_frame_buffer_size: 38_400,
                        default_interval: 333_333,
                        intervals: FrameIntervals::Discrete(vec![333_333]),
                    }],
                }],
            }],
            quirks: DeviceQuirks::default(),
        }
    }

    fn id(slot: usize) -> TransferId {
        TransferId { interface: 1, slot }
    }

    #[test]
    fn deliveries_fill_pending_transfers_in_order() {
        let mock = MockTransport::new(MockConfig::new(info()));
        let (tx, rx) = flume::unbounded();
        let sink: Arc<dyn CompletionSink> = Arc::new(Collect(tx));
        for slot in 0..2 {
            let transfer = Transfer::bulk(id(slot), 0x81, 64, Duration::ZERO);
            mock.submit(transfer, sink.clone()).unwrap();
        }

        mock.deliver_bulk(vec![2, 0, 9, 9]);
        mock.deliver_status(TransferStatus::Stall);
        mock.deliver_bulk(vec![2, 0]);
        mock.wait_idle();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.id.slot, 0);
        assert_eq!(first.bulk_data(), &[2, 0, 9, 9][..]);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.status, TransferStatus::Stall);
        assert_eq!(mock.dropped_deliveries(), 1);
    }

    #[test]
    fn cancel_returns_the_transfer_once() {
        let mock = MockTransport::new(MockConfig::new(info()));
        let (tx, rx) = flume::unbounded();
        let sink: Arc<dyn CompletionSink> = Arc::new(Collect(tx));
        mock.submit(Transfer::bulk(id(3), 0x81, 64, Duration::ZERO), sink)
            .unwrap();

        mock.cancel(id(3)).unwrap();
        assert_eq!(mock.cancel(id(3)), Err(TransportError::NotFound));
        mock.wait_idle();
        assert_eq!(rx.try_recv().unwrap().status, TransferStatus::Cancelled);
        assert_eq!(mock.pending_transfers(), 0);
    }

    #[test]
    fn probe_answers_carry_sizes() {
        let mock = MockTransport::new(MockConfig::new(info()));
        let mut block = vec![0u8; 26];
        block[2] = 1;
        block[3] = 1;
        mock.control_transfer(REQ_TYPE_SET, RequestCode::SetCur as u8, 0x0100, 1, &mut block, Duration::ZERO)
            .unwrap();

        let mut answer = vec![0u8; 26];
        let n = mock
            .control_transfer(REQ_TYPE_GET, RequestCode::GetCur as u8, 0x0100, 1, &mut answer, Duration::ZERO)
            .unwrap();
        assert_eq!(n, 26);
        assert_eq!(&answer[18..22], &38_400u32.to_le_bytes());
        assert_eq!(&answer[22..26], &(32u32 * 1024).to_le_bytes());

        assert_eq!(
            mock.control_transfer(REQ_TYPE_GET, 0x86, 0x0300, 1, &mut answer, Duration::ZERO),
            Err(TransportError::Pipe)
        );
        mock.unplug();
        assert_eq!(mock.claim_interface(1), Err(TransportError::NoDevice));
    }
}
