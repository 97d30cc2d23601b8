//! Seam between the engine and a host USB stack.
//!
//! The engine never talks to a concrete USB library. A host stack implements
//! [`UsbTransport`]; completed transfers flow back through the
//! [`CompletionSink`] handed over at submission time, from whatever thread
//! the stack uses for event handling.

pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

/// `bmRequestType` for class-specific interface requests, host to device
pub const REQ_TYPE_SET: u8 = 0x21;
/// `bmRequestType` for class-specific interface requests, device to host
pub const REQ_TYPE_GET: u8 = 0xa1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Bulk,
    Isochronous,
}

/// Identifies one transfer slot of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub interface: u8,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not yet completed by the host stack
    Pending,
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// Per-packet outcome of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub length: usize,
    pub actual_length: usize,
    pub ok: bool,
}

/// A transfer buffer together with everything the host stack reports
/// about its completion.
///
/// Ownership moves into the transport on submit and back to the engine on
/// completion, so a buffer is never reachable from both sides at once.
#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub timeout: Duration,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
    pub status: TransferStatus,
    pub iso_packets: Vec<IsoPacket>,
}

impl Transfer {
    pub fn bulk(id: TransferId, endpoint: u8, length: usize, timeout: Duration) -> Self {
        Self {
            id,
            endpoint,
            kind: TransferKind::Bulk,
            timeout,
            buffer: vec![0; length],
            actual_length: 0,
            status: TransferStatus::Pending,
            iso_packets: Vec::new(),
        }
    }

    pub fn isochronous(
        id: TransferId,
        endpoint: u8,
        packets: usize,
        packet_length: usize,
        timeout: Duration,
    ) -> Self {
        let packet = IsoPacket {
            length: packet_length,
            actual_length: 0,
            ok: false,
        };
        Self {
            id,
            endpoint,
            kind: TransferKind::Isochronous,
            timeout,
            buffer: vec![0; packets * packet_length],
            actual_length: 0,
            status: TransferStatus::Pending,
            iso_packets: vec![packet; packets],
        }
    }

    /// Received bytes of isochronous packet `index`, `None` when the packet
    /// failed or lies outside the buffer.
    pub fn iso_packet_data(&self, index: usize) -> Option<&[u8]> {
        let packet = self.iso_packets.get(index)?;
        if !packet.ok {
            return None;
        }
        let start = index * packet.length;
        self.buffer.get(start..start + packet.actual_length.min(packet.length))
    }

    /// Bytes received by a bulk transfer.
    pub fn bulk_data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Receives transfers back from the host stack once they finish, fail or
/// are cancelled.
pub trait CompletionSink: Send + Sync {
    fn transfer_complete(&self, transfer: Transfer);
}

/// One alternate setting of a streaming interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltSetting {
    pub number: u8,
    /// Raw `wMaxPacketSize` of the streaming endpoint in this setting
    pub max_packet_size: u16,
}

impl AltSetting {
    /// Bytes per service interval, including high-bandwidth transactions.
    pub fn bytes_per_packet(&self) -> usize {
        let size = usize::from(self.max_packet_size);
        (size & 0x07ff) * (((size >> 11) & 3) + 1)
    }
}

/// Streaming endpoint of an interface as seen by the host stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub alt_settings: Vec<AltSetting>,
}

impl EndpointInfo {
    /// A streaming interface is isochronous iff it has more than one
    /// alternate setting.
    pub fn transfer_kind(&self) -> TransferKind {
        if self.alt_settings.len() > 1 {
            TransferKind::Isochronous
        } else {
            TransferKind::Bulk
        }
    }

    /// First alternate setting able to carry `payload` bytes per packet.
    pub fn select_alt_setting(&self, payload: usize) -> Option<AltSetting> {
        self.alt_settings
            .iter()
            .copied()
            .filter(|alt| alt.number != 0)
            .find(|alt| alt.bytes_per_packet() >= payload)
    }
}

/// Host USB stack operations the engine relies on.
///
/// Implementations must never invoke a [`CompletionSink`] synchronously
/// from inside [`submit`](UsbTransport::submit) or
/// [`cancel`](UsbTransport::cancel): the engine calls both while holding
/// its stream lock.
pub trait UsbTransport: Send + Sync {
    /// Run a control transfer on endpoint 0 and return the number of bytes
    /// moved.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn resolve_endpoint(&self, interface: u8) -> Result<EndpointInfo, TransportError>;

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    fn submit(&self, transfer: Transfer, sink: Arc<dyn CompletionSink>)
        -> Result<(), TransportError>;

    /// Request cancellation. The transfer later completes with
    /// [`TransferStatus::Cancelled`]; `NotFound` means it is already on its
    /// way back to the sink.
    fn cancel(&self, id: TransferId) -> Result<(), TransportError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_shape_picks_transport() {
        let bulk = EndpointInfo {
            address: 0x81,
            alt_settings: vec![AltSetting {
                number: 0,
                max_packet_size: 512,
            }],
        };
        assert_eq!(bulk.transfer_kind(), TransferKind::Bulk);

        let iso = EndpointInfo {
            address: 0x81,
            alt_settings: vec![
                AltSetting {
                    number: 0,
                    max_packet_size: 0,
                },
                AltSetting {
                    number: 1,
                    max_packet_size: 512,
                },
                // 3 transactions of 1024 bytes
                AltSetting {
                    number: 2,
                    max_packet_size: 0x1400,
                },
            ],
        };
        assert_eq!(iso.transfer_kind(), TransferKind::Isochronous);
        assert_eq!(iso.select_alt_setting(400).map(|a| a.number), Some(1));
        assert_eq!(iso.select_alt_setting(3000).map(|a| a.number), Some(2));
        assert_eq!(iso.select_alt_setting(3072 + 1), None);
    }

    #[test]
    fn iso_packets_are_sliced_by_packet_length() {
        let id = TransferId {
            interface: 1,
            slot: 0,
        };
        let mut transfer = Transfer::isochronous(id, 0x81, 3, 8, Duration::ZERO);
        transfer.buffer[8..11].copy_from_slice(&[1, 2, 3]);
        transfer.iso_packets[1] = IsoPacket {
            length: 8,
            actual_length: 3,
            ok: true,
        };

        assert_eq!(transfer.iso_packet_data(0), None);
        assert_eq!(transfer.iso_packet_data(1), Some(&[1u8, 2, 3][..]));
        assert_eq!(transfer.iso_packet_data(3), None);
    }
}
