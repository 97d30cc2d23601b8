//! Payload-to-frame reassembly.
//!
//! Every completed transfer is split into payloads (one per bulk transfer,
//! one per isochronous packet) and each payload goes through
//! [`Reassembler::process_payload`]. Image bytes accumulate in the "out"
//! buffer until the device marks end-of-frame or toggles the frame-ID bit,
//! at which point "out" and "hold" trade places and the completed frame
//! becomes visible to consumers.

use tracing::{debug, trace};

/// bmHeaderInfo bits
const HEADER_FID: u8 = 1 << 0;
const HEADER_EOF: u8 = 1 << 1;
const HEADER_PTS: u8 = 1 << 2;
const HEADER_SCR: u8 = 1 << 3;
const HEADER_ERR: u8 = 1 << 6;

/// Header packets from legacy iSight cameras carry this tag at byte 2 or 3.
const ISIGHT_TAG: [u8; 12] = [
    0x11, 0x22, 0x33, 0x44, 0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xfa, 0xce,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Declared header length exceeds the payload
    BadHeader,
    /// Device flagged a transmission error in the header
    ErrorBit,
}

/// What one payload did to the reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
    Empty,
    Dropped(DropReason),
    Consumed {
        /// Frames published while handling this payload (0, 1 or 2)
        published: u8,
        /// A frame was closed by a frame-ID toggle instead of an EOF mark
        forced: bool,
        /// Image bytes that did not fit into the frame buffer
        truncated: usize,
    },
}

/// Bookkeeping for the frame currently sitting in "hold".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldFrame {
    /// 0 until the first frame is published
    pub sequence: u64,
    pub bytes: usize,
    pub metadata_bytes: usize,
    pub pts: u32,
    pub scr: u32,
}

/// Per-stream reassembly state.
///
/// Frame and metadata buffers are double-buffered; a swap exchanges them
/// and never copies image data.
pub struct Reassembler {
    isight: bool,
    fid: u8,
    next_sequence: u64,
    got_bytes: usize,
    pts: u32,
    last_scr: u32,
    out: Box<[u8]>,
    hold: Box<[u8]>,
    meta_out: Box<[u8]>,
    meta_hold: Box<[u8]>,
    meta_bytes: usize,
    held: HeldFrame,
}

impl Reassembler {
    pub fn new(frame_capacity: usize, metadata_capacity: usize, isight: bool) -> Self {
        Self {
            isight,
            fid: 0,
            next_sequence: 1,
            got_bytes: 0,
            pts: 0,
            last_scr: 0,
            out: vec![0; frame_capacity].into_boxed_slice(),
            hold: vec![0; frame_capacity].into_boxed_slice(),
            meta_out: vec![0; metadata_capacity].into_boxed_slice(),
            meta_hold: vec![0; metadata_capacity].into_boxed_slice(),
            meta_bytes: 0,
            held: HeldFrame::default(),
        }
    }

    /// Forget the partially assembled frame. The published frame and the
    /// sequence counter survive so sequence numbers keep increasing.
    pub fn reset(&mut self) {
        self.fid = 0;
        self.got_bytes = 0;
        self.pts = 0;
        self.last_scr = 0;
        self.meta_bytes = 0;
    }

    pub fn got_bytes(&self) -> usize {
        self.got_bytes
    }

    pub fn fid(&self) -> u8 {
        self.fid
    }

    pub fn frame_capacity(&self) -> usize {
        self.out.len()
    }

    pub fn held(&self) -> HeldFrame {
        self.held
    }

    pub fn held_sequence(&self) -> u64 {
        self.held.sequence
    }

    pub fn held_data(&self) -> &[u8] {
        &self.hold[..self.held.bytes]
    }

    pub fn held_metadata(&self) -> &[u8] {
        &self.meta_hold[..self.held.metadata_bytes]
    }

    /// Reallocate the frame buffers for a new negotiated frame size. The
    /// partial frame is discarded; the published one is kept, truncated
    /// if it no longer fits.
    pub fn resize(&mut self, frame_capacity: usize) {
        if frame_capacity == self.out.len() {
            return;
        }
        let mut hold = vec![0; frame_capacity].into_boxed_slice();
        let kept = self.held.bytes.min(frame_capacity);
        hold[..kept].copy_from_slice(&self.hold[..kept]);
        self.held.bytes = kept;
        self.hold = hold;
        self.out = vec![0; frame_capacity].into_boxed_slice();
        self.reset();
    }

    /// Header length and image length of `payload`, `None` for the header
    /// when the payload has none at all.
    fn split(&self, payload: &[u8]) -> (Option<usize>, usize) {
        let tagged = |at: usize| payload.get(at..at + ISIGHT_TAG.len()) == Some(&ISIGHT_TAG[..]);
        if self.isight && !tagged(2) && !tagged(3) {
            // untagged iSight packets are pure image data
            return (None, payload.len());
        }
        let header_len = usize::from(payload[0]);
        let data_len = if self.isight {
            0
        } else {
            payload.len().saturating_sub(header_len)
        };
        (Some(header_len), data_len)
    }

    pub fn process_payload(&mut self, payload: &[u8]) -> PayloadOutcome {
        if payload.is_empty() {
            return PayloadOutcome::Empty;
        }

        let (header, data_len) = self.split(payload);
        let header_len = header.unwrap_or(0);
        if header_len > payload.len() {
            debug!(
                payload_len = payload.len(),
                header_len, "bogus payload header, dropping"
            );
            return PayloadOutcome::Dropped(DropReason::BadHeader);
        }

        if header.is_some() && header_len <= self.meta_out.len() {
            self.meta_out[..header_len].copy_from_slice(&payload[..header_len]);
            self.meta_bytes = header_len;
        }

        let mut published = 0;
        let mut forced = false;
        let mut info = 0;

        if header_len >= 2 {
            info = payload[1];
            if info & HEADER_ERR != 0 {
                debug!("payload error bit set, dropping");
                return PayloadOutcome::Dropped(DropReason::ErrorBit);
            }

            let fid = info & HEADER_FID;
            if fid != self.fid && self.got_bytes != 0 {
                // frame ID flipped with data pending: the device never sent
                // EOF for the previous frame
                self.swap();
                published += 1;
                forced = true;
            }
            self.fid = fid;

            let header_bytes = &payload[..header_len];
            let mut offset = 2;
            if info & HEADER_PTS != 0 {
                if let Some(pts) = read_u32(header_bytes, offset) {
                    self.pts = pts;
                }
                offset += 4;
            }
            if info & HEADER_SCR != 0 {
                // SOF token counter in the trailing two bytes is ignored
                if let Some(scr) = read_u32(header_bytes, offset) {
                    self.last_scr = scr;
                }
            }
        }

        let mut truncated = 0;
        if data_len > 0 {
            let data = &payload[header_len..header_len + data_len];
            let room = self.out.len() - self.got_bytes;
            let take = data_len.min(room);
            self.out[self.got_bytes..self.got_bytes + take].copy_from_slice(&data[..take]);
            self.got_bytes += take;
            truncated = data_len - take;
            if truncated > 0 {
                debug!(truncated, capacity = self.out.len(), "frame overflows buffer");
            }

            if info & HEADER_EOF != 0 {
                self.swap();
                published += 1;
            }
        }

        PayloadOutcome::Consumed {
            published,
            forced,
            truncated,
        }
    }

    /// Publish "out" as the new "hold" frame.
    fn swap(&mut self) {
        std::mem::swap(&mut self.out, &mut self.hold);
        std::mem::swap(&mut self.meta_out, &mut self.meta_hold);
        self.held = HeldFrame {
            sequence: self.next_sequence,
            bytes: self.got_bytes,
            metadata_bytes: self.meta_bytes,
            pts: self.pts,
            scr: self.last_scr,
        };
        trace!(sequence = self.held.sequence, bytes = self.held.bytes, "frame swapped");

        self.next_sequence += 1;
        self.got_bytes = 0;
        self.pts = 0;
        self.last_scr = 0;
        self.meta_bytes = 0;
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(info: u8, data: &[u8]) -> Vec<u8> {
        let mut p = vec![2, info];
        p.extend_from_slice(data);
        p
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(8192, 2048, false)
    }

    #[test]
    fn eof_publishes_the_accumulated_frame() {
        let mut r = reassembler();
        r.process_payload(&payload(0, &[1; 1000]));
        r.process_payload(&payload(0, &[2; 1000]));
        assert_eq!(r.got_bytes(), 2000);
        assert_eq!(r.held_sequence(), 0);

        let outcome = r.process_payload(&payload(HEADER_EOF, &[3; 500]));
        assert_eq!(
            outcome,
            PayloadOutcome::Consumed {
                published: 1,
                forced: false,
                truncated: 0
            }
        );
        assert_eq!(r.got_bytes(), 0);
        assert_eq!(r.held_sequence(), 1);
        assert_eq!(r.held_data().len(), 2500);
        assert_eq!(r.held_data()[0], 1);
        assert_eq!(r.held_data()[2499], 3);
    }

    #[test]
    fn fid_toggle_closes_a_frame_missing_its_eof() {
        let mut r = reassembler();
        r.process_payload(&payload(0, &[0xaa; 300]));

        let outcome = r.process_payload(&payload(HEADER_FID, &[0xbb; 200]));
        assert_eq!(
            outcome,
            PayloadOutcome::Consumed {
                published: 1,
                forced: true,
                truncated: 0
            }
        );
        assert_eq!(r.held_data(), &[0xaa; 300][..]);
        assert_eq!(r.got_bytes(), 200);
        assert_eq!(r.fid(), 1);
    }

    #[test]
    fn fid_toggle_without_pending_data_does_not_publish() {
        let mut r = reassembler();
        r.process_payload(&payload(HEADER_FID, &[]));
        assert_eq!(r.fid(), 1);
        assert_eq!(r.held_sequence(), 0);
    }

    #[test]
    fn toggle_and_eof_in_one_payload_publish_twice() {
        let mut r = reassembler();
        r.process_payload(&payload(0, &[1; 10]));
        let outcome = r.process_payload(&payload(HEADER_FID | HEADER_EOF, &[2; 20]));
        assert!(matches!(
            outcome,
            PayloadOutcome::Consumed {
                published: 2,
                forced: true,
                ..
            }
        ));
        assert_eq!(r.held_sequence(), 2);
        assert_eq!(r.held_data(), &[2; 20][..]);
    }

    #[test]
    fn malformed_payloads_leave_state_alone() {
        let mut r = reassembler();
        r.process_payload(&payload(0, &[7; 64]));

        assert_eq!(r.process_payload(&[]), PayloadOutcome::Empty);
        assert_eq!(
            r.process_payload(&[40, 0, 1, 2]),
            PayloadOutcome::Dropped(DropReason::BadHeader)
        );
        // error bit wins over the FID flip it carries
        assert_eq!(
            r.process_payload(&payload(HEADER_ERR | HEADER_FID | HEADER_EOF, &[9; 8])),
            PayloadOutcome::Dropped(DropReason::ErrorBit)
        );
        assert_eq!(r.fid(), 0);
        assert_eq!(r.got_bytes(), 64);
        assert_eq!(r.held_sequence(), 0);
    }

    #[test]
    fn accumulation_is_bounded_by_capacity() {
        let mut r = Reassembler::new(100, 64, false);
        r.process_payload(&payload(0, &[1; 80]));
        let outcome = r.process_payload(&payload(HEADER_EOF, &[2; 80]));
        assert!(matches!(
            outcome,
            PayloadOutcome::Consumed {
                published: 1,
                truncated: 60,
                ..
            }
        ));
        assert_eq!(r.held_data().len(), 100);
    }

    #[test]
    fn metadata_tracks_the_latest_header() {
        let mut r = reassembler();
        let mut first = vec![12, HEADER_PTS | HEADER_SCR];
        first.extend_from_slice(&0x1122_3344u32.to_le_bytes());
        first.extend_from_slice(&0x5566_7788u32.to_le_bytes());
        first.extend_from_slice(&[0, 0]);
        first.extend_from_slice(&[5; 16]);
        r.process_payload(&first);

        let mut last = vec![6, HEADER_PTS | HEADER_EOF];
        last.extend_from_slice(&0xaabb_ccddu32.to_le_bytes());
        last.extend_from_slice(&[6; 16]);
        r.process_payload(&last);

        let held = r.held();
        assert_eq!(held.bytes, 32);
        assert_eq!(held.pts, 0xaabb_ccdd);
        assert_eq!(held.scr, 0x5566_7788);
        assert_eq!(r.held_metadata(), &last[..6]);
    }

    #[test]
    fn oversized_headers_skip_the_metadata_copy() {
        let mut r = Reassembler::new(1024, 4, false);
        r.process_payload(&[3, 0, 0, 1, 2, 3]);
        let mut eof = vec![8, HEADER_EOF];
        eof.extend_from_slice(&[0; 6]);
        eof.extend_from_slice(&[4, 5]);
        r.process_payload(&eof);

        assert_eq!(r.held_data(), &[1, 2, 3, 4, 5][..]);
        assert_eq!(r.held_metadata(), &[3, 0, 0][..]);
    }

    #[test]
    fn isight_header_packets_carry_no_image_data() {
        let mut r = Reassembler::new(1024, 2048, true);

        let mut header = vec![14, 0];
        header.extend_from_slice(&ISIGHT_TAG);
        r.process_payload(&header);
        r.process_payload(&[0x55; 100]);
        r.process_payload(&[0x66; 50]);
        assert_eq!(r.got_bytes(), 150);

        // next frame's header flips FID and publishes what we have
        let mut next = vec![15, HEADER_FID, 0];
        next.extend_from_slice(&ISIGHT_TAG);
        r.process_payload(&next);
        assert_eq!(r.held_sequence(), 1);
        assert_eq!(r.held_data().len(), 150);
        assert_eq!(r.got_bytes(), 0);
    }

    #[test]
    fn resize_keeps_the_published_frame() {
        let mut r = reassembler();
        r.process_payload(&payload(HEADER_EOF, &[9; 300]));
        r.process_payload(&payload(0, &[1; 10]));
        r.resize(128);
        assert_eq!(r.frame_capacity(), 128);
        assert_eq!(r.got_bytes(), 0);
        assert_eq!(r.held_sequence(), 1);
        assert_eq!(r.held_data(), &[9; 128][..]);
    }

    #[test]
    fn reset_keeps_sequence_numbers_increasing() {
        let mut r = reassembler();
        r.process_payload(&payload(HEADER_EOF, &[1; 4]));
        r.process_payload(&payload(HEADER_FID, &[1; 4]));
        r.reset();
        assert_eq!(r.got_bytes(), 0);
        assert_eq!(r.fid(), 0);

        r.process_payload(&payload(HEADER_EOF, &[2; 4]));
        assert_eq!(r.held_sequence(), 2);
    }
}
