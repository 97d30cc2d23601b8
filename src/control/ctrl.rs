//! The probe/commit control block.

/// Length of the control block for a given `bcdUVC`.
pub fn block_len(uvc_version: u16) -> usize {
    match uvc_version {
        0x0110 => 34,
        0x0150 => 48,
        _ => 26,
    }
}

/// Negotiated streaming contract between host and device.
///
/// Built by negotiation and frozen once a stream is opened from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCtrl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// 100ns units
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_ref_frames_plus1: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
    /// Streaming interface this block belongs to
    pub interface: u8,
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

impl StreamCtrl {
    /// Serialize for a SET request into a block of `len` bytes (26, 34 or 48).
    ///
    /// The max frame and payload sizes go out as zero so the device picks
    /// them.
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        put(&mut buf, 0, &self.hint.to_le_bytes());
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        put(&mut buf, 4, &self.frame_interval.to_le_bytes());
        put(&mut buf, 8, &self.key_frame_rate.to_le_bytes());
        put(&mut buf, 10, &self.p_frame_rate.to_le_bytes());
        put(&mut buf, 12, &self.comp_quality.to_le_bytes());
        put(&mut buf, 14, &self.comp_window_size.to_le_bytes());
        put(&mut buf, 16, &self.delay.to_le_bytes());
        // bytes 18..26 (dwMaxVideoFrameSize, dwMaxPayloadTransferSize) stay 0

        if len >= 34 {
            put(&mut buf, 26, &self.clock_frequency.to_le_bytes());
            buf[30] = self.framing_info;
            buf[31] = self.preferred_version;
            buf[32] = self.min_version;
            buf[33] = self.max_version;
        }

        if len >= 48 {
            buf[34] = self.usage;
            buf[35] = self.bit_depth_luma;
            buf[36] = self.settings;
            buf[37] = self.max_ref_frames_plus1;
            put(&mut buf, 38, &self.rate_control_modes.to_le_bytes());
            put(&mut buf, 40, &self.layout_per_stream.to_le_bytes());
        }

        buf
    }

    /// Update from the block returned by a GET request.
    ///
    /// Fields the block is too short to carry are left untouched.
    pub fn decode(&mut self, buf: &[u8]) {
        if buf.len() < 26 {
            return;
        }
        self.hint = get_u16(buf, 0);
        self.format_index = buf[2];
        self.frame_index = buf[3];
        self.frame_interval = get_u32(buf, 4);
        self.key_frame_rate = get_u16(buf, 8);
        self.p_frame_rate = get_u16(buf, 10);
        self.comp_quality = get_u16(buf, 12);
        self.comp_window_size = get_u16(buf, 14);
        self.delay = get_u16(buf, 16);
        self.max_video_frame_size = get_u32(buf, 18);
        self.max_payload_transfer_size = get_u32(buf, 22);

        if buf.len() >= 34 {
            self.clock_frequency = get_u32(buf, 26);
            self.framing_info = buf[30];
            self.preferred_version = buf[31];
            self.min_version = buf[32];
            self.max_version = buf[33];
        }

        if buf.len() >= 48 {
            self.usage = buf[34];
            self.bit_depth_luma = buf[35];
            self.settings = buf[36];
            self.max_ref_frames_plus1 = buf[37];
            self.rate_control_modes = get_u16(buf, 38);
            self.layout_per_stream = get_u64(buf, 40);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_length_follows_uvc_version() {
        assert_eq!(block_len(0x0100), 26);
        assert_eq!(block_len(0x0110), 34);
        assert_eq!(block_len(0x0150), 48);
    }

    #[test]
    fn set_block_leaves_sizes_to_the_device() {
        let ctrl = StreamCtrl {
            hint: 1,
            format_index: 2,
            frame_index: 3,
            frame_interval: 333_333,
            max_video_frame_size: 614_400,
            max_payload_transfer_size: 3072,
            clock_frequency: 48_000_000,
            ..StreamCtrl::default()
        };

        let buf = ctrl.encode(34);
        assert_eq!(buf.len(), 34);
        assert_eq!(&buf[0..4], &[1, 0, 2, 3]);
        assert_eq!(&buf[4..8], &333_333u32.to_le_bytes());
        assert_eq!(&buf[18..26], &[0; 8]);
        assert_eq!(&buf[26..30], &48_000_000u32.to_le_bytes());

        let mut decoded = StreamCtrl::default();
        decoded.decode(&buf);
        assert_eq!(decoded.frame_interval, 333_333);
        assert_eq!(decoded.max_video_frame_size, 0);
        assert_eq!(decoded.clock_frequency, 48_000_000);
    }

    #[test]
    fn short_blocks_keep_extended_fields() {
        let mut ctrl = StreamCtrl {
            clock_frequency: 1234,
            layout_per_stream: 99,
            ..StreamCtrl::default()
        };
        let mut block = vec![0u8; 26];
        block[18..22].copy_from_slice(&4096u32.to_le_bytes());
        ctrl.decode(&block);
        assert_eq!(ctrl.max_video_frame_size, 4096);
        assert_eq!(ctrl.clock_frequency, 1234);
        assert_eq!(ctrl.layout_per_stream, 99);
    }
}
