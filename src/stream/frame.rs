use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::FrameFormat;

/// A completed video frame handed to consumers.
///
/// The engine copies the published buffer into the frame before releasing
/// its lock, so a `Frame` stays valid after the next frame arrives and can
/// be cloned cheaply across threads.
#[derive(Clone)]
pub struct Frame {
    /// Image bytes as received from the device
    pub data: Bytes,

    /// Raw payload header of the last payload seen before publication
    pub metadata: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Delivery timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bits_per_pixel: u8,
    pub format: FrameFormat,
    /// Presentation timestamp from the payload header, if the device sent one
    pub pts: Option<u32>,
    /// Source clock reference from the payload header, if the device sent one
    pub scr: Option<u32>,
}

/// Geometry of the negotiated frame, fixed while a stream is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameLayout {
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bits_per_pixel: u8,
}
