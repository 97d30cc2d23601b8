//! Pixel encodings and the GUIDs devices use to announce them

use serde::{Deserialize, Serialize};

/// Trailing 12 bytes shared by every FOURCC-derived media subtype GUID.
const GUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
];

const fn fourcc_guid(code: [u8; 4]) -> [u8; 16] {
    let mut guid = [0u8; 16];
    let mut i = 0;
    while i < 4 {
        guid[i] = code[i];
        i += 1;
    }
    while i < 16 {
        guid[i] = GUID_SUFFIX[i - 4];
        i += 1;
    }
    guid
}

/// Pixel encodings understood by the engine.
///
/// `Any`, `Uncompressed` and `Compressed` are abstract: they never appear on
/// a device, but match any of their concrete children when negotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    Any,
    Uncompressed,
    Compressed,
    Yuyv,
    Uyvy,
    Gray8,
    By8,
    Nv12,
    Z16,
    Y16,
    Mjpeg,
    Unknown,
}

impl FrameFormat {
    /// Every concrete format, in lookup order.
    pub const CONCRETE: &'static [FrameFormat] = &[
        FrameFormat::Yuyv,
        FrameFormat::Uyvy,
        FrameFormat::Gray8,
        FrameFormat::By8,
        FrameFormat::Nv12,
        FrameFormat::Z16,
        FrameFormat::Y16,
        FrameFormat::Mjpeg,
    ];

    /// GUID a device reports for this format, `None` for abstract formats.
    pub fn guid(self) -> Option<[u8; 16]> {
        let guid = match self {
            FrameFormat::Yuyv => fourcc_guid(*b"YUY2"),
            FrameFormat::Uyvy => fourcc_guid(*b"UYVY"),
            FrameFormat::Gray8 => fourcc_guid(*b"Y800"),
            FrameFormat::By8 => fourcc_guid(*b"BY8 "),
            FrameFormat::Nv12 => fourcc_guid(*b"NV12"),
            FrameFormat::Z16 => fourcc_guid(*b"Z16 "),
            FrameFormat::Y16 => fourcc_guid(*b"Y16 "),
            // MJPEG format descriptors carry no GUID; the catalog tags them
            // with the bare FOURCC.
            FrameFormat::Mjpeg => {
                let mut guid = [0u8; 16];
                guid[..4].copy_from_slice(b"MJPG");
                guid
            }
            FrameFormat::Any
            | FrameFormat::Uncompressed
            | FrameFormat::Compressed
            | FrameFormat::Unknown => return None,
        };
        Some(guid)
    }

    pub fn children(self) -> &'static [FrameFormat] {
        match self {
            FrameFormat::Any => &[FrameFormat::Uncompressed, FrameFormat::Compressed],
            FrameFormat::Uncompressed => &[
                FrameFormat::Yuyv,
                FrameFormat::Uyvy,
                FrameFormat::Gray8,
                FrameFormat::Nv12,
                FrameFormat::Z16,
                FrameFormat::Y16,
            ],
            FrameFormat::Compressed => &[FrameFormat::Mjpeg],
            _ => &[],
        }
    }

    pub fn is_abstract(self) -> bool {
        !self.children().is_empty()
    }

    /// Whether a device format with `guid` satisfies a request for `self`.
    pub fn matches_guid(self, guid: &[u8; 16]) -> bool {
        if let Some(own) = self.guid() {
            if &own == guid {
                return true;
            }
        }
        self.children().iter().any(|child| child.matches_guid(guid))
    }

    /// Resolve a device GUID to the concrete format it announces.
    pub fn for_guid(guid: &[u8; 16]) -> FrameFormat {
        Self::CONCRETE
            .iter()
            .copied()
            .find(|format| format.guid().as_ref() == Some(guid))
            .unwrap_or(FrameFormat::Unknown)
    }

    /// Bits per pixel, 0 for compressed or unknown encodings.
    pub fn bits_per_pixel(self) -> u8 {
        match self {
            FrameFormat::Yuyv | FrameFormat::Uyvy | FrameFormat::Z16 | FrameFormat::Y16 => 16,
            FrameFormat::Nv12 => 12,
            FrameFormat::Gray8 | FrameFormat::By8 => 8,
            _ => 0,
        }
    }

    /// Bytes per row of the first plane, 0 when rows are not meaningful.
    pub fn stride(self, width: u32) -> u32 {
        match self {
            // planar: the luma plane is one byte per pixel
            FrameFormat::Nv12 => width,
            other => width * u32::from(other.bits_per_pixel()) / 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_formats_match_their_children() {
        let yuyv = FrameFormat::Yuyv.guid().unwrap();
        let mjpeg = FrameFormat::Mjpeg.guid().unwrap();

        assert!(FrameFormat::Any.matches_guid(&yuyv));
        assert!(FrameFormat::Any.matches_guid(&mjpeg));
        assert!(FrameFormat::Uncompressed.matches_guid(&yuyv));
        assert!(!FrameFormat::Uncompressed.matches_guid(&mjpeg));
        assert!(FrameFormat::Compressed.matches_guid(&mjpeg));
        assert!(!FrameFormat::Uyvy.matches_guid(&yuyv));

        assert!(FrameFormat::Any.is_abstract());
        assert!(FrameFormat::Uncompressed.is_abstract());
        assert!(FrameFormat::Compressed.is_abstract());
        assert!(FrameFormat::CONCRETE.iter().all(|f| !f.is_abstract()));
        assert!(!FrameFormat::Unknown.is_abstract());
    }

    #[test]
    fn guid_lookup_only_yields_concrete_formats() {
        for format in FrameFormat::CONCRETE {
            assert_eq!(FrameFormat::for_guid(&format.guid().unwrap()), *format);
        }
        assert_eq!(FrameFormat::for_guid(&[0xff; 16]), FrameFormat::Unknown);
    }

    #[test]
    fn strides() {
        assert_eq!(FrameFormat::Yuyv.stride(640), 1280);
        assert_eq!(FrameFormat::Gray8.stride(640), 640);
        assert_eq!(FrameFormat::Nv12.stride(640), 640);
        assert_eq!(FrameFormat::Mjpeg.stride(640), 0);
    }
}
