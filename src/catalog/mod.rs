//! Per-device tree of supported formats, frame sizes and frame intervals.
//!
//! The tree is discovered once when the device is enumerated and is only
//! read afterwards.

pub mod format;

pub use format::FrameFormat;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UvcError};

/// Frame intervals are expressed in 100ns units.
pub const INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

/// Supported frame intervals of one frame descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32, step: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// `bFrameIndex`, 1-based
    pub index: u8,
    pub width: u16,
    pub height: u16,
    pub max_video_frame_buffer_size: u32,
    pub default_interval: u32,
    pub intervals: FrameIntervals,
}

impl FrameDescriptor {
    /// Pick the frame interval that yields `fps`.
    ///
    /// Discrete lists need an exact rate match, and a rate of 0 takes the
    /// first listed interval. Continuous ranges accept any interval inside
    /// `[min, max]` that sits on a step boundary counted from `min`.
    pub fn interval_for_rate(&self, fps: u32) -> Option<u32> {
        match &self.intervals {
            FrameIntervals::Discrete(intervals) => intervals
                .iter()
                .copied()
                .find(|&interval| fps == 0 || (interval != 0 && INTERVAL_UNITS_PER_SEC / interval == fps)),
            FrameIntervals::Continuous { min, max, step } => {
                if fps == 0 {
                    return Some(*min);
                }
                let interval = INTERVAL_UNITS_PER_SEC / fps;
                if interval < *min || interval > *max {
                    return None;
                }
                let offset = interval - min;
                if *step != 0 && offset % step != 0 {
                    return None;
                }
                Some(interval)
            }
        }
    }

    /// Frame rates this descriptor can be driven at.
    pub fn rates(&self) -> Vec<u32> {
        let to_fps = |interval: u32| INTERVAL_UNITS_PER_SEC.checked_div(interval).unwrap_or(0);
        match &self.intervals {
            FrameIntervals::Discrete(intervals) => intervals.iter().copied().map(to_fps).collect(),
            FrameIntervals::Continuous { min, max, .. } => {
                let mut rates = vec![to_fps(*min)];
                if max != min {
                    rates.push(to_fps(*max));
                }
                rates
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    /// `bFormatIndex`, 1-based
    pub index: u8,
    pub guid: [u8; 16],
    pub bits_per_pixel: u8,
    pub frames: Vec<FrameDescriptor>,
}

impl FormatDescriptor {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::for_guid(&self.guid)
    }
}

/// One VideoStreaming interface and the formats it offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingInterface {
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub formats: Vec<FormatDescriptor>,
}

impl StreamingInterface {
    pub fn find_frame_desc(
        &self,
        format_index: u8,
        frame_index: u8,
    ) -> Option<(&FormatDescriptor, &FrameDescriptor)> {
        let format = self.formats.iter().find(|f| f.index == format_index)?;
        let frame = format.frames.iter().find(|f| f.index == frame_index)?;
        Some((format, frame))
    }

    fn profiles(&self) -> impl Iterator<Item = StreamProfile> + '_ {
        self.formats.iter().flat_map(move |format| {
            format.frames.iter().flat_map(move |frame| {
                frame.rates().into_iter().map(move |fps| StreamProfile {
                    interface: Some(self.interface_number),
                    format: format.frame_format(),
                    width: frame.width,
                    height: frame.height,
                    fps,
                })
            })
        })
    }
}

/// Camera-specific behaviour that changes how payloads are parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQuirks {
    /// Legacy iSight family: header-only packets tagged with a magic
    /// sequence, followed by header-less image packets.
    pub isight: bool,
}

/// Everything discovered about a device at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `bcdUVC` of the VideoControl interface, e.g. `0x0150`
    pub uvc_version: u16,
    /// `dwClockFrequency` of the VideoControl interface
    pub clock_frequency: u32,
    pub streaming: Vec<StreamingInterface>,
    pub quirks: DeviceQuirks,
}

impl DeviceInfo {
    pub fn stream_interface(&self, interface: u8) -> Option<&StreamingInterface> {
        self.streaming
            .iter()
            .find(|s| s.interface_number == interface)
    }

    pub fn stream_interfaces(&self) -> impl Iterator<Item = u8> + '_ {
        self.streaming.iter().map(|s| s.interface_number)
    }

    /// Device-wide lookup, first interface carrying the indices wins.
    pub fn find_frame_desc(
        &self,
        format_index: u8,
        frame_index: u8,
    ) -> Option<(&FormatDescriptor, &FrameDescriptor)> {
        self.streaming
            .iter()
            .find_map(|s| s.find_frame_desc(format_index, frame_index))
    }

    /// Every frame descriptor whose format satisfies `format`.
    pub fn list_frame_descriptors(&self, format: FrameFormat) -> Vec<&FrameDescriptor> {
        self.streaming
            .iter()
            .flat_map(|s| s.formats.iter())
            .filter(|f| format.matches_guid(&f.guid))
            .flat_map(|f| f.frames.iter())
            .collect()
    }

    pub fn available_profiles(&self, interface: u8) -> Result<Vec<StreamProfile>> {
        let stream_if = self.stream_interface(interface).ok_or_else(|| {
            UvcError::InvalidParameter(format!("no streaming interface {interface}"))
        })?;
        Ok(stream_if.profiles().collect())
    }

    pub fn available_profiles_all(&self) -> Vec<StreamProfile> {
        self.streaming.iter().flat_map(|s| s.profiles()).collect()
    }
}

/// A requested or advertised (format, size, rate) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    /// Restrict the search to one interface, `None` searches them all
    pub interface: Option<u8>,
    pub format: FrameFormat,
    pub width: u16,
    pub height: u16,
    /// Frames per second, 0 accepts the first available rate
    pub fps: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete() -> FrameDescriptor {
        FrameDescriptor {
            index: 1,
            width: 640,
            height: 480,
            max_video_frame_buffer_size: 640 * 480 * 2,
            default_interval: 333_333,
            intervals: FrameIntervals::Discrete(vec![666_666, 333_333, 166_666]),
        }
    }

    #[test]
    fn discrete_rates_need_an_exact_match() {
        let frame = discrete();
        assert_eq!(frame.interval_for_rate(30), Some(333_333));
        assert_eq!(frame.interval_for_rate(60), Some(166_666));
        assert_eq!(frame.interval_for_rate(25), None);
        assert_eq!(frame.interval_for_rate(0), Some(666_666));
    }

    #[test]
    fn continuous_rates_must_sit_on_a_step() {
        let frame = FrameDescriptor {
            intervals: FrameIntervals::Continuous {
                min: 166_666,
                max: 1_000_000,
                step: 166_667,
            },
            ..discrete()
        };
        // 10 fps -> 1_000_000, offset 833_334 is not a multiple of the step
        assert_eq!(frame.interval_for_rate(10), None);
        assert_eq!(frame.interval_for_rate(60), Some(166_666));
        assert_eq!(frame.interval_for_rate(5), None);

        let stepped = FrameDescriptor {
            intervals: FrameIntervals::Continuous {
                min: 100_000,
                max: 1_000_000,
                step: 100_000,
            },
            ..discrete()
        };
        assert_eq!(stepped.interval_for_rate(20), Some(500_000));
        assert_eq!(stepped.interval_for_rate(0), Some(100_000));
    }

    #[test]
    fn profiles_list_every_rate() {
        let info = DeviceInfo {
            uvc_version: 0x0110,
            clock_frequency: 48_000_000,
            streaming: vec![StreamingInterface {
                interface_number: 1,
                endpoint_address: 0x81,
                formats: vec![FormatDescriptor {
                    index: 1,
                    guid: FrameFormat::Yuyv.guid().unwrap(),
                    bits_per_pixel: 16,
                    frames: vec![discrete()],
                }],
            }],
            quirks: DeviceQuirks::default(),
        };

        let rates: Vec<u32> = info
            .available_profiles(1)
            .unwrap()
            .iter()
            .map(|p| p.fps)
            .collect();
        assert_eq!(rates, vec![15, 30, 60]);
        assert!(info.available_profiles(2).is_err());
        assert_eq!(info.list_frame_descriptors(FrameFormat::Uncompressed).len(), 1);
        assert!(info.list_frame_descriptors(FrameFormat::Mjpeg).is_empty());
        assert!(info.find_frame_desc(1, 1).is_some());
        assert!(info.find_frame_desc(1, 2).is_none());
    }

    #[test]
    fn profiles_span_every_interface() {
        let mjpeg = FrameDescriptor {
            intervals: FrameIntervals::Discrete(vec![333_333]),
            ..discrete()
        };
        let info = DeviceInfo {
            uvc_version: 0x0150,
            clock_frequency: 48_000_000,
            streaming: vec![
                StreamingInterface {
                    interface_number: 1,
                    endpoint_address: 0x81,
                    formats: vec![FormatDescriptor {
                        index: 1,
                        guid: FrameFormat::Yuyv.guid().unwrap(),
                        bits_per_pixel: 16,
                        frames: vec![discrete()],
                    }],
                },
                StreamingInterface {
                    interface_number: 3,
                    endpoint_address: 0x83,
                    formats: vec![FormatDescriptor {
                        index: 1,
                        guid: FrameFormat::Mjpeg.guid().unwrap(),
                        bits_per_pixel: 0,
                        frames: vec![mjpeg],
                    }],
                },
            ],
            quirks: DeviceQuirks::default(),
        };

        assert_eq!(info.stream_interfaces().collect::<Vec<_>>(), vec![1, 3]);

        let all = info.available_profiles_all();
        assert_eq!(all.len(), 4);
        assert_eq!(all.iter().filter(|p| p.interface == Some(1)).count(), 3);
        assert_eq!(
            all.last(),
            Some(&StreamProfile {
                interface: Some(3),
                format: FrameFormat::Mjpeg,
                width: 640,
                height: 480,
                fps: 30,
            })
        );
        let per_interface: usize = info
            .stream_interfaces()
            .map(|i| info.available_profiles(i).unwrap().len())
            .sum();
        assert_eq!(per_interface, all.len());
    }
}
