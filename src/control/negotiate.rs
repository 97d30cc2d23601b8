//! Agree on a stream format with the device

use std::time::Duration;

use tracing::debug;

use super::{query_stream_ctrl, ControlSelector, RequestCode, StreamCtrl};
use crate::catalog::{DeviceInfo, StreamProfile};
use crate::error::{Result, UvcError};
use crate::usb::UsbTransport;

/// Don't let the device renegotiate the frame interval.
const HINT_FIX_FRAME_INTERVAL: u16 = 1 << 0;

/// What a caller asks to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// Search the catalog for a matching format, size and rate
    Profile(StreamProfile),
    /// Probe a control block the caller already filled in
    Ctrl(StreamCtrl),
}

impl From<StreamProfile> for StreamRequest {
    fn from(profile: StreamProfile) -> Self {
        StreamRequest::Profile(profile)
    }
}

impl From<StreamCtrl> for StreamRequest {
    fn from(ctrl: StreamCtrl) -> Self {
        StreamRequest::Ctrl(ctrl)
    }
}

/// A request matched against the catalog, ready to be probed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolved {
    pub ctrl: StreamCtrl,
    /// Learn the device ceilings with GET_MAX before probing
    pub query_max: bool,
}

impl StreamRequest {
    pub(crate) fn resolve(&self, info: &DeviceInfo) -> Result<Resolved> {
        match self {
            StreamRequest::Profile(profile) => Ok(Resolved {
                ctrl: select(info, profile)?,
                query_max: true,
            }),
            StreamRequest::Ctrl(ctrl) => {
                let Some(stream_if) = info.stream_interface(ctrl.interface) else {
                    return Err(UvcError::InvalidParameter(format!(
                        "no streaming interface {}",
                        ctrl.interface
                    )));
                };
                if stream_if
                    .find_frame_desc(ctrl.format_index, ctrl.frame_index)
                    .is_none()
                {
                    return Err(UvcError::InvalidParameter(format!(
                        "no format {} frame {} on interface {}",
                        ctrl.format_index, ctrl.frame_index, ctrl.interface
                    )));
                }
                Ok(Resolved {
                    ctrl: *ctrl,
                    query_max: false,
                })
            }
        }
    }
}

/// Walk the catalog for the first format/frame/interval satisfying
/// `profile`. Pure lookup, no device traffic.
pub fn select(info: &DeviceInfo, profile: &StreamProfile) -> Result<StreamCtrl> {
    if let Some(interface) = profile.interface {
        if info.stream_interface(interface).is_none() {
            return Err(UvcError::InvalidParameter(format!(
                "no streaming interface {interface}"
            )));
        }
    }

    let candidates = info
        .streaming
        .iter()
        .filter(|s| profile.interface.map_or(true, |i| i == s.interface_number));

    for stream_if in candidates {
        let formats = stream_if
            .formats
            .iter()
            .filter(|f| profile.format.matches_guid(&f.guid));
        for format in formats {
            let frames = format
                .frames
                .iter()
                .filter(|f| f.width == profile.width && f.height == profile.height);
            for frame in frames {
                if let Some(interval) = frame.interval_for_rate(profile.fps) {
                    return Ok(StreamCtrl {
                        hint: HINT_FIX_FRAME_INTERVAL,
                        format_index: format.index,
                        frame_index: frame.index,
                        frame_interval: interval,
                        interface: stream_if.interface_number,
                        ..StreamCtrl::default()
                    });
                }
            }
        }
    }

    Err(UvcError::InvalidParameter(format!(
        "no {:?} {}x{} @ {} fps mode",
        profile.format, profile.width, profile.height, profile.fps
    )))
}

/// GET_MAX (for catalog matches), then SET/GET probe. Whatever the device
/// answers, including a corrected interval or sizes, ends up in the result.
pub(crate) fn negotiate(
    transport: &dyn UsbTransport,
    info: &DeviceInfo,
    resolved: Resolved,
    timeout: Duration,
) -> Result<StreamCtrl> {
    let wanted = resolved.ctrl;
    let mut ctrl = wanted;

    if resolved.query_max {
        query_stream_ctrl(
            transport,
            info,
            &mut ctrl,
            ControlSelector::Probe,
            RequestCode::GetMax,
            timeout,
        )?;
        ctrl.hint = wanted.hint;
        ctrl.format_index = wanted.format_index;
        ctrl.frame_index = wanted.frame_index;
        ctrl.frame_interval = wanted.frame_interval;
    }

    query_stream_ctrl(
        transport,
        info,
        &mut ctrl,
        ControlSelector::Probe,
        RequestCode::SetCur,
        timeout,
    )?;
    query_stream_ctrl(
        transport,
        info,
        &mut ctrl,
        ControlSelector::Probe,
        RequestCode::GetCur,
        timeout,
    )?;

    if ctrl.frame_interval != wanted.frame_interval {
        debug!(
            requested = wanted.frame_interval,
            granted = ctrl.frame_interval,
            "device corrected frame interval"
        );
    }

    Ok(ctrl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        DeviceQuirks, FormatDescriptor, FrameDescriptor, FrameFormat, FrameIntervals,
        StreamingInterface,
    };

    fn info() -> DeviceInfo {
        let frame = |index, width, height| FrameDescriptor {
            index,
            width,
            height,
            max_video_frame_buffer_size: u32::from(width) * u32::from(height) * 2,
            default_interval: 333_333,
            intervals: FrameIntervals::Discrete(vec![666_666, 333_333, 166_666]),
        };
        DeviceInfo {
            uvc_version: 0x0110,
            clock_frequency: 48_000_000,
            streaming: vec![
                StreamingInterface {
                    interface_number: 1,
                    endpoint_address: 0x81,
                    formats: vec![FormatDescriptor {
                        index: 1,
                        guid: FrameFormat::Mjpeg.guid().unwrap(),
                        bits_per_pixel: 0,
                        frames: vec![frame(1, 1280, 720)],
                    }],
                },
                StreamingInterface {
                    interface_number: 2,
                    endpoint_address: 0x82,
                    formats: vec![FormatDescriptor {
                        index: 1,
                        guid: FrameFormat::Yuyv.guid().unwrap(),
                        bits_per_pixel: 16,
                        frames: vec![frame(1, 320, 240), frame(2, 640, 480)],
                    }],
                },
            ],
            quirks: DeviceQuirks::default(),
        }
    }

    fn profile(format: FrameFormat, width: u16, height: u16, fps: u32) -> StreamProfile {
        StreamProfile {
            interface: None,
            format,
            width,
            height,
            fps,
        }
    }

    #[test]
    fn selects_across_interfaces() {
        let ctrl = select(&info(), &profile(FrameFormat::Yuyv, 640, 480, 30)).unwrap();
        assert_eq!(ctrl.interface, 2);
        assert_eq!(ctrl.format_index, 1);
        assert_eq!(ctrl.frame_index, 2);
        assert_eq!(ctrl.frame_interval, 333_333);
        assert_eq!(ctrl.hint, HINT_FIX_FRAME_INTERVAL);

        let ctrl = select(&info(), &profile(FrameFormat::Compressed, 1280, 720, 0)).unwrap();
        assert_eq!(ctrl.interface, 1);
        assert_eq!(ctrl.frame_interval, 666_666);
    }

    #[test]
    fn unmatched_requests_are_invalid() {
        let info = info();
        for wanted in [
            profile(FrameFormat::Yuyv, 640, 480, 25),
            profile(FrameFormat::Yuyv, 800, 600, 30),
            profile(FrameFormat::Nv12, 640, 480, 30),
        ] {
            assert!(matches!(
                select(&info, &wanted),
                Err(UvcError::InvalidParameter(_))
            ));
        }

        let pinned = StreamProfile {
            interface: Some(1),
            ..profile(FrameFormat::Yuyv, 640, 480, 30)
        };
        assert!(select(&info, &pinned).is_err());

        let missing = StreamRequest::Ctrl(StreamCtrl {
            interface: 9,
            ..StreamCtrl::default()
        });
        assert!(missing.resolve(&info).is_err());

        let unknown_frame = StreamRequest::Ctrl(StreamCtrl {
            interface: 1,
            format_index: 9,
            frame_index: 9,
            ..StreamCtrl::default()
        });
        assert!(matches!(
            unknown_frame.resolve(&info),
            Err(UvcError::InvalidParameter(_))
        ));

        // frame 2 exists on interface 2 only
        let wrong_interface = StreamRequest::Ctrl(StreamCtrl {
            interface: 1,
            format_index: 1,
            frame_index: 2,
            ..StreamCtrl::default()
        });
        assert!(wrong_interface.resolve(&info).is_err());

        let known = StreamRequest::Ctrl(StreamCtrl {
            interface: 2,
            format_index: 1,
            frame_index: 2,
            ..StreamCtrl::default()
        });
        let resolved = known.resolve(&info).unwrap();
        assert!(!resolved.query_max);
    }
}
