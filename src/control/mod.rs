//! VideoStreaming probe/commit control requests and format negotiation

pub mod ctrl;
pub mod negotiate;

pub use ctrl::StreamCtrl;
pub use negotiate::StreamRequest;

use std::time::Duration;

use tracing::trace;

use crate::catalog::DeviceInfo;
use crate::error::Result;
use crate::usb::{UsbTransport, REQ_TYPE_GET, REQ_TYPE_SET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlSelector {
    Probe = 0x01,
    Commit = 0x02,
}

/// Run one probe or commit request for `ctrl`.
///
/// SET requests send `ctrl`; every other request code reads the device's
/// answer back into it. When the device reports a max frame size of 0 the
/// frame descriptor's buffer size is used instead.
pub(crate) fn query_stream_ctrl(
    transport: &dyn UsbTransport,
    info: &DeviceInfo,
    ctrl: &mut StreamCtrl,
    selector: ControlSelector,
    request: RequestCode,
    timeout: Duration,
) -> Result<()> {
    let len = ctrl::block_len(info.uvc_version);
    let (request_type, mut buf) = if request == RequestCode::SetCur {
        (REQ_TYPE_SET, ctrl.encode(len))
    } else {
        (REQ_TYPE_GET, vec![0u8; len])
    };

    let transferred = transport.control_transfer(
        request_type,
        request as u8,
        (selector as u16) << 8,
        u16::from(ctrl.interface),
        &mut buf,
        timeout,
    )?;
    trace!(?selector, ?request, transferred, "stream control request");

    if request == RequestCode::SetCur {
        return Ok(());
    }

    ctrl.decode(&buf[..transferred.min(len)]);
    if transferred < 34 {
        ctrl.clock_frequency = info.clock_frequency;
    }

    // some firmware never fills dwMaxVideoFrameSize
    if ctrl.max_video_frame_size == 0 {
        let described = info
            .stream_interface(ctrl.interface)
            .and_then(|s| s.find_frame_desc(ctrl.format_index, ctrl.frame_index));
        if let Some((_, frame)) = described {
            ctrl.max_video_frame_size = frame.max_video_frame_buffer_size;
        }
    }

    Ok(())
}
