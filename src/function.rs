use anyhow::Error;
use num_traits::FromPrimitive;

use crate::error::UvcError;
use crate::pool::UsbRequest;
use crate::queue::VideoBuffer;
use crate::usb_proto::{
    EventResponder, Recip, SetupPacket, UsbSpeed, UvcEvent, UvcRequestData, XferDir, XferType,
    UVC_REQUEST_DATA_MAX,
};
use crate::uvc_proto::{
    PixelFormat, UvcPayloadHeader, UvcRequestCodes, UvcStreamingControl, UvcVsControlSelector,
    UVC_CLOCK_FREQUENCY,
    UVC_CONTROL_INFO_GET_SET, UVC_FRAMING_INFO_EOF, UVC_FRAMING_INFO_FID,
    UVC_STREAMING_CONTROL_SIZE_V10, UVC_STREAMING_CONTROL_SIZE_V11,
};
use crate::video::{FramingMode, TransferService, UvcVideo, XferStatus};

/// Connection/stream lifecycle. All mutations go through the transition
/// table; anything else is rejected with a state error and no side effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UvcState {
    Disconnected,
    Connected,
    Streaming,
}

/// One frame size the device can produce, with its interval bounds.
#[derive(Debug, Clone, Copy)]
pub struct FrameCaps {
    pub frame_index: u8,
    pub width: u16,
    pub height: u16,
    /// 100 ns units, min_interval is the fastest rate
    pub min_interval: u32,
    pub max_interval: u32,
    pub default_interval: u32,
    pub max_video_frame_size: u32,
}

/// One pixel format the device exposes, per its streaming descriptors.
#[derive(Debug, Clone)]
pub struct FormatCaps {
    pub format_index: u8,
    pub format: PixelFormat,
    pub frames: Vec<FrameCaps>,
}

/// Raw descriptor tables for the control and streaming interfaces, supplied
/// per hardware variant. Opaque here; handed to the enumeration layer.
#[derive(Debug, Clone)]
pub struct UvcDescriptors {
    pub control: Vec<u8>,
    pub fs_streaming: Vec<u8>,
    pub hs_streaming: Vec<u8>,
}

/// Capability/default streaming parameters: first format, first frame.
fn default_control(formats: &[FormatCaps], req_size: usize) -> UvcStreamingControl {
    let fmt = &formats[0];
    let frame = &fmt.frames[0];
    UvcStreamingControl {
        bm_hint: 1,
        b_format_index: fmt.format_index,
        b_frame_index: frame.frame_index,
        dw_frame_interval: frame.default_interval,
        w_key_frame_rate: 0,
        w_pframe_rate: 0,
        w_comp_quality: 0,
        w_comp_window_size: 0,
        w_delay: 0,
        dw_max_video_frame_size: frame.max_video_frame_size,
        dw_max_payload_transfer_size: req_size as u32,
        dw_clock_frequency: UVC_CLOCK_FREQUENCY,
        bm_framing_info: UVC_FRAMING_INFO_FID | UVC_FRAMING_INFO_EOF,
        b_prefered_version: 1,
        b_min_version: 1,
        b_max_version: 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingTarget {
    Probe,
    Commit,
    Forwarded,
}

/// Bookkeeping for a SETUP whose DATA stage is still outstanding.
#[derive(Debug, Clone, Copy)]
struct PendingSetup {
    target: PendingTarget,
    length: usize,
}

/// The UVC function: streaming state machine plus the class-specific control
/// dispatcher. Owns the per-stream context while connected.
pub struct UvcDevice {
    state: UvcState,
    speed: Option<UsbSpeed>,
    control_intf: u8,
    streaming_intf: u8,
    formats: Vec<FormatCaps>,
    desc: UvcDescriptors,
    responder: Box<dyn EventResponder>,
    req_size: usize,
    probe: UvcStreamingControl,
    commit: UvcStreamingControl,
    committed: bool,
    pending: Option<PendingSetup>,
    video: Option<UvcVideo>,
}

impl UvcDevice {
    pub fn new(
        control_intf: u8,
        streaming_intf: u8,
        formats: Vec<FormatCaps>,
        desc: UvcDescriptors,
        req_size: usize,
        responder: Box<dyn EventResponder>,
    ) -> Result<UvcDevice, Error> {
        ensure!(!formats.is_empty(), "at least one format capability is required");
        ensure!(
            req_size > UvcPayloadHeader::size(),
            "request size {} leaves no room for payload data after the {} byte header",
            req_size,
            UvcPayloadHeader::size()
        );
        ensure!(
            formats.iter().all(|f| !f.frames.is_empty()),
            "every format needs at least one frame descriptor"
        );
        let defaults = default_control(&formats, req_size);
        return Ok(UvcDevice {
            state: UvcState::Disconnected,
            speed: None,
            control_intf,
            streaming_intf,
            formats,
            desc,
            responder,
            req_size,
            probe: defaults,
            commit: defaults,
            committed: false,
            pending: None,
            video: None,
        });
    }

    pub fn state(&self) -> UvcState {
        self.state
    }

    pub fn video(&self) -> Option<&UvcVideo> {
        self.video.as_ref()
    }

    pub fn probe_control(&self) -> &UvcStreamingControl {
        &self.probe
    }

    pub fn commit_control(&self) -> &UvcStreamingControl {
        &self.commit
    }

    pub fn control_descriptors(&self) -> &[u8] {
        &self.desc.control
    }

    /// Streaming descriptors for the current connection speed.
    pub fn streaming_descriptors(&self) -> &[u8] {
        match self.speed {
            Some(UsbSpeed::High) | Some(UsbSpeed::Super) => &self.desc.hs_streaming,
            _ => &self.desc.fs_streaming,
        }
    }

    fn default_control(&self) -> UvcStreamingControl {
        default_control(&self.formats, self.req_size)
    }

    fn find_format(&self, format_index: u8) -> Result<&FormatCaps, UvcError> {
        self.formats.iter().find(|f| f.format_index == format_index).ok_or_else(|| {
            UvcError::Negotiation(format!("unknown format index {}", format_index))
        })
    }

    fn find_frame(fmt: &FormatCaps, frame_index: u8) -> Result<&FrameCaps, UvcError> {
        fmt.frames.iter().find(|f| f.frame_index == frame_index).ok_or_else(|| {
            UvcError::Negotiation(format!(
                "unknown frame index {} for format {}",
                frame_index, fmt.format_index
            ))
        })
    }

    /// Narrows every proposed field into the capability bounds. Only an
    /// unrecognized format/frame index pair is an error; out-of-range values
    /// clamp to the nearest supported ones.
    fn clamp_control(&self, proposed: &UvcStreamingControl) -> Result<UvcStreamingControl, UvcError> {
        let fmt = self.find_format(proposed.b_format_index)?;
        let frame = UvcDevice::find_frame(fmt, proposed.b_frame_index)?;
        let mut ctrl = *proposed;
        ctrl.dw_frame_interval =
            proposed.dw_frame_interval.clamp(frame.min_interval, frame.max_interval);
        ctrl.dw_max_video_frame_size = frame.max_video_frame_size;
        ctrl.dw_max_payload_transfer_size =
            proposed.dw_max_payload_transfer_size.clamp(1, self.req_size as u32);
        ctrl.dw_clock_frequency = UVC_CLOCK_FREQUENCY;
        ctrl.bm_framing_info =
            proposed.bm_framing_info & (UVC_FRAMING_INFO_FID | UVC_FRAMING_INFO_EOF);
        ctrl.b_prefered_version = 1;
        ctrl.b_min_version = 1;
        ctrl.b_max_version = 1;
        return Ok(ctrl);
    }

    /// Probe reply with the frame-interval bound substituted, for
    /// GET_MIN/GET_MAX.
    fn bounded_control(&self, max: bool) -> Result<UvcStreamingControl, UvcError> {
        let fmt = self.find_format(self.probe.b_format_index)?;
        let frame = UvcDevice::find_frame(fmt, self.probe.b_frame_index)?;
        let mut ctrl = self.probe;
        ctrl.dw_frame_interval = if max { frame.max_interval } else { frame.min_interval };
        return Ok(ctrl);
    }

    fn control_reply(
        &self,
        ctrl: &UvcStreamingControl,
        w_length: u16,
    ) -> Result<UvcRequestData, UvcError> {
        let len = if (w_length as usize) >= UVC_STREAMING_CONTROL_SIZE_V11 {
            UVC_STREAMING_CONTROL_SIZE_V11
        } else {
            UVC_STREAMING_CONTROL_SIZE_V10.min(w_length as usize)
        };
        let bytes = ctrl
            .to_bytes(len)
            .map_err(|e| UvcError::Protocol(format!("control serialization failed: {}", e)))?;
        UvcRequestData::from_slice(&bytes)
    }

    /// bind/configure: Disconnected -> Connected. Allocates the streaming
    /// context and its request pool, resets negotiation to the defaults.
    pub fn bind(&mut self, speed: UsbSpeed) -> Result<(), Error> {
        if self.state != UvcState::Disconnected {
            return Err(UvcError::State(format!("bind while {:?}", self.state)).into());
        }
        self.speed = Some(speed);
        let defaults = self.default_control();
        self.probe = defaults;
        self.commit = defaults;
        self.committed = false;
        self.pending = None;

        let fmt = &self.formats[0];
        let frame = &fmt.frames[0];
        self.video = Some(UvcVideo::new(
            fmt.format,
            frame.width as u32,
            frame.height as u32,
            self.req_size,
        )?);
        self.state = UvcState::Connected;
        info!("function bound at {:?} speed", speed);
        self.responder.event(UvcEvent::Connect(speed));
        return Ok(());
    }

    /// USB reset / unbind: any state -> Disconnected. Cancels the data path,
    /// verifies the pool is whole, releases it, resets negotiation.
    pub fn disconnect(&mut self, xfer: &mut dyn TransferService) -> Result<(), Error> {
        if self.state == UvcState::Disconnected {
            return Ok(());
        }
        if let Some(video) = self.video.as_ref() {
            video.cancel(xfer)?;
        }
        self.video = None;
        self.speed = None;
        self.committed = false;
        self.pending = None;
        let defaults = self.default_control();
        self.probe = defaults;
        self.commit = defaults;
        self.state = UvcState::Disconnected;
        info!("function disconnected");
        self.responder.event(UvcEvent::Disconnect);
        return Ok(());
    }

    /// SETUP-stage entry. Returns the IN-stage reply, or `None` when a
    /// DATA-out stage (or nothing) follows. Errors map to a protocol STALL.
    pub fn setup(&mut self, pkt: &SetupPacket) -> Result<Option<UvcRequestData>, UvcError> {
        if self.state == UvcState::Disconnected {
            return Err(UvcError::State("control request while disconnected".to_string()));
        }
        if pkt.w_length as usize > UVC_REQUEST_DATA_MAX {
            return Err(UvcError::Protocol(format!(
                "wLength {} exceeds the {} byte response capacity",
                pkt.w_length, UVC_REQUEST_DATA_MAX
            )));
        }
        debug!("setup: {}", pkt);
        match pkt.xfer_type() {
            Some(XferType::Class)
                if pkt.recipient() == Some(Recip::Iface) && pkt.iface() == self.streaming_intf =>
            {
                self.streaming_setup(pkt)
            }
            _ => self.forward_setup(pkt),
        }
    }

    /// Requests this dispatcher does not answer itself: standard and vendor
    /// requests, and VideoControl unit/terminal controls.
    fn forward_setup(&mut self, pkt: &SetupPacket) -> Result<Option<UvcRequestData>, UvcError> {
        let expects_out = pkt.dir() == Some(XferDir::ToDev) && pkt.w_length > 0;
        let reply = self.responder.event(UvcEvent::Setup(*pkt));
        if expects_out {
            self.pending = Some(PendingSetup {
                target: PendingTarget::Forwarded,
                length: pkt.w_length as usize,
            });
            return Ok(None);
        }
        if pkt.w_length == 0 {
            return Ok(None);
        }
        let mut reply = reply.ok_or_else(|| {
            UvcError::Protocol(format!("no responder reply for forwarded request: {}", pkt))
        })?;
        reply.length = reply.length.min(pkt.w_length as usize);
        return Ok(Some(reply));
    }

    fn streaming_setup(&mut self, pkt: &SetupPacket) -> Result<Option<UvcRequestData>, UvcError> {
        let selector: UvcVsControlSelector = FromPrimitive::from_u8((pkt.w_value >> 8) as u8)
            .ok_or_else(|| {
                UvcError::Protocol(format!("unknown VS control selector in {}", pkt))
            })?;
        let target = match selector {
            UvcVsControlSelector::ProbeControl => PendingTarget::Probe,
            UvcVsControlSelector::CommitControl => PendingTarget::Commit,
            _ => {
                return Err(UvcError::Protocol(format!(
                    "unsupported VS control selector {:?}",
                    selector
                )))
            }
        };
        let code: UvcRequestCodes = FromPrimitive::from_u8(pkt.b_request)
            .ok_or_else(|| UvcError::Protocol(format!("unknown request code in {}", pkt)))?;
        match code {
            UvcRequestCodes::SetCur => {
                if pkt.dir() != Some(XferDir::ToDev) {
                    return Err(UvcError::Protocol("SET_CUR with IN direction".to_string()));
                }
                self.pending = Some(PendingSetup { target, length: pkt.w_length as usize });
                return Ok(None);
            }
            UvcRequestCodes::GetCur => {
                let ctrl = match target {
                    PendingTarget::Commit => self.commit,
                    _ => self.probe,
                };
                return Ok(Some(self.control_reply(&ctrl, pkt.w_length)?));
            }
            UvcRequestCodes::GetMin => {
                let ctrl = self.bounded_control(false)?;
                return Ok(Some(self.control_reply(&ctrl, pkt.w_length)?));
            }
            UvcRequestCodes::GetMax => {
                let ctrl = self.bounded_control(true)?;
                return Ok(Some(self.control_reply(&ctrl, pkt.w_length)?));
            }
            UvcRequestCodes::GetDef => {
                let ctrl = self.default_control();
                return Ok(Some(self.control_reply(&ctrl, pkt.w_length)?));
            }
            UvcRequestCodes::GetLen => {
                let len = UVC_STREAMING_CONTROL_SIZE_V11 as u16;
                let mut reply = UvcRequestData::from_slice(&len.to_le_bytes())?;
                reply.length = reply.length.min(pkt.w_length as usize);
                return Ok(Some(reply));
            }
            UvcRequestCodes::GetInfo => {
                let mut reply = UvcRequestData::from_slice(&[UVC_CONTROL_INFO_GET_SET])?;
                reply.length = reply.length.min(pkt.w_length as usize);
                return Ok(Some(reply));
            }
            _ => Err(UvcError::Protocol(format!("unsupported request code {:?}", code))),
        }
    }

    /// DATA-stage entry for an OUT transfer announced by the last SETUP.
    pub fn data(&mut self, bytes: &[u8]) -> Result<(), UvcError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| UvcError::Protocol("DATA stage without pending SETUP".to_string()))?;
        if bytes.len() > pending.length {
            return Err(UvcError::Protocol(format!(
                "DATA stage of {} bytes, SETUP announced {}",
                bytes.len(),
                pending.length
            )));
        }
        match pending.target {
            PendingTarget::Forwarded => {
                self.responder.event(UvcEvent::Data(UvcRequestData::from_slice(bytes)?));
                return Ok(());
            }
            PendingTarget::Probe => {
                let proposed = UvcStreamingControl::deserialize(&mut &bytes[..])
                    .map_err(|e| UvcError::Protocol(format!("bad probe control: {}", e)))?;
                self.probe = self.clamp_control(&proposed)?;
                debug!(
                    "probed format {} frame {} @ {} fps",
                    self.probe.b_format_index,
                    self.probe.b_frame_index,
                    self.probe.fps()
                );
                return Ok(());
            }
            PendingTarget::Commit => {
                if self.state == UvcState::Streaming {
                    return Err(UvcError::State("COMMIT while streaming".to_string()));
                }
                let proposed = UvcStreamingControl::deserialize(&mut &bytes[..])
                    .map_err(|e| UvcError::Protocol(format!("bad commit control: {}", e)))?;
                let clamped = self.clamp_control(&proposed)?;
                self.probe = clamped;
                self.commit = clamped;
                self.committed = true;
                info!(
                    "committed format {} frame {} @ {} fps, payload limit {}",
                    clamped.b_format_index,
                    clamped.b_frame_index,
                    clamped.fps(),
                    clamped.dw_max_payload_transfer_size
                );
                return Ok(());
            }
        }
    }

    /// STREAMON: Connected -> Streaming, requires a prior valid COMMIT.
    /// Configures the encoder from the committed parameters and starts
    /// draining the buffer queue.
    pub fn stream_on(&mut self, xfer: &mut dyn TransferService) -> Result<(), Error> {
        if self.state != UvcState::Connected {
            return Err(UvcError::State(format!("STREAMON while {:?}", self.state)).into());
        }
        if !self.committed {
            return Err(UvcError::State("STREAMON without a committed control".to_string()).into());
        }
        let (format, width, height) = {
            let fmt = self.find_format(self.commit.b_format_index)?;
            let frame = UvcDevice::find_frame(fmt, self.commit.b_frame_index)?;
            (fmt.format, frame.width as u32, frame.height as u32)
        };
        let commit = self.commit;
        let video = self
            .video
            .as_mut()
            .ok_or_else(|| UvcError::State("no streaming context".to_string()))?;
        video.set_format(format, width, height);
        video.set_payload_limit(commit.dw_max_payload_transfer_size as usize);
        video.set_framing(FramingMode::from_framing_info(commit.bm_framing_info));
        self.state = UvcState::Streaming;
        info!("stream on: {} {}x{}", format, width, height);
        self.responder.event(UvcEvent::StreamOn);
        if let Some(video) = self.video.as_ref() {
            video.pump(xfer)?;
        }
        return Ok(());
    }

    /// STREAMOFF: Streaming -> Connected. Cancels every in-flight request
    /// and waits for their reclamation before the transition completes; the
    /// negotiated control reverts to the defaults.
    pub fn stream_off(&mut self, xfer: &mut dyn TransferService) -> Result<(), Error> {
        if self.state != UvcState::Streaming {
            return Err(UvcError::State(format!("STREAMOFF while {:?}", self.state)).into());
        }
        if let Some(video) = self.video.as_ref() {
            video.cancel(xfer)?;
        }
        let defaults = self.default_control();
        self.probe = defaults;
        self.commit = defaults;
        self.committed = false;
        self.state = UvcState::Connected;
        info!("stream off");
        self.responder.event(UvcEvent::StreamOff);
        return Ok(());
    }

    /// Producer-context entry: hands a captured frame to the queue and, when
    /// streaming, kicks the encoder.
    pub fn queue_buffer(
        &mut self,
        buf: VideoBuffer,
        xfer: &mut dyn TransferService,
    ) -> Result<(), Error> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| UvcError::State("buffer queued while disconnected".to_string()))?;
        video.queue_buffer(buf);
        if self.state == UvcState::Streaming {
            video.pump(xfer)?;
        }
        return Ok(());
    }

    /// Completion-context entry for the transfer service.
    pub fn complete(
        &mut self,
        req: UsbRequest,
        status: XferStatus,
        xfer: &mut dyn TransferService,
    ) -> Result<(), Error> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| UvcError::State("completion after teardown".to_string()))?;
        video.complete(req, status, xfer)
    }
}
