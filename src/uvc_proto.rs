#![allow(dead_code)]

use std::fmt::{Display, Formatter};
use std::io::Write;

use anyhow::Error;
use uuid::Uuid;

// UVC
// https://www.spinelelectronics.com/pdf/UVC%201.5%20Class%20specification.pdf
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/video.h

#[derive(FromPrimitive)]
#[repr(u8)]
pub enum UvcInterfaceSubClass {
    Undefined = 0x00,
    VideoControl = 0x01,
    VideoStreaming = 0x02,
    VideoInterfaceCollection = 0x03,
}

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum UvcRequestCodes {
    Undefined = 0x00,
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

/// VideoStreaming interface control selectors (wValue high byte), 4.3.1.
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum UvcVsControlSelector {
    ControlUndefined = 0x00,
    ProbeControl = 0x01,
    CommitControl = 0x02,
    StillProbeControl = 0x03,
    StillCommitControl = 0x04,
    StillImageTriggerControl = 0x05,
    StreamErrorCodeControl = 0x06,
    GenerateKeyFrameControl = 0x07,
    UpdateFrameSegmentControl = 0x08,
    SyncDelayControl = 0x09,
}

// bmHeaderInfo bits (Video and Still Image Payload Headers, 2.4.3.3)
pub const UVC_STREAM_EOH: u8 = 1 << 7;
pub const UVC_STREAM_ERR: u8 = 1 << 6;
pub const UVC_STREAM_STI: u8 = 1 << 5;
pub const UVC_STREAM_RES: u8 = 1 << 4;
pub const UVC_STREAM_SCR: u8 = 1 << 3;
pub const UVC_STREAM_PTS: u8 = 1 << 2;
pub const UVC_STREAM_EOF: u8 = 1 << 1;
pub const UVC_STREAM_FID: u8 = 1 << 0;

// bmFramingInfo bits of the streaming control
pub const UVC_FRAMING_INFO_FID: u8 = 1 << 0;
pub const UVC_FRAMING_INFO_EOF: u8 = 1 << 1;

/// GET_INFO reply: control supports both GET and SET.
pub const UVC_CONTROL_INFO_GET_SET: u8 = 0x03;

pub const UVC_CLOCK_FREQUENCY: u32 = 48_000_000;

/// Minimal per-payload header: length byte plus bmHeaderInfo. PTS/SCR are
/// never advertised, so no extension fields follow.
#[derive(Debug, Clone, Copy)]
pub struct UvcPayloadHeader {
    pub b_header_length: u8,
    pub bm_header_info: u8,
}

impl UvcPayloadHeader {
    pub fn new(eof: bool, fid: bool) -> UvcPayloadHeader {
        let mut flags = UVC_STREAM_EOH;
        if eof {
            flags |= UVC_STREAM_EOF;
        }
        if fid {
            flags |= UVC_STREAM_FID;
        }
        UvcPayloadHeader {
            b_header_length: UvcPayloadHeader::size() as u8,
            bm_header_info: flags,
        }
    }

    pub fn size() -> usize {
        let format = structure!("<BB");
        return format.size();
    }

    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<UvcPayloadHeader, Error> {
        let format = structure!("<BB");
        let (b_header_length, bm_header_info) = format.unpack_from(&mut buffer)?;
        let msg = UvcPayloadHeader { b_header_length, bm_header_info };
        return Ok(msg);
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<BB");
        format.pack_into(&mut buffer, self.b_header_length, self.bm_header_info)?;
        return Ok(());
    }

    pub fn eof(&self) -> bool {
        self.bm_header_info & UVC_STREAM_EOF != 0
    }

    pub fn fid(&self) -> bool {
        self.bm_header_info & UVC_STREAM_FID != 0
    }
}

/// UVC 1.0 hosts exchange the first 26 bytes only.
pub const UVC_STREAMING_CONTROL_SIZE_V10: usize = 26;
pub const UVC_STREAMING_CONTROL_SIZE_V11: usize = 34;

/// The PROBE/COMMIT wire structure, packed little-endian. The byte layout is
/// the interoperability contract with the host and must not change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvcStreamingControl {
    pub bm_hint: u16,
    pub b_format_index: u8,
    pub b_frame_index: u8,
    pub dw_frame_interval: u32,
    pub w_key_frame_rate: u16,
    pub w_pframe_rate: u16,
    pub w_comp_quality: u16,
    pub w_comp_window_size: u16,
    pub w_delay: u16,
    pub dw_max_video_frame_size: u32,
    pub dw_max_payload_transfer_size: u32,
    pub dw_clock_frequency: u32,
    pub bm_framing_info: u8,
    pub b_prefered_version: u8,
    pub b_min_version: u8,
    pub b_max_version: u8,
}

impl UvcStreamingControl {
    /// Accepts either the 26-byte (UVC 1.0) or 34-byte (UVC 1.1) layout.
    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<UvcStreamingControl, Error> {
        if buffer.len() < UVC_STREAMING_CONTROL_SIZE_V10 {
            bail!("streaming control of {} bytes is too short", buffer.len());
        }
        let has_tail = buffer.len() >= UVC_STREAMING_CONTROL_SIZE_V11;
        let format = structure!("<HBBIHHHHHII");
        let (bm_hint, b_format_index, b_frame_index, dw_frame_interval, w_key_frame_rate,
            w_pframe_rate, w_comp_quality, w_comp_window_size, w_delay, dw_max_video_frame_size,
            dw_max_payload_transfer_size) = format.unpack_from(&mut buffer)?;
        let mut msg = UvcStreamingControl {
            bm_hint,
            b_format_index,
            b_frame_index,
            dw_frame_interval,
            w_key_frame_rate,
            w_pframe_rate,
            w_comp_quality,
            w_comp_window_size,
            w_delay,
            dw_max_video_frame_size,
            dw_max_payload_transfer_size,
            dw_clock_frequency: 0,
            bm_framing_info: 0,
            b_prefered_version: 0,
            b_min_version: 0,
            b_max_version: 0,
        };
        if has_tail {
            let tail = structure!("<IBBBB");
            let (dw_clock_frequency, bm_framing_info, b_prefered_version, b_min_version,
                b_max_version) = tail.unpack_from(&mut buffer)?;
            msg.dw_clock_frequency = dw_clock_frequency;
            msg.bm_framing_info = bm_framing_info;
            msg.b_prefered_version = b_prefered_version;
            msg.b_min_version = b_min_version;
            msg.b_max_version = b_max_version;
        }
        return Ok(msg);
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<HBBIHHHHHIIIBBBB");
        format.pack_into(&mut buffer,
                         self.bm_hint, self.b_format_index, self.b_frame_index,
                         self.dw_frame_interval, self.w_key_frame_rate, self.w_pframe_rate,
                         self.w_comp_quality, self.w_comp_window_size, self.w_delay,
                         self.dw_max_video_frame_size, self.dw_max_payload_transfer_size,
                         self.dw_clock_frequency, self.bm_framing_info, self.b_prefered_version,
                         self.b_min_version, self.b_max_version,
        )?;
        return Ok(());
    }

    /// Serializes truncated to `len` bytes, as negotiated via the host's
    /// wLength (26 for UVC 1.0 hosts).
    pub fn to_bytes(&self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![];
        self.serialize(&mut buf)?;
        buf.truncate(len.min(UVC_STREAMING_CONTROL_SIZE_V11));
        return Ok(buf);
    }

    pub fn fps(&self) -> i32 {
        (1.0f32 / (self.dw_frame_interval as f32 / 10000000.0)).round() as i32
    }
}

#[non_exhaustive]
pub struct UncompressedFormats;

impl UncompressedFormats {
    pub const YUY2: Uuid = Uuid::from_bytes([0x32, 0x59, 0x55, 0x59, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);
    pub const NV12: Uuid = Uuid::from_bytes([0x32, 0x31, 0x56, 0x4E, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);
}

/// Pixel formats the payload encoder supports.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PixelFormat {
    Yuy2,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    pub fn bpp(&self) -> u8 {
        match self {
            PixelFormat::Yuy2 => 16,
            PixelFormat::Nv12 => 12,
            PixelFormat::Mjpeg => 16,
        }
    }

    pub fn guid(&self) -> Option<Uuid> {
        match self {
            PixelFormat::Yuy2 => Some(UncompressedFormats::YUY2),
            PixelFormat::Nv12 => Some(UncompressedFormats::NV12),
            PixelFormat::Mjpeg => None,
        }
    }

    /// True for formats whose frames vary in size; the encoder then trusts
    /// the producer's byte count over the computed image size.
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let fourcc = match self {
            PixelFormat::Yuy2 => "YUY2",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Mjpeg => "MJPG",
        };
        write!(f, "{}", fourcc)
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::logger::setup_logger;

    use super::*;

    fn setup() {
        setup_logger();
    }

    fn sample_control() -> UvcStreamingControl {
        UvcStreamingControl {
            bm_hint: 1,
            b_format_index: 1,
            b_frame_index: 2,
            dw_frame_interval: 333333,
            w_key_frame_rate: 0,
            w_pframe_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 32,
            dw_max_video_frame_size: 1280 * 720 * 2,
            dw_max_payload_transfer_size: 3072,
            dw_clock_frequency: UVC_CLOCK_FREQUENCY,
            bm_framing_info: UVC_FRAMING_INFO_FID | UVC_FRAMING_INFO_EOF,
            b_prefered_version: 1,
            b_min_version: 1,
            b_max_version: 1,
        }
    }

    #[test]
    fn streaming_control_v11_round_trip() {
        setup();
        let ctrl = sample_control();
        let bytes = ctrl.to_bytes(UVC_STREAMING_CONTROL_SIZE_V11).unwrap();
        assert_eq!(bytes.len(), UVC_STREAMING_CONTROL_SIZE_V11);
        // spot-check the packed little-endian layout
        assert_eq!(&bytes[0..2], &[0x01, 0x00]); // bmHint
        assert_eq!(bytes[2], 1); // bFormatIndex
        assert_eq!(bytes[3], 2); // bFrameIndex
        assert_eq!(&bytes[4..8], &333333u32.to_le_bytes());
        assert_eq!(&bytes[22..26], &3072u32.to_le_bytes());
        assert_eq!(&bytes[26..30], &UVC_CLOCK_FREQUENCY.to_le_bytes());

        let mut slice = &bytes[..];
        let parsed = UvcStreamingControl::deserialize(&mut slice).unwrap();
        assert_eq!(parsed, ctrl);
    }

    #[test]
    fn streaming_control_v10_truncation() {
        setup();
        let ctrl = sample_control();
        let bytes = ctrl.to_bytes(UVC_STREAMING_CONTROL_SIZE_V10).unwrap();
        assert_eq!(bytes.len(), UVC_STREAMING_CONTROL_SIZE_V10);

        let mut slice = &bytes[..];
        let parsed = UvcStreamingControl::deserialize(&mut slice).unwrap();
        assert_eq!(parsed.dw_frame_interval, ctrl.dw_frame_interval);
        assert_eq!(parsed.dw_max_payload_transfer_size, ctrl.dw_max_payload_transfer_size);
        // 1.0 layout carries no clock/framing tail
        assert_eq!(parsed.dw_clock_frequency, 0);
        assert_eq!(parsed.bm_framing_info, 0);
    }

    #[test]
    fn streaming_control_rejects_short_buffer() {
        setup();
        let bytes = [0u8; UVC_STREAMING_CONTROL_SIZE_V10 - 1];
        let mut slice = &bytes[..];
        assert!(UvcStreamingControl::deserialize(&mut slice).is_err());
    }

    #[test]
    fn frame_interval_to_fps() {
        setup();
        let ctrl = sample_control();
        assert_eq!(ctrl.fps(), 30);
        assert_float_eq!(ctrl.dw_frame_interval as f32 / 10000000.0, 0.0333333, abs <= 1e-6);
    }

    #[test]
    fn payload_header_flags() {
        setup();
        let hdr = UvcPayloadHeader::new(true, false);
        let mut buf = vec![];
        hdr.serialize(&mut buf).unwrap();
        assert_eq!(buf, vec![2, UVC_STREAM_EOH | UVC_STREAM_EOF]);

        let mut slice = &buf[..];
        let parsed = UvcPayloadHeader::deserialize(&mut slice).unwrap();
        assert!(parsed.eof());
        assert!(!parsed.fid());
    }
}
