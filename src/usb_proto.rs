// derived from /usr/include/linux/usb/ch9.h
#![allow(dead_code)]

use anyhow::Error;
use num_traits::FromPrimitive;
use std::fmt::{Debug, Display, Formatter};
use std::io::Write;

use crate::error::UvcError;

// 9.3 USB Device Requests
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferDir {
    ToDev = 0x00,
    ToHost = 0x80,
}
pub const USB_DIR_MASK: u8 = 0x1 << 7;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferType {
    Std = 0x00,
    Class = 0x20,
    Vendor = 0x40,
    Reserved = 0x60,
}
pub const USB_XFER_TYPE_MASK: u8 = 0x03 << 5;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Recip {
    Dev = 0x00,
    Iface = 0x01,
    Ep = 0x02,
    Other = 0x03,
}
pub const USB_RECIP_MASK: u8 = 0x1f;

/// Connection speed reported by the peripheral controller on connect.
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum UsbSpeed {
    Low = 1,
    Full = 2,
    High = 3,
    Super = 5,
}

/// The 8-byte SETUP stage packet, USB 2.0 section 9.3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<SetupPacket, Error> {
        let format = structure!("<BBHHH");
        let (bm_request_type, b_request, w_value, w_index, w_length) =
            format.unpack_from(&mut buffer)?;
        let msg = SetupPacket { bm_request_type, b_request, w_value, w_index, w_length };
        return Ok(msg);
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<BBHHH");
        format.pack_into(
            &mut buffer,
            self.bm_request_type,
            self.b_request,
            self.w_value,
            self.w_index,
            self.w_length,
        )?;
        return Ok(());
    }

    pub fn size() -> usize {
        structure!("<BBHHH").size()
    }

    pub fn dir(&self) -> Option<XferDir> {
        FromPrimitive::from_u8(self.bm_request_type & USB_DIR_MASK)
    }

    pub fn xfer_type(&self) -> Option<XferType> {
        FromPrimitive::from_u8(self.bm_request_type & USB_XFER_TYPE_MASK)
    }

    pub fn recipient(&self) -> Option<Recip> {
        FromPrimitive::from_u8(self.bm_request_type & USB_RECIP_MASK)
    }

    pub fn is_in(&self) -> bool {
        self.dir() == Some(XferDir::ToHost)
    }

    /// Interface number for interface-recipient requests.
    pub fn iface(&self) -> u8 {
        (self.w_index & 0xff) as u8
    }
}

impl Display for SetupPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bmRequestType {:#04x} bRequest {:#04x} wValue {:#06x} wIndex {:#06x} wLength {}",
            self.bm_request_type, self.b_request, self.w_value, self.w_index, self.w_length
        )
    }
}

/// Capacity of one control-channel exchange. Fixed wire contract with the
/// responder; class requests never carry more.
pub const UVC_REQUEST_DATA_MAX: usize = 60;

/// A bounded request/response payload exchanged with the external responder
/// and echoed back to the host during the DATA stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvcRequestData {
    pub length: usize,
    pub data: [u8; UVC_REQUEST_DATA_MAX],
}

impl UvcRequestData {
    pub fn empty() -> UvcRequestData {
        UvcRequestData { length: 0, data: [0u8; UVC_REQUEST_DATA_MAX] }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<UvcRequestData, UvcError> {
        if bytes.len() > UVC_REQUEST_DATA_MAX {
            return Err(UvcError::Protocol(format!(
                "control payload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                UVC_REQUEST_DATA_MAX
            )));
        }
        let mut msg = UvcRequestData::empty();
        msg.length = bytes.len();
        msg.data[..bytes.len()].copy_from_slice(bytes);
        return Ok(msg);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

/// Notification delivered to the external responder. One case per event kind;
/// `Setup` may yield a reply consumed during the following DATA stage.
#[derive(Debug, Clone, PartialEq)]
pub enum UvcEvent {
    Connect(UsbSpeed),
    Disconnect,
    Setup(SetupPacket),
    Data(UvcRequestData),
    StreamOn,
    StreamOff,
}

/// External collaborator consuming forwarded control traffic, e.g. a
/// user-space policy process answering VideoControl unit requests.
pub trait EventResponder {
    fn event(&mut self, event: UvcEvent) -> Option<UvcRequestData>;
}
