//! Function-side (gadget) UVC streaming engine: PROBE/COMMIT negotiation,
//! the streaming state machine, and the payload encoder that splits captured
//! frames into header-prefixed USB transfers.

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate structure;

mod error;
mod function;
mod logger;
mod pool;
mod queue;
mod usb_proto;
mod uvc_proto;
mod video;

pub use crate::error::UvcError;
pub use crate::function::{FormatCaps, FrameCaps, UvcDescriptors, UvcDevice, UvcState};
pub use crate::logger::setup_logger;
pub use crate::pool::{RequestPool, UsbRequest, UVC_NUM_REQUESTS};
pub use crate::queue::{VideoBuffer, VideoQueue};
pub use crate::usb_proto::{
    EventResponder, Recip, SetupPacket, UsbSpeed, UvcEvent, UvcRequestData, XferDir, XferType,
    UVC_REQUEST_DATA_MAX,
};
pub use crate::uvc_proto::{
    PixelFormat, UvcPayloadHeader, UvcRequestCodes, UvcStreamingControl, UvcVsControlSelector,
};
pub use crate::video::{FramingMode, SubmitError, TransferService, UvcVideo, XferStatus};
