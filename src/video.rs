use std::sync::Mutex;

use anyhow::Error;

use crate::pool::{RequestPool, UsbRequest, UVC_NUM_REQUESTS};
use crate::queue::{VideoBuffer, VideoQueue};
use crate::uvc_proto::{PixelFormat, UvcPayloadHeader, UVC_FRAMING_INFO_EOF, UVC_FRAMING_INFO_FID};

/// Completion status reported by the transfer service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XferStatus {
    Complete,
    Cancelled,
    Error,
}

/// A submission the transfer service refused; the request comes back so the
/// engine can return it to the pool.
#[derive(Debug)]
pub struct SubmitError {
    pub request: UsbRequest,
    pub reason: Error,
}

/// The peripheral-controller service this engine feeds. `submit` hands over
/// ownership of a filled request; the controller later returns it through
/// `UvcVideo::complete`. `cancel_all` must only return once every in-flight
/// request has finished cancelling, so teardown can run in the caller's
/// context with no stale completion left behind.
pub trait TransferService {
    fn submit(&mut self, req: UsbRequest) -> Result<(), SubmitError>;
    fn cancel_all(&mut self) -> Vec<UsbRequest>;
}

/// How frame boundaries are signalled on the wire, derived from the
/// negotiated bmFramingInfo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramingMode {
    /// The final payload of a frame carries the EOF flag. Default.
    EofFlag,
    /// EOF is not advertised; the host relies on the FID toggle alone. A
    /// frame that fills its last payload completely is terminated by an
    /// explicit header-only payload so the toggle stays observable.
    FidOnly,
}

impl FramingMode {
    pub fn from_framing_info(info: u8) -> FramingMode {
        if info & UVC_FRAMING_INFO_FID != 0 && info & UVC_FRAMING_INFO_EOF == 0 {
            FramingMode::FidOnly
        } else {
            FramingMode::EofFlag
        }
    }
}

/// Per-format payload encoding, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeStrategy {
    Uncompressed,
    Mjpeg,
}

impl EncodeStrategy {
    pub fn for_format(format: PixelFormat) -> EncodeStrategy {
        if format.is_compressed() {
            EncodeStrategy::Mjpeg
        } else {
            EncodeStrategy::Uncompressed
        }
    }

    /// Bytes of the buffer that make up the frame on the wire.
    fn frame_len(&self, imagesize: usize, buf: &VideoBuffer) -> usize {
        match self {
            EncodeStrategy::Mjpeg => buf.bytesused,
            EncodeStrategy::Uncompressed => {
                if buf.bytesused != imagesize {
                    warn!(
                        "uncompressed frame of {} bytes, expected {}",
                        buf.bytesused, imagesize
                    );
                }
                buf.bytesused
            }
        }
    }
}

/// Encoder progress shared between the producer and completion contexts.
/// Guarded by one short-held mutex; the request pool has its own.
#[derive(Debug)]
struct EncodeState {
    queue: VideoQueue,
    current: Option<VideoBuffer>,
    /// Bytes of the current frame already handed off.
    offset: usize,
    /// A header-only terminator payload is still owed for the frame that
    /// just ended on an exact payload boundary (FidOnly framing).
    trailer_due: bool,
    fid: bool,
    in_flight: usize,
    dropped: u64,
}

impl EncodeState {
    fn new() -> EncodeState {
        EncodeState {
            queue: VideoQueue::new(),
            current: None,
            offset: 0,
            trailer_due: false,
            fid: false,
            in_flight: 0,
            dropped: 0,
        }
    }
}

/// Per-stream context: frame geometry, the request pool, and the payload
/// encoder. Splits each queued frame into UVC-framed payloads and keeps the
/// FID toggling exactly once per frame.
#[derive(Debug)]
pub struct UvcVideo {
    format: PixelFormat,
    bpp: u8,
    width: u32,
    height: u32,
    imagesize: usize,
    req_size: usize,
    max_payload_size: usize,
    framing: FramingMode,
    encode: EncodeStrategy,
    pool: RequestPool,
    state: Mutex<EncodeState>,
}

impl UvcVideo {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        req_size: usize,
    ) -> Result<UvcVideo, Error> {
        ensure!(
            req_size > UvcPayloadHeader::size(),
            "request size {} leaves no room for payload data after the {} byte header",
            req_size,
            UvcPayloadHeader::size()
        );
        let bpp = format.bpp();
        let imagesize = (width as usize * height as usize * bpp as usize) / 8;
        Ok(UvcVideo {
            format,
            bpp,
            width,
            height,
            imagesize,
            req_size,
            max_payload_size: req_size,
            framing: FramingMode::EofFlag,
            encode: EncodeStrategy::for_format(format),
            pool: RequestPool::new(UVC_NUM_REQUESTS, req_size),
            state: Mutex::new(EncodeState::new()),
        })
    }

    /// Applies the committed format selection. Only legal between streams.
    pub fn set_format(&mut self, format: PixelFormat, width: u32, height: u32) {
        self.format = format;
        self.bpp = format.bpp();
        self.width = width;
        self.height = height;
        self.imagesize = (width as usize * height as usize * self.bpp as usize) / 8;
        self.encode = EncodeStrategy::for_format(format);
        debug!(
            "stream format {} {}x{} imagesize {}",
            self.format, self.width, self.height, self.imagesize
        );
    }

    pub fn set_payload_limit(&mut self, max_payload_size: usize) {
        self.max_payload_size = max_payload_size.max(UvcPayloadHeader::size() + 1);
    }

    pub fn set_framing(&mut self, framing: FramingMode) {
        self.framing = framing;
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn imagesize(&self) -> usize {
        self.imagesize
    }

    /// Data bytes one payload can carry.
    fn max_data_len(&self) -> usize {
        self.req_size.min(self.max_payload_size) - UvcPayloadHeader::size()
    }

    /// Queues a captured frame. The caller pumps afterwards if streaming.
    pub fn queue_buffer(&self, buf: VideoBuffer) {
        self.state.lock().unwrap().queue.push(buf);
    }

    /// The encoder step: emits payloads while a frame is pending and free
    /// requests exist. Never blocks; pool exhaustion skips the opportunity
    /// and bumps the dropped counter, and the next completion retries.
    pub fn pump(&self, xfer: &mut dyn TransferService) -> Result<(), Error> {
        loop {
            let mut st = self.state.lock().unwrap();
            if st.current.is_none() && !st.trailer_due {
                match st.queue.pop() {
                    Some(buf) => {
                        st.current = Some(buf);
                        st.offset = 0;
                    }
                    None => return Ok(()), // NoData
                }
            }
            let mut req = match self.pool.acquire() {
                Some(req) => req,
                None => {
                    st.dropped += 1;
                    trace!("request pool exhausted, dropped {} so far", st.dropped);
                    return Ok(());
                }
            };

            if st.trailer_due {
                // header-only payload marking the boundary of the frame that
                // ended exactly on a payload boundary
                let header = UvcPayloadHeader::new(false, st.fid);
                req.fill(&header, &[])?;
                st.trailer_due = false;
                st.fid = !st.fid;
            } else {
                let buf = st.current.as_ref().unwrap();
                let frame_len = self.encode.frame_len(self.imagesize, buf);
                let remaining = frame_len.saturating_sub(st.offset);
                let chunk = remaining.min(self.max_data_len());
                let ends_frame = chunk == remaining;
                let eof = ends_frame && self.framing == FramingMode::EofFlag;
                let header = UvcPayloadHeader::new(eof, st.fid);
                let start = st.offset;
                req.fill(&header, &buf.data[start..start + chunk])?;
                st.offset += chunk;
                if ends_frame {
                    st.current = None;
                    st.offset = 0;
                    if self.framing == FramingMode::FidOnly
                        && chunk == self.max_data_len()
                        && chunk > 0
                    {
                        st.trailer_due = true;
                    } else {
                        st.fid = !st.fid;
                    }
                }
            }

            st.in_flight += 1;
            drop(st);

            if let Err(SubmitError { request, reason }) = xfer.submit(req) {
                warn!("payload submission failed: {}", reason);
                self.pool.release(request);
                let mut st = self.state.lock().unwrap();
                st.in_flight -= 1;
                st.dropped += 1;
            }
        }
    }

    /// Completion-context entry: reclaims the request and, unless the stream
    /// is tearing down, immediately retries the encoder.
    pub fn complete(
        &self,
        req: UsbRequest,
        status: XferStatus,
        xfer: &mut dyn TransferService,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().in_flight -= 1;
        self.pool.release(req);
        match status {
            XferStatus::Complete => self.pump(xfer),
            XferStatus::Cancelled => Ok(()),
            XferStatus::Error => {
                warn!("transfer completed with error");
                self.pump(xfer)
            }
        }
    }

    /// Synchronous teardown of the data path: every in-flight request is
    /// cancelled and reclaimed before this returns, and the frame queue is
    /// drained. Runs in the caller's context, never the completion one.
    pub fn cancel(&self, xfer: &mut dyn TransferService) -> Result<(), Error> {
        for req in xfer.cancel_all() {
            self.pool.release(req);
        }
        let mut st = self.state.lock().unwrap();
        st.queue.clear();
        st.current = None;
        st.offset = 0;
        st.trailer_due = false;
        st.fid = false;
        st.in_flight = 0;
        drop(st);
        if self.pool.free_len() != self.pool.size() {
            bail!(
                "request leak: {} of {} requests free after cancel",
                self.pool.free_len(),
                self.pool.size()
            );
        }
        return Ok(());
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    pub fn pending_frames(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.queue.len() + st.current.is_some() as usize
    }

    pub fn free_requests(&self) -> usize {
        self.pool.free_len()
    }

    pub fn request_count(&self) -> usize {
        self.pool.size()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crate::logger::setup_logger;
    use crate::uvc_proto::UVC_STREAM_EOF;

    use super::*;

    fn setup() {
        setup_logger();
    }

    struct FakeXfer {
        in_flight: VecDeque<UsbRequest>,
        payloads: Vec<Vec<u8>>,
        refuse: bool,
    }

    impl FakeXfer {
        fn new() -> FakeXfer {
            FakeXfer { in_flight: VecDeque::new(), payloads: vec![], refuse: false }
        }
    }

    impl TransferService for FakeXfer {
        fn submit(&mut self, req: UsbRequest) -> Result<(), SubmitError> {
            if self.refuse {
                return Err(SubmitError { request: req, reason: anyhow!("endpoint disabled") });
            }
            self.payloads.push(req.data().to_vec());
            self.in_flight.push_back(req);
            Ok(())
        }

        fn cancel_all(&mut self) -> Vec<UsbRequest> {
            self.in_flight.drain(..).collect()
        }
    }

    const REQ_SIZE: usize = 32;

    fn test_video() -> UvcVideo {
        // 30 data bytes per payload after the 2-byte header
        UvcVideo::new(PixelFormat::Mjpeg, 640, 480, REQ_SIZE).unwrap()
    }

    /// Completes submitted requests one by one, letting each completion
    /// re-pump, until the stream is idle.
    fn drain(video: &UvcVideo, xfer: &mut FakeXfer) {
        while let Some(req) = xfer.in_flight.pop_front() {
            video.complete(req, XferStatus::Complete, xfer).unwrap();
        }
    }

    fn encode_frame(video: &UvcVideo, xfer: &mut FakeXfer, frame: Vec<u8>) {
        video.queue_buffer(VideoBuffer::new(frame));
        video.pump(xfer).unwrap();
        drain(video, xfer);
    }

    #[test]
    fn frame_splits_into_bounded_payloads_with_single_eof() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        // 10 full payloads plus a 3-byte tail
        let frame: Vec<u8> = (0..(10 * cap + 3)).map(|i| (i % 251) as u8).collect();
        encode_frame(&video, &mut xfer, frame.clone());

        assert_eq!(xfer.payloads.len(), 11);
        for payload in &xfer.payloads[..10] {
            assert_eq!(payload.len(), REQ_SIZE);
        }
        assert_eq!(xfer.payloads[10].len(), 3 + UvcPayloadHeader::size());

        let mut reassembled = vec![];
        let mut eof_count = 0;
        for payload in &xfer.payloads {
            let mut slice = &payload[..];
            let header = UvcPayloadHeader::deserialize(&mut slice).unwrap();
            if header.eof() {
                eof_count += 1;
            }
            reassembled.extend_from_slice(slice);
        }
        assert_eq!(eof_count, 1);
        let last = xfer.payloads.last().unwrap();
        assert_ne!(last[1] & UVC_STREAM_EOF, 0);
        assert_eq!(reassembled, frame);
        assert_eq!(video.free_requests(), video.request_count());
    }

    #[test]
    fn fid_toggles_exactly_once_per_frame() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        for _ in 0..5 {
            encode_frame(&video, &mut xfer, vec![0u8; 10]);
        }
        let fids: Vec<bool> = xfer
            .payloads
            .iter()
            .map(|p| {
                let mut slice = &p[..];
                UvcPayloadHeader::deserialize(&mut slice).unwrap().fid()
            })
            .collect();
        assert_eq!(fids, vec![false, true, false, true, false]);
    }

    #[test]
    fn frames_are_encoded_in_fifo_order_without_interleaving() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        // both frames queued before any payload is emitted
        video.queue_buffer(VideoBuffer::new(vec![0xaa; 3 * cap + 7]));
        video.queue_buffer(VideoBuffer::new(vec![0xbb; cap + 1]));
        video.pump(&mut xfer).unwrap();
        drain(&video, &mut xfer);

        assert_eq!(xfer.payloads.len(), 6);
        let bodies: Vec<&[u8]> = xfer.payloads.iter().map(|p| &p[2..]).collect();
        for body in &bodies[..4] {
            assert!(body.iter().all(|b| *b == 0xaa));
        }
        for body in &bodies[4..] {
            assert!(body.iter().all(|b| *b == 0xbb));
        }
        // frame boundary visible in the FID flip between payloads 3 and 4
        assert_ne!(xfer.payloads[3][1] & 0x01, xfer.payloads[4][1] & 0x01);
    }

    #[test]
    fn exact_multiple_frame_ends_with_eof_on_last_full_payload() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        encode_frame(&video, &mut xfer, vec![1u8; 2 * cap]);

        assert_eq!(xfer.payloads.len(), 2);
        assert_eq!(xfer.payloads[1].len(), REQ_SIZE);
        assert_eq!(xfer.payloads[0][1] & UVC_STREAM_EOF, 0);
        assert_ne!(xfer.payloads[1][1] & UVC_STREAM_EOF, 0);
    }

    #[test]
    fn fid_only_framing_appends_header_only_terminator() {
        setup();
        let mut video = test_video();
        video.set_framing(FramingMode::FidOnly);
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        encode_frame(&video, &mut xfer, vec![1u8; 2 * cap]);
        encode_frame(&video, &mut xfer, vec![2u8; 5]);

        // two full payloads, the terminator, then the second frame
        assert_eq!(xfer.payloads.len(), 4);
        assert_eq!(xfer.payloads[2].len(), UvcPayloadHeader::size());
        // EOF never set in FID-only framing
        for payload in &xfer.payloads {
            assert_eq!(payload[1] & UVC_STREAM_EOF, 0);
        }
        // terminator carries the first frame's FID; the next frame toggles
        assert_eq!(xfer.payloads[2][1] & 0x01, xfer.payloads[0][1] & 0x01);
        assert_ne!(xfer.payloads[3][1] & 0x01, xfer.payloads[2][1] & 0x01);
    }

    #[test]
    fn pool_exhaustion_skips_and_counts() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        video.queue_buffer(VideoBuffer::new(vec![0u8; 10 * cap]));
        video.pump(&mut xfer).unwrap();

        assert_eq!(xfer.in_flight.len(), UVC_NUM_REQUESTS);
        assert!(video.dropped() >= 1);

        drain(&video, &mut xfer);
        assert_eq!(xfer.payloads.len(), 10);
        assert_eq!(video.free_requests(), video.request_count());
    }

    #[test]
    fn refused_submission_returns_request_to_pool() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        xfer.refuse = true;

        video.queue_buffer(VideoBuffer::new(vec![0u8; 8]));
        video.pump(&mut xfer).unwrap();

        assert_eq!(xfer.payloads.len(), 0);
        assert_eq!(video.free_requests(), video.request_count());
        assert_eq!(video.in_flight(), 0);
        assert_eq!(video.dropped(), 1);
    }

    #[test]
    fn request_size_must_exceed_the_header() {
        setup();
        assert!(UvcVideo::new(PixelFormat::Mjpeg, 640, 480, 0).is_err());
        assert!(UvcVideo::new(PixelFormat::Mjpeg, 640, 480, UvcPayloadHeader::size()).is_err());
        assert!(
            UvcVideo::new(PixelFormat::Mjpeg, 640, 480, UvcPayloadHeader::size() + 1).is_ok()
        );
    }

    #[test]
    fn cancel_reclaims_every_in_flight_request() {
        setup();
        let video = test_video();
        let mut xfer = FakeXfer::new();
        let cap = REQ_SIZE - UvcPayloadHeader::size();

        video.queue_buffer(VideoBuffer::new(vec![0u8; 8 * cap]));
        video.queue_buffer(VideoBuffer::new(vec![0u8; 8 * cap]));
        video.pump(&mut xfer).unwrap();
        assert_eq!(video.free_requests(), 0);

        video.cancel(&mut xfer).unwrap();
        assert_eq!(video.free_requests(), video.request_count());
        assert_eq!(video.in_flight(), 0);
        assert_eq!(video.pending_frames(), 0);
    }
}
