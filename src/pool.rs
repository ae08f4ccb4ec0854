use std::sync::Mutex;

use anyhow::Error;

use crate::uvc_proto::UvcPayloadHeader;

/// Number of preallocated transfer requests per stream.
pub const UVC_NUM_REQUESTS: usize = 4;

/// One hardware transfer descriptor plus its owned payload buffer. A request
/// is always in exactly one place: the pool's free list, the transfer
/// service (in flight), or the completion path handing it back.
#[derive(Debug)]
pub struct UsbRequest {
    slot: usize,
    buf: Vec<u8>,
    capacity: usize,
}

impl UsbRequest {
    fn new(slot: usize, capacity: usize) -> UsbRequest {
        UsbRequest { slot, buf: Vec::with_capacity(capacity), capacity }
    }

    /// Opaque handle identifying the underlying transfer descriptor.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes one framed payload: header followed by the data chunk. The
    /// caller sizes the chunk so the total never exceeds the buffer.
    pub fn fill(&mut self, header: &UvcPayloadHeader, chunk: &[u8]) -> Result<(), Error> {
        if UvcPayloadHeader::size() + chunk.len() > self.capacity {
            bail!(
                "payload of {} bytes exceeds request capacity {}",
                UvcPayloadHeader::size() + chunk.len(),
                self.capacity
            );
        }
        self.buf.clear();
        header.serialize(&mut self.buf)?;
        self.buf.extend_from_slice(chunk);
        return Ok(());
    }

    /// The framed bytes queued for transfer.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Fixed-size pool of transfer requests. `acquire` is try-only because the
/// hot caller runs in completion context; exhaustion is a normal outcome.
/// The lock is held only across the free-list splice.
#[derive(Debug)]
pub struct RequestPool {
    free: Mutex<Vec<UsbRequest>>,
    size: usize,
}

impl RequestPool {
    pub fn new(size: usize, req_size: usize) -> RequestPool {
        let free = (0..size).map(|slot| UsbRequest::new(slot, req_size)).collect();
        RequestPool { free: Mutex::new(free), size }
    }

    pub fn acquire(&self) -> Option<UsbRequest> {
        self.free.lock().unwrap().pop()
    }

    pub fn release(&self, mut req: UsbRequest) {
        req.reset();
        self.free.lock().unwrap().push(req);
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use crate::logger::setup_logger;

    use super::*;

    fn setup() {
        setup_logger();
    }

    #[test]
    fn acquire_never_hands_out_a_request_twice() {
        setup();
        let pool = RequestPool::new(UVC_NUM_REQUESTS, 64);
        let mut held = vec![];
        for _ in 0..UVC_NUM_REQUESTS {
            held.push(pool.acquire().unwrap());
        }
        let mut slots: Vec<usize> = held.iter().map(|r| r.slot()).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), UVC_NUM_REQUESTS);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn release_makes_a_request_acquirable_again() {
        setup();
        let pool = RequestPool::new(1, 64);
        let req = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(req);
        assert_eq!(pool.free_len(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn fill_rejects_oversize_payload() {
        setup();
        let pool = RequestPool::new(1, 16);
        let mut req = pool.acquire().unwrap();
        let header = UvcPayloadHeader::new(false, false);
        assert!(req.fill(&header, &[0u8; 14]).is_ok());
        assert_eq!(req.data().len(), 16);
        assert!(req.fill(&header, &[0u8; 15]).is_err());
    }
}
