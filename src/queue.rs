use std::collections::VecDeque;

/// One captured frame handed off by the producer. `bytesused` may be smaller
/// than the backing storage for variable-size (compressed) formats.
#[derive(Debug, Clone)]
pub struct VideoBuffer {
    pub data: Vec<u8>,
    pub bytesused: usize,
}

impl VideoBuffer {
    pub fn new(data: Vec<u8>) -> VideoBuffer {
        let bytesused = data.len();
        VideoBuffer { data, bytesused }
    }

    pub fn with_bytesused(data: Vec<u8>, bytesused: usize) -> VideoBuffer {
        VideoBuffer { data, bytesused }
    }
}

/// Strict FIFO handoff from the capture producer to the payload encoder.
/// `pop` is non-blocking; emptiness is a normal outcome, not a suspension.
#[derive(Debug, Default)]
pub struct VideoQueue {
    bufs: VecDeque<VideoBuffer>,
}

impl VideoQueue {
    pub fn new() -> VideoQueue {
        VideoQueue { bufs: VecDeque::new() }
    }

    pub fn push(&mut self, buf: VideoBuffer) {
        self.bufs.push_back(buf);
    }

    pub fn pop(&mut self) -> Option<VideoBuffer> {
        self.bufs.pop_front()
    }

    pub fn clear(&mut self) {
        self.bufs.clear();
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
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
    fn pop_preserves_arrival_order() {
        setup();
        let mut queue = VideoQueue::new();
        queue.push(VideoBuffer::new(vec![1]));
        queue.push(VideoBuffer::new(vec![2]));
        queue.push(VideoBuffer::new(vec![3]));
        assert_eq!(queue.pop().unwrap().data, vec![1]);
        assert_eq!(queue.pop().unwrap().data, vec![2]);
        assert_eq!(queue.pop().unwrap().data, vec![3]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn clear_drains_pending_buffers() {
        setup();
        let mut queue = VideoQueue::new();
        queue.push(VideoBuffer::new(vec![0u8; 16]));
        queue.push(VideoBuffer::new(vec![0u8; 16]));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
