use std::sync::{Arc, Mutex};

/// One video frame's worth of pixels, owned by whoever currently holds it.
///
/// Frames are allocated once at stream start and cycle free-pool →
/// in-flight → consumer → free-pool. The `handle` identifies the frame
/// within its pool; the consumer returns it with [`FramePool::release`].
#[derive(Debug)]
pub struct VideoFrame {
    pub data: Box<[u8]>,
    pub data_size: usize,
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    /// Camera presentation timestamp of the first payload of this frame.
    pub pts: u32,
    /// Host monotonic time the first payload of this frame arrived, ns.
    pub start_ts: u64,
    handle: usize,
}

impl VideoFrame {
    pub fn handle(&self) -> usize {
        self.handle
    }
}

/// Fixed pool of pre-allocated video frames.
///
/// Never blocks: when the pool runs dry the stream drops the in-progress
/// camera frame instead of waiting.
pub struct FramePool {
    frame_size: usize,
    n_allocated: usize,
    free: Mutex<Vec<VideoFrame>>,
}

impl FramePool {
    pub fn new(
        min_frames: usize,
        frame_size: usize,
        stride: u32,
        width: u32,
        height: u32,
    ) -> Arc<FramePool> {
        debug_assert_eq!(frame_size, (stride * height) as usize);

        let free = (0..min_frames)
            .map(|handle| VideoFrame {
                data: vec![0u8; frame_size].into_boxed_slice(),
                data_size: frame_size,
                stride,
                width,
                height,
                pts: 0,
                start_ts: 0,
                handle,
            })
            .collect();

        Arc::new(FramePool {
            frame_size,
            n_allocated: min_frames,
            free: Mutex::new(free),
        })
    }

    /// Pop a free frame, or `None` if the pool is exhausted.
    pub fn try_acquire(&self) -> Option<VideoFrame> {
        self.free.lock().unwrap().pop()
    }

    /// Return a frame to the free list.
    pub fn release(&self, frame: VideoFrame) {
        debug_assert_eq!(frame.data_size, self.frame_size);
        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < self.n_allocated);
        free.push(frame);
    }

    pub fn n_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn n_allocated(&self) -> usize {
        self.n_allocated
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("frame_size", &self.frame_size)
            .field("n_allocated", &self.n_allocated)
            .field("n_free", &self.n_free())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_cycles_frames() {
        let pool = FramePool::new(2, 64, 8, 8, 8);
        assert_eq!(pool.n_allocated(), 2);
        assert_eq!(pool.n_free(), 2);

        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(pool.n_free(), 0);
        assert!(pool.try_acquire().is_none());

        pool.release(a);
        assert_eq!(pool.n_free(), 1);
        pool.release(b);
        assert_eq!(pool.n_free(), 2);
    }

    #[test]
    fn frames_are_sized_to_the_pool() {
        let pool = FramePool::new(1, 24, 6, 6, 4);
        let frame = pool.try_acquire().unwrap();
        assert_eq!(frame.data.len(), 24);
        assert_eq!(frame.data_size, 24);
        assert_eq!(frame.stride, 6);
    }
}
