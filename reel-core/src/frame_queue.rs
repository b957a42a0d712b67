//! # Frame Queue - Decoded Frame Buffer
//!
//! Decoded frames wait here until the render clock reaches them:
//! - Presentation-ordered buffer fed by the decoder output callback
//! - Nearest-frame selection with eviction of everything older
//! - Memory pooling so steady playback does not allocate
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────┐
//! │ Decoder  │───►│ FrameBuffer │───►│  Paint   │
//! │ Thread   │    │ (pts order) │    │ (tick)   │
//! └──────────┘    └─────────────┘    └──────────┘
//!      ▲                 │ close / drop
//!      │           ┌─────┴─────┐
//!      └───────────│ FramePool │
//!                  │ (reuse)   │
//!                  └───────────┘
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Frame Pool - Memory Reuse
// ============================================================================

struct PoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    allocated: AtomicU64,
    recycled: AtomicU64,
    released: AtomicU64,
}

/// Pool of pixel buffers shared by the decoder and every frame it produced
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Keep at most `max_pooled` idle buffers around
    pub fn new(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(max_pooled)),
                max_pooled,
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Empty buffer, reusing a released allocation when possible
    pub fn acquire(&self) -> Vec<u8> {
        let mut pool = self.inner.buffers.lock();
        if let Some(mut buffer) = pool.pop() {
            buffer.clear();
            self.inner.recycled.fetch_add(1, Ordering::Relaxed);
            buffer
        } else {
            drop(pool);
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        }
    }

    /// Return a buffer to the pool
    pub fn release(&self, buffer: Vec<u8>) {
        self.inner.released.fetch_add(1, Ordering::Relaxed);
        let mut pool = self.inner.buffers.lock();
        if pool.len() < self.inner.max_pooled {
            pool.push(buffer);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.inner.buffers.lock().len(),
            total_allocated: self.inner.allocated.load(Ordering::Relaxed),
            total_recycled: self.inner.recycled.load(Ordering::Relaxed),
            total_released: self.inner.released.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub total_allocated: u64,
    pub total_recycled: u64,
    pub total_released: u64,
}

// ============================================================================
// Frame Data
// ============================================================================

/// A decoded I420 frame.
///
/// The pixel buffer goes back to its pool when the frame is closed, or when
/// it is dropped without being closed.
pub struct VideoFrame {
    timestamp_us: i64,
    duration_us: i64,
    width: u32,
    height: u32,
    data: Vec<u8>,
    pool: Option<FramePool>,
}

impl VideoFrame {
    pub fn new(
        timestamp_us: i64,
        duration_us: i64,
        width: u32,
        height: u32,
        data: Vec<u8>,
        pool: Option<FramePool>,
    ) -> Self {
        Self {
            timestamp_us,
            duration_us,
            width,
            height,
            data,
            pool,
        }
    }

    /// Presentation timestamp (microseconds)
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tightly packed Y, U and V planes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Y, U, V plane slices; `None` if the buffer is smaller than the frame
    pub fn planes(&self) -> Option<(&[u8], &[u8], &[u8])> {
        let w = self.width as usize;
        let h = self.height as usize;
        let y_size = w * h;
        let uv_size = w.div_ceil(2) * h.div_ceil(2);
        if self.data.len() < y_size + 2 * uv_size {
            return None;
        }
        let (y, rest) = self.data.split_at(y_size);
        let (u, rest) = rest.split_at(uv_size);
        Some((y, u, &rest[..uv_size]))
    }

    /// Release the frame and its pixel buffer
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp_us", &self.timestamp_us)
            .field("duration_us", &self.duration_us)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ============================================================================
// Frame Buffer
// ============================================================================

/// Decoded frames in ascending presentation order
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: VecDeque<VideoFrame>,
    stale_dropped: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames evicted by [`FrameBuffer::choose_frame`] so far
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    /// Earliest buffered frame
    pub fn front(&self) -> Option<&VideoFrame> {
        self.frames.front()
    }

    /// Take the earliest frame out; [`FrameBuffer::push`] puts it back in order
    pub fn pop_front(&mut self) -> Option<VideoFrame> {
        self.frames.pop_front()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.frames.iter().map(|f| f.timestamp_us).collect()
    }

    /// Insert keeping presentation order
    pub fn push(&mut self, frame: VideoFrame) {
        let pos = self.frames.iter().position(|f| f.timestamp_us > frame.timestamp_us);
        if let Some(idx) = pos {
            self.frames.insert(idx, frame);
        } else {
            self.frames.push_back(frame);
        }
    }

    /// Select the frame nearest to `timestamp_us`.
    ///
    /// Scans from the front and stops at the first frame that is not closer
    /// than its predecessor; ties keep the earlier frame. Every frame before
    /// the chosen one is closed. The chosen frame stays buffered.
    pub fn choose_frame(&mut self, timestamp_us: i64) -> Option<&VideoFrame> {
        let first = self.frames.front()?;
        let mut chosen = 0;
        let mut min_delta = (timestamp_us - first.timestamp_us).abs();

        for (i, frame) in self.frames.iter().enumerate().skip(1) {
            let delta = (timestamp_us - frame.timestamp_us).abs();
            if delta < min_delta {
                min_delta = delta;
                chosen = i;
            } else {
                break;
            }
        }

        for stale in self.frames.drain(..chosen) {
            tracing::trace!("dropping stale frame pts={}us", stale.timestamp_us);
            stale.close();
        }
        self.stale_dropped += chosen as u64;

        self.frames.front()
    }

    /// Close every buffered frame
    pub fn clear(&mut self) -> usize {
        let count = self.frames.len();
        for frame in self.frames.drain(..) {
            frame.close();
        }
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
