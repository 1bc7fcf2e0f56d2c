// CPU frame representation with explicit row pitch.
//
// Consumers must never read past `width * bytes_per_pixel` columns of
// a row: the trailing pitch bytes are undefined. `Frame::row` is the
// only sanctioned access path and enforces that bound by construction.
// Frame storage is recycled through a free-list pool so steady-state
// capture performs no allocation.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Pixel layout of frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, premultiplied alpha. The capture native format.
    Bgra8,
    /// 3 bytes per pixel (templates decoded from disk).
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
            PixelFormat::Bgr8 => 3,
        }
    }
}

/// One captured frame. Immutable once published.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of `data`. Always `% 4 == 0` and
    /// `>= width * bytes_per_pixel`; may exceed it for alignment.
    pub row_pitch: usize,
    pub format: PixelFormat,
    /// Content size reported by the capture surface. Equals
    /// (width, height) except during the transient tick that triggers
    /// a pool rebuild.
    pub content_size: (u32, u32),
    /// Monotonic capture time, used for staleness checks.
    pub captured_at: Instant,
    data: FrameBytes,
}

impl Frame {
    /// Wrap tightly packed pixel data (`data.len() == width * bpp * height`).
    ///
    /// Row pitch is kept 4-byte aligned; BGR8 rows whose tight stride
    /// is unaligned are repacked with padding.
    pub fn from_tight(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        let row_bytes = width as usize * format.bytes_per_pixel();
        debug_assert_eq!(data.len(), row_bytes * height as usize);
        let row_pitch = row_bytes.next_multiple_of(4);

        let data = if row_pitch == row_bytes {
            data
        } else {
            let mut padded = vec![0u8; row_pitch * height as usize];
            for y in 0..height as usize {
                padded[y * row_pitch..y * row_pitch + row_bytes]
                    .copy_from_slice(&data[y * row_bytes..(y + 1) * row_bytes]);
            }
            padded
        };

        Self {
            width,
            height,
            row_pitch,
            format,
            content_size: (width, height),
            captured_at: Instant::now(),
            data: FrameBytes::unpooled(data),
        }
    }

    /// Copy a strided source (pitch ≥ `width * bpp`) into a tight
    /// frame, reading exactly `width * bpp` bytes per row. Reading the
    /// full stride would smear alignment garbage into the image.
    pub fn from_strided(
        width: u32,
        height: u32,
        format: PixelFormat,
        src: &[u8],
        src_pitch: usize,
    ) -> Self {
        let row_bytes = width as usize * format.bytes_per_pixel();
        assert!(src_pitch >= row_bytes, "pitch smaller than row");
        assert!(src.len() >= src_pitch * height as usize);

        let mut data = vec![0u8; row_bytes * height as usize];
        copy_strided_rows(src, src_pitch, &mut data, row_bytes, height as usize);
        Self::from_tight(width, height, format, data)
    }

    pub(crate) fn from_pooled(
        width: u32,
        height: u32,
        content_size: (u32, u32),
        data: FrameBytes,
    ) -> Self {
        let row_pitch = width as usize * PixelFormat::Bgra8.bytes_per_pixel();
        Self {
            width,
            height,
            row_pitch,
            format: PixelFormat::Bgra8,
            content_size,
            captured_at: Instant::now(),
            data,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// The meaningful bytes of row `y`: exactly `width * bpp` long.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_pitch;
        &self.data[start..start + self.width as usize * self.bytes_per_pixel()]
    }

    /// Raw storage including pitch padding. Test and encoder use only.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }
}

/// Row-wise strided copy: `row_bytes` per row from a `src_pitch` stride.
pub fn copy_strided_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    row_bytes: usize,
    rows: usize,
) {
    for y in 0..rows {
        let s = y * src_pitch;
        let d = y * row_bytes;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

// ---------------------------------------------------------------------------
// Recycling storage
// ---------------------------------------------------------------------------

/// Frame byte storage that returns itself to its pool on drop.
pub struct FrameBytes {
    bytes: Vec<u8>,
    pool: Option<Arc<FramePool>>,
}

impl FrameBytes {
    fn unpooled(bytes: Vec<u8>) -> Self {
        Self { bytes, pool: None }
    }
}

impl Deref for FrameBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for FrameBytes {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.bytes));
        }
    }
}

/// Free count kept after a burst drains; beyond this, buffers are
/// returned to the allocator.
const POOL_HIGH_WATERMARK: usize = 8;

/// Free-list pool of equally sized frame buffers. A resize retargets
/// `frame_bytes`; stale-sized buffers are dropped on release instead
/// of being recycled.
pub struct FramePool {
    state: Mutex<PoolState>,
}

struct PoolState {
    frame_bytes: usize,
    free: Vec<Vec<u8>>,
}

impl FramePool {
    pub fn new(frame_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                frame_bytes,
                free: Vec::new(),
            }),
        })
    }

    /// Change the buffer size (content-size rebuild). Outstanding
    /// buffers of the old size are dropped when released.
    pub fn retarget(&self, frame_bytes: usize) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.frame_bytes != frame_bytes {
            state.frame_bytes = frame_bytes;
            state.free.clear();
        }
    }

    /// Take a zero-filled buffer of the current frame size.
    pub fn acquire(self: &Arc<Self>) -> FrameBytes {
        self.wrap(self.acquire_vec())
    }

    /// Take the raw buffer (for readback APIs that need `&mut Vec<u8>`);
    /// hand it back through `wrap` so it recycles.
    pub fn acquire_vec(&self) -> Vec<u8> {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let frame_bytes = state.frame_bytes;
        state.free.pop().unwrap_or_else(|| vec![0u8; frame_bytes])
    }

    /// Attach pool-recycling to a buffer obtained from `acquire_vec`.
    pub fn wrap(self: &Arc<Self>, bytes: Vec<u8>) -> FrameBytes {
        FrameBytes {
            bytes,
            pool: Some(Arc::clone(self)),
        }
    }

    fn release(&self, mut bytes: Vec<u8>) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        // Buffers from before a retarget shrink-to-fit on the next
        // acquire anyway; only recycle ones with matching capacity.
        if bytes.capacity() >= state.frame_bytes && state.free.len() < POOL_HIGH_WATERMARK {
            bytes.clear();
            bytes.resize(state.frame_bytes, 0);
            state.free.push(bytes);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_copy_strips_padding() {
        // 3x2 BGRA image with 24 bytes of garbage pitch per row.
        let width = 3u32;
        let row_bytes = width as usize * 4;
        let pitch = row_bytes + 24;
        let mut src = vec![0xEEu8; pitch * 2];
        for y in 0..2usize {
            for x in 0..row_bytes {
                src[y * pitch + x] = (y * 100 + x) as u8;
            }
        }

        let frame = Frame::from_strided(width, 2, PixelFormat::Bgra8, &src, pitch);
        assert_eq!(frame.row_pitch, row_bytes);
        assert_eq!(frame.row(0)[0], 0);
        assert_eq!(frame.row(0)[11], 11);
        assert_eq!(frame.row(1)[0], 100);
        assert_eq!(frame.row(1)[11], 111);
        // No 0xEE padding byte survives into the tight copy.
        assert!(frame.raw_data().iter().all(|&b| b != 0xEE));
    }

    #[test]
    fn test_strided_equals_tight() {
        // Same pixels through the strided path and the tight path must
        // be byte-identical (the pitch-shear property).
        let width = 5u32;
        let height = 4u32;
        let row_bytes = width as usize * 4;
        let tight: Vec<u8> = (0..row_bytes * height as usize)
            .map(|i| (i % 251) as u8)
            .collect();

        let pitch = 64; // aligned stride > row_bytes
        let mut strided = vec![0xA5u8; pitch * height as usize];
        copy_strided_rows_inverse(&tight, row_bytes, &mut strided, pitch, height as usize);

        let a = Frame::from_tight(width, height, PixelFormat::Bgra8, tight.clone());
        let b = Frame::from_strided(width, height, PixelFormat::Bgra8, &strided, pitch);
        for y in 0..height {
            assert_eq!(a.row(y), b.row(y), "row {y}");
        }
    }

    fn copy_strided_rows_inverse(
        src: &[u8],
        row_bytes: usize,
        dst: &mut [u8],
        dst_pitch: usize,
        rows: usize,
    ) {
        for y in 0..rows {
            dst[y * dst_pitch..y * dst_pitch + row_bytes]
                .copy_from_slice(&src[y * row_bytes..(y + 1) * row_bytes]);
        }
    }

    #[test]
    fn test_pool_recycles_matching_size() {
        let pool = FramePool::new(64);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
        drop(buf);
        assert_eq!(pool.free_count(), 1);

        // Retarget invalidates the free list and recycling of
        // old-size buffers.
        let old = pool.acquire();
        pool.retarget(128);
        drop(old);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.acquire().len(), 128);
    }

    #[test]
    fn test_pool_watermark_bounds_free_list() {
        let pool = FramePool::new(16);
        let bufs: Vec<_> = (0..POOL_HIGH_WATERMARK + 4).map(|_| pool.acquire()).collect();
        drop(bufs);
        assert_eq!(pool.free_count(), POOL_HIGH_WATERMARK);
    }

    #[test]
    fn test_row_pitch_invariants() {
        let f = Frame::from_tight(7, 3, PixelFormat::Bgra8, vec![0; 7 * 3 * 4]);
        assert_eq!(f.row_pitch % 4, 0);
        assert!(f.row_pitch >= f.width as usize * f.bytes_per_pixel());
        assert_eq!(f.row(2).len(), 28);
        assert_eq!(f.content_size, (7, 3));
    }

    #[test]
    fn test_bgr_rows_padded_to_alignment() {
        // 5 * 3 = 15 tight bytes per row; pitch must round up to 16.
        let data: Vec<u8> = (0..5 * 3 * 2).map(|i| i as u8).collect();
        let f = Frame::from_tight(5, 2, PixelFormat::Bgr8, data);
        assert_eq!(f.row_pitch, 16);
        assert_eq!(f.row(0), (0..15).collect::<Vec<u8>>().as_slice());
        assert_eq!(f.row(1), (15..30).collect::<Vec<u8>>().as_slice());
    }
}
