//! Recycling pixel buffer pool.
//!
//! The pool owns a fixed-geometry set of [`PixelBuffer`]s in the render
//! target layout. A producer checks a buffer out with [`PixelBufferPool::acquire`],
//! which copies the source planes in while the checkout is exclusively owned,
//! and the buffer returns to the pool when the [`PooledBuffer`] drops.
//!
//! [`PixelBufferPool::flush`] drops idle buffers only. In-flight checkouts
//! stay valid; they carry the generation they were checked out under, and a
//! stale generation is discarded on return instead of being re-pooled.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TrackError;
use crate::frame::{PixelBuffer, PixelFormat, Plane, SourceImage};

/// Default number of buffers a pool will allocate.
pub const DEFAULT_POOL_CAPACITY: usize = 24;

/// A pool of recycled pixel buffers with fixed geometry and format.
#[derive(Clone)]
pub struct PixelBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    width: u32,
    height: u32,
    format: PixelFormat,
    row_alignment: usize,
    capacity: usize,
    /// Idle buffers ready for checkout
    shelf: Mutex<Vec<PixelBuffer>>,
    /// Bumped on flush; checkouts from older generations are discarded on return
    generation: AtomicU64,
    /// Buffers currently checked out
    live: AtomicUsize,
    /// Buffers allocated in the current generation (shelf + live)
    total: AtomicUsize,
}

/// An exclusive checkout of a pool buffer.
///
/// Dereferences to the underlying [`PixelBuffer`]. Returns the buffer to
/// the pool on drop unless the pool was flushed in the meantime.
pub struct PooledBuffer {
    buffer: Option<PixelBuffer>,
    pool: Arc<PoolInner>,
    generation: u64,
}

impl PixelBufferPool {
    /// Creates a pool for `capacity` buffers of the given geometry.
    ///
    /// `row_alignment` pads every plane stride up to the given byte
    /// boundary (power of two) so buffers can be uploaded without a
    /// repack. Fails on zero geometry or a non-power-of-two alignment.
    pub fn create(
        width: u32,
        height: u32,
        format: PixelFormat,
        row_alignment: usize,
        capacity: usize,
    ) -> Result<Self, TrackError> {
        if width == 0 || height == 0 {
            return Err(TrackError::InvalidDimensions { width, height });
        }
        if row_alignment == 0 || !row_alignment.is_power_of_two() {
            return Err(TrackError::AllocationFailed(format!(
                "row alignment {row_alignment} is not a power of two"
            )));
        }
        if capacity == 0 {
            return Err(TrackError::AllocationFailed(
                "pool capacity must be nonzero".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                width,
                height,
                format,
                row_alignment,
                capacity,
                shelf: Mutex::new(Vec::with_capacity(capacity)),
                generation: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
            }),
        })
    }

    /// Checks out a buffer and fills it from `src`.
    ///
    /// Recycles an idle buffer when one is available, allocates up to the
    /// pool capacity otherwise, and returns `Ok(None)` when every buffer is
    /// checked out. `Ok(None)` is the pipeline's backpressure signal: the
    /// producer retries after the consumer releases a frame.
    ///
    /// Returns an error when `src` cannot be laid out in this pool's
    /// format (the converter is expected to route such frames elsewhere).
    pub fn acquire(&self, src: &SourceImage) -> Result<Option<PooledBuffer>, TrackError> {
        let inner = &self.inner;
        let mut buffer = {
            let mut shelf = inner.shelf.lock();
            shelf.pop()
        };
        if buffer.is_none() {
            if inner.total.load(Ordering::Acquire) >= inner.capacity {
                return Ok(None);
            }
            buffer = Some(inner.allocate());
            inner.total.fetch_add(1, Ordering::AcqRel);
        }
        let mut buffer = match buffer {
            Some(b) => b,
            None => return Ok(None),
        };

        if let Err(e) = inner.fill(&mut buffer, src) {
            // Put the untouched buffer back so the failed frame costs nothing
            inner.shelf.lock().push(buffer);
            return Err(e);
        }

        inner.live.fetch_add(1, Ordering::AcqRel);
        Ok(Some(PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(inner),
            generation: inner.generation.load(Ordering::Acquire),
        }))
    }

    /// Drops all idle buffers and invalidates outstanding checkouts'
    /// right to return.
    ///
    /// In-flight buffers remain readable by their holders; they are
    /// discarded, not re-pooled, when released.
    pub fn flush(&self) {
        let inner = &self.inner;
        let dropped = {
            let mut shelf = inner.shelf.lock();
            let count = shelf.len();
            shelf.clear();
            count
        };
        inner.total.fetch_sub(dropped, Ordering::AcqRel);
        inner.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(dropped, in_flight = self.live_count(), "pixel pool flushed");
    }

    /// Number of buffers currently checked out.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Number of idle buffers on the shelf.
    pub fn idle_count(&self) -> usize {
        self.inner.shelf.lock().len()
    }

    /// Pool geometry.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    /// Layout of the buffers this pool hands out.
    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }
}

impl PoolInner {
    fn allocate(&self) -> PixelBuffer {
        let mut planes = Vec::with_capacity(self.format.num_planes());
        for plane in 0..self.format.num_planes() {
            let (_, rows) = self.format.plane_dimensions(plane, self.width, self.height);
            let row_bytes = self.format.plane_row_bytes(plane, self.width);
            let stride = row_bytes.next_multiple_of(self.row_alignment);
            planes.push(Plane {
                data: vec![0u8; stride * rows as usize],
                stride,
            });
        }
        PixelBuffer {
            width: self.width,
            height: self.height,
            format: self.format,
            colorimetry: None,
            pixel_aspect_ratio: None,
            planes,
        }
    }

    fn fill(&self, buffer: &mut PixelBuffer, src: &SourceImage) -> Result<(), TrackError> {
        buffer.colorimetry = src.colorimetry;
        buffer.pixel_aspect_ratio = src.pixel_aspect_ratio;

        match (self.format, src.format) {
            (dst, s) if dst == s => {
                for plane in 0..self.format.num_planes() {
                    self.copy_plane(buffer, src, plane)?;
                }
                Ok(())
            }
            (PixelFormat::Nv12, PixelFormat::Yuv420p) => {
                self.copy_plane(buffer, src, 0)?;
                self.interleave_chroma(buffer, src)
            }
            (PixelFormat::Nv12, PixelFormat::Yuv444p) => {
                self.copy_plane(buffer, src, 0)?;
                self.decimate_chroma(buffer, src)
            }
            (dst, s) => Err(TrackError::UnsupportedFormat(format!(
                "cannot fill {dst:?} pool from {s:?} source"
            ))),
        }
    }

    fn copy_plane(
        &self,
        buffer: &mut PixelBuffer,
        src: &SourceImage,
        plane: usize,
    ) -> Result<(), TrackError> {
        let src_plane = src
            .plane(plane)
            .ok_or_else(|| TrackError::UnsupportedFormat(format!("missing plane {plane}")))?;
        let (_, rows) = self
            .format
            .plane_dimensions(plane, self.width.min(src.width), self.height.min(src.height));
        let row_bytes = self
            .format
            .plane_row_bytes(plane, self.width.min(src.width));
        let dst_plane = &mut buffer.planes[plane];
        for row in 0..rows as usize {
            let src_off = row * src_plane.stride;
            let dst_off = row * dst_plane.stride;
            let src_row = src_plane
                .data
                .get(src_off..src_off + row_bytes)
                .ok_or_else(|| {
                    TrackError::UnsupportedFormat(format!("plane {plane} shorter than geometry"))
                })?;
            dst_plane.data[dst_off..dst_off + row_bytes].copy_from_slice(src_row);
        }
        Ok(())
    }

    /// Interleaves separate quarter-resolution U and V planes into the
    /// NV12 chroma plane: base[2i] = U[i], base[2i + 1] = V[i].
    fn interleave_chroma(
        &self,
        buffer: &mut PixelBuffer,
        src: &SourceImage,
    ) -> Result<(), TrackError> {
        let u = src
            .plane(1)
            .ok_or_else(|| TrackError::UnsupportedFormat("missing U plane".to_string()))?;
        let v = src
            .plane(2)
            .ok_or_else(|| TrackError::UnsupportedFormat("missing V plane".to_string()))?;
        let (chroma_w, chroma_h) = self.format.plane_dimensions(1, self.width, self.height);
        let dst = &mut buffer.planes[1];
        for row in 0..chroma_h as usize {
            let u_off = row * u.stride;
            let v_off = row * v.stride;
            let dst_off = row * dst.stride;
            for i in 0..chroma_w as usize {
                dst.data[dst_off + 2 * i] = u.data[u_off + i];
                dst.data[dst_off + 2 * i + 1] = v.data[v_off + i];
            }
        }
        Ok(())
    }

    /// Averages full-resolution 4:4:4 chroma over 2x2 blocks and
    /// interleaves the result into the NV12 chroma plane.
    fn decimate_chroma(
        &self,
        buffer: &mut PixelBuffer,
        src: &SourceImage,
    ) -> Result<(), TrackError> {
        let u = src
            .plane(1)
            .ok_or_else(|| TrackError::UnsupportedFormat("missing U plane".to_string()))?;
        let v = src
            .plane(2)
            .ok_or_else(|| TrackError::UnsupportedFormat("missing V plane".to_string()))?;
        let (chroma_w, chroma_h) = self.format.plane_dimensions(1, self.width, self.height);
        let last_col = (self.width as usize).saturating_sub(1);
        let last_row = (self.height as usize).saturating_sub(1);
        let avg = |p: &Plane, x: usize, y: usize| -> u8 {
            let x1 = (2 * x + 1).min(last_col);
            let y1 = (2 * y + 1).min(last_row);
            let s = p.data[2 * y * p.stride + 2 * x] as u32
                + p.data[2 * y * p.stride + x1] as u32
                + p.data[y1 * p.stride + 2 * x] as u32
                + p.data[y1 * p.stride + x1] as u32;
            ((s + 2) / 4) as u8
        };
        let dst = &mut buffer.planes[1];
        for y in 0..chroma_h as usize {
            let dst_off = y * dst.stride;
            for x in 0..chroma_w as usize {
                dst.data[dst_off + 2 * x] = avg(u, x, y);
                dst.data[dst_off + 2 * x + 1] = avg(v, x, y);
            }
        }
        Ok(())
    }
}

impl Deref for PooledBuffer {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        // Invariant: `buffer` is Some until drop
        self.buffer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
        if self.pool.generation.load(Ordering::Acquire) == self.generation {
            self.pool.shelf.lock().push(buffer);
        } else {
            // Pool was flushed while this buffer was in flight
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!("discarding stale pooled buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Colorimetry;

    fn gray_source(width: u32, height: u32, luma: u8) -> SourceImage {
        let chroma_w = width.div_ceil(2) as usize;
        let chroma_h = height.div_ceil(2) as usize;
        SourceImage {
            format: PixelFormat::Yuv420p,
            width,
            height,
            colorimetry: Some(Colorimetry::default()),
            pixel_aspect_ratio: None,
            planes: vec![
                Plane {
                    data: vec![luma; width as usize * height as usize],
                    stride: width as usize,
                },
                Plane {
                    data: vec![100; chroma_w * chroma_h],
                    stride: chroma_w,
                },
                Plane {
                    data: vec![200; chroma_w * chroma_h],
                    stride: chroma_w,
                },
            ],
        }
    }

    #[test]
    fn test_acquire_interleaves_chroma() {
        let pool = PixelBufferPool::create(4, 4, PixelFormat::Nv12, 1, 4).unwrap();
        let buf = pool.acquire(&gray_source(4, 4, 50)).unwrap().unwrap();
        assert_eq!(buf.planes[0].data[0], 50);
        // base[2i] = U, base[2i + 1] = V
        assert_eq!(buf.planes[1].data[0], 100);
        assert_eq!(buf.planes[1].data[1], 200);
        assert_eq!(buf.planes[1].data[2], 100);
        assert_eq!(buf.colorimetry, Some(Colorimetry::default()));
    }

    #[test]
    fn test_exhaustion_and_recycle() {
        let pool = PixelBufferPool::create(4, 4, PixelFormat::Nv12, 1, 2).unwrap();
        let src = gray_source(4, 4, 10);
        let a = pool.acquire(&src).unwrap().unwrap();
        let _b = pool.acquire(&src).unwrap().unwrap();
        assert!(pool.acquire(&src).unwrap().is_none());
        assert_eq!(pool.live_count(), 2);
        drop(a);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.acquire(&src).unwrap().is_some());
    }

    #[test]
    fn test_flush_discards_in_flight_on_return() {
        let pool = PixelBufferPool::create(4, 4, PixelFormat::Nv12, 1, 2).unwrap();
        let src = gray_source(4, 4, 10);
        let held = pool.acquire(&src).unwrap().unwrap();
        let idle = pool.acquire(&src).unwrap().unwrap();
        drop(idle);
        assert_eq!(pool.idle_count(), 1);

        pool.flush();
        assert_eq!(pool.idle_count(), 0);
        // Held buffer stays readable after the flush
        assert_eq!(held.planes[0].data[0], 10);
        drop(held);
        // Stale generation: discarded, not re-pooled
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.live_count(), 0);
        // Capacity is available again for the new generation
        let a = pool.acquire(&src).unwrap();
        let b = pool.acquire(&src).unwrap();
        assert!(a.is_some() && b.is_some());
    }

    #[test]
    fn test_stride_alignment() {
        let pool = PixelBufferPool::create(6, 4, PixelFormat::Nv12, 64, 1).unwrap();
        let src = gray_source(6, 4, 10);
        let buf = pool.acquire(&src).unwrap().unwrap();
        assert_eq!(buf.planes[0].stride, 64);
        assert_eq!(buf.planes[1].stride, 64);
    }

    #[test]
    fn test_rejects_zero_geometry() {
        assert!(PixelBufferPool::create(0, 4, PixelFormat::Nv12, 1, 4).is_err());
    }

    #[test]
    fn test_444_chroma_average() {
        let w = 4u32;
        let h = 2u32;
        let mut u = vec![0u8; (w * h) as usize];
        // One 2x2 block of 10/20/30/40 averages to 25
        u[0] = 10;
        u[1] = 20;
        u[4] = 30;
        u[5] = 40;
        let src = SourceImage {
            format: PixelFormat::Yuv444p,
            width: w,
            height: h,
            colorimetry: None,
            pixel_aspect_ratio: None,
            planes: vec![
                Plane { data: vec![0; (w * h) as usize], stride: w as usize },
                Plane { data: u, stride: w as usize },
                Plane { data: vec![80; (w * h) as usize], stride: w as usize },
            ],
        };
        let pool = PixelBufferPool::create(w, h, PixelFormat::Nv12, 1, 1).unwrap();
        let buf = pool.acquire(&src).unwrap().unwrap();
        assert_eq!(buf.planes[1].data[0], 25);
        assert_eq!(buf.planes[1].data[1], 80);
    }
}
