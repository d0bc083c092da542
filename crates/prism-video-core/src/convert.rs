//! Pixel format conversion into the render target layout.
//!
//! The converter sits between the decoder and the frame queue. Its target
//! layout is fixed when the track opens: packed BGRA when the GPU path is
//! unavailable, semi-planar NV12 otherwise. Frames that already match pass
//! straight into the pool; everything else is rewritten during the pool
//! copy (chroma interleave / decimation) or through a CPU scratch buffer
//! (YUV to BGRA).

use std::mem;

use crate::error::TrackError;
use crate::frame::{PixelFormat, Plane, SourceImage};
use crate::pool::{PixelBufferPool, PooledBuffer, DEFAULT_POOL_CAPACITY};

/// Scratch rows are padded for vectorized row copies downstream.
const SCRATCH_ROW_ALIGNMENT: usize = 64;

/// The layout every converted frame is produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetLayout {
    /// Packed 32-bit BGRA, for consumers without a YUV sampling path
    Bgra,
    /// Semi-planar NV12, the GPU path's native layout
    BiPlanar,
}

impl TargetLayout {
    /// The pixel format pooled buffers carry for this layout.
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            TargetLayout::Bgra => PixelFormat::Bgra,
            TargetLayout::BiPlanar => PixelFormat::Nv12,
        }
    }
}

/// Per-frame conversion failures.
///
/// `Unconverted` hands the source image back so the caller can skip the
/// frame or pass it through untouched; `Exhausted` is backpressure, not an
/// error, and the caller retries after a frame is released downstream.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("pixel buffer pool exhausted")]
    Exhausted(SourceImage),
    #[error("frame left unconverted: {reason}")]
    Unconverted {
        reason: String,
        image: SourceImage,
    },
    #[error(transparent)]
    Fatal(#[from] TrackError),
}

struct BgraScratch {
    data: Vec<u8>,
    stride: usize,
}

/// Converts decoder-native images into pooled buffers in the target layout.
pub struct PixelFormatConverter {
    target: TargetLayout,
    native_format: PixelFormat,
    width: u32,
    height: u32,
    row_alignment: usize,
    capacity: usize,
    needs_convert: bool,
    pool: PixelBufferPool,
    scratch: Option<BgraScratch>,
}

impl PixelFormatConverter {
    /// Opens a converter for a track.
    ///
    /// Decides up front whether frames need rewriting: a BGRA target
    /// converts anything that is not already BGRA, a bi-planar target
    /// converts anything that is not already NV12. Pool allocation failure
    /// here is fatal to the track.
    pub fn open(
        native_format: PixelFormat,
        width: u32,
        height: u32,
        target: TargetLayout,
        row_alignment: usize,
        capacity: usize,
    ) -> Result<Self, TrackError> {
        let needs_convert = native_format != target.pixel_format();
        let pool =
            PixelBufferPool::create(width, height, target.pixel_format(), row_alignment, capacity)?;
        Ok(Self {
            target,
            native_format,
            width,
            height,
            row_alignment,
            capacity,
            needs_convert,
            pool,
            scratch: None,
        })
    }

    /// Opens a converter with the default pool capacity.
    pub fn open_with_defaults(
        native_format: PixelFormat,
        width: u32,
        height: u32,
        target: TargetLayout,
    ) -> Result<Self, TrackError> {
        Self::open(
            native_format,
            width,
            height,
            target,
            SCRATCH_ROW_ALIGNMENT,
            DEFAULT_POOL_CAPACITY,
        )
    }

    /// True if this track's frames are rewritten rather than passed through.
    pub fn needs_convert(&self) -> bool {
        self.needs_convert
    }

    /// The pool backing converted frames.
    pub fn pool(&self) -> &PixelBufferPool {
        &self.pool
    }

    /// Converts one frame into a pooled buffer.
    ///
    /// A mid-stream dimension change flushes the pool and rebuilds it for
    /// the new geometry; buffers already handed out stay valid and are
    /// discarded on release.
    pub fn convert(&mut self, src: SourceImage) -> Result<PooledBuffer, ConvertError> {
        if (src.width, src.height) != (self.width, self.height) {
            tracing::info!(
                from = format!("{}x{}", self.width, self.height),
                to = format!("{}x{}", src.width, src.height),
                "video geometry changed, rebuilding pool"
            );
            let pool = PixelBufferPool::create(
                src.width,
                src.height,
                self.target.pixel_format(),
                self.row_alignment,
                self.capacity,
            )?;
            self.pool.flush();
            self.pool = pool;
            self.width = src.width;
            self.height = src.height;
            self.scratch = None;
            self.needs_convert = src.format != self.target.pixel_format();
        }
        if src.format != self.native_format {
            self.native_format = src.format;
            self.needs_convert = src.format != self.target.pixel_format();
        }

        match (self.target, src.format) {
            (TargetLayout::Bgra, f) if f != PixelFormat::Bgra => self.convert_to_bgra(src),
            _ => self.acquire(src),
        }
    }

    /// Flushes the pool and drops conversion scratch.
    ///
    /// Safe while a render still holds a converted buffer; the held buffer
    /// stays readable and is discarded when released.
    pub fn shutdown(&mut self) {
        self.pool.flush();
        self.scratch = None;
    }

    fn acquire(&self, src: SourceImage) -> Result<PooledBuffer, ConvertError> {
        match self.pool.acquire(&src) {
            Ok(Some(buffer)) => Ok(buffer),
            Ok(None) => Err(ConvertError::Exhausted(src)),
            Err(e) => Err(ConvertError::Unconverted {
                reason: e.to_string(),
                image: src,
            }),
        }
    }

    fn convert_to_bgra(&mut self, src: SourceImage) -> Result<PooledBuffer, ConvertError> {
        let stride =
            (src.width as usize * 4).next_multiple_of(SCRATCH_ROW_ALIGNMENT);
        let needed = stride * src.height as usize;
        let scratch = self.scratch.get_or_insert_with(|| BgraScratch {
            data: vec![0u8; needed],
            stride,
        });
        if scratch.data.len() < needed {
            scratch.data.resize(needed, 0);
            scratch.stride = stride;
        }

        if let Err(reason) = write_bgra(&src, &mut scratch.data, scratch.stride) {
            return Err(ConvertError::Unconverted { reason, image: src });
        }

        // Hand the scratch storage to a transient source image for the pool
        // copy, then take it back. No per-frame reallocation.
        let data = mem::take(&mut scratch.data);
        let bgra_src = SourceImage {
            format: PixelFormat::Bgra,
            width: src.width,
            height: src.height,
            colorimetry: src.colorimetry,
            pixel_aspect_ratio: src.pixel_aspect_ratio,
            planes: vec![Plane {
                data,
                stride: scratch.stride,
            }],
        };
        let result = self.pool.acquire(&bgra_src);
        let reclaimed = bgra_src
            .planes
            .into_iter()
            .next()
            .map(|p| p.data)
            .unwrap_or_default();
        if let Some(scratch) = self.scratch.as_mut() {
            scratch.data = reclaimed;
        }

        match result {
            Ok(Some(buffer)) => Ok(buffer),
            Ok(None) => Err(ConvertError::Exhausted(src)),
            Err(e) => Err(ConvertError::Unconverted {
                reason: e.to_string(),
                image: src,
            }),
        }
    }
}

/// CPU YUV to BGRA conversion, BT.709 full-range in 8.8 fixed point.
fn write_bgra(src: &SourceImage, out: &mut [u8], out_stride: usize) -> Result<(), String> {
    let y_plane = src.plane(0).ok_or("missing Y plane")?;
    let sample_chroma = |x: usize, y: usize| -> Result<(i32, i32), String> {
        match src.format {
            PixelFormat::Yuv420p => {
                let u = src.plane(1).ok_or("missing U plane")?;
                let v = src.plane(2).ok_or("missing V plane")?;
                let off = (y / 2) * u.stride + x / 2;
                Ok((u.data[off] as i32, v.data[(y / 2) * v.stride + x / 2] as i32))
            }
            PixelFormat::Yuv444p => {
                let u = src.plane(1).ok_or("missing U plane")?;
                let v = src.plane(2).ok_or("missing V plane")?;
                Ok((u.data[y * u.stride + x] as i32, v.data[y * v.stride + x] as i32))
            }
            PixelFormat::Nv12 => {
                let uv = src.plane(1).ok_or("missing UV plane")?;
                let off = (y / 2) * uv.stride + (x / 2) * 2;
                Ok((uv.data[off] as i32, uv.data[off + 1] as i32))
            }
            PixelFormat::Bgra => Err("source is already packed".to_string()),
        }
    };

    for y in 0..src.height as usize {
        for x in 0..src.width as usize {
            let luma = y_plane.data[y * y_plane.stride + x] as i32;
            let (cb, cr) = sample_chroma(x, y)?;
            let (cb, cr) = (cb - 128, cr - 128);
            let r = luma + ((402 * cr) >> 8);
            let g = luma - ((48 * cb + 120 * cr) >> 8);
            let b = luma + ((475 * cb) >> 8);
            let off = y * out_stride + x * 4;
            out[off] = b.clamp(0, 255) as u8;
            out[off + 1] = g.clamp(0, 255) as u8;
            out[off + 2] = r.clamp(0, 255) as u8;
            out[off + 3] = 255;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Colorimetry;

    fn yuv420_source(width: u32, height: u32, y: u8, u: u8, v: u8) -> SourceImage {
        let cw = width.div_ceil(2) as usize;
        let ch = height.div_ceil(2) as usize;
        SourceImage {
            format: PixelFormat::Yuv420p,
            width,
            height,
            colorimetry: Some(Colorimetry::default()),
            pixel_aspect_ratio: None,
            planes: vec![
                Plane { data: vec![y; width as usize * height as usize], stride: width as usize },
                Plane { data: vec![u; cw * ch], stride: cw },
                Plane { data: vec![v; cw * ch], stride: cw },
            ],
        }
    }

    #[test]
    fn test_passthrough_when_native_matches() {
        let conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Nv12, 8, 8, TargetLayout::BiPlanar)
                .unwrap();
        assert!(!conv.needs_convert());
        let conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Yuv420p, 8, 8, TargetLayout::BiPlanar)
                .unwrap();
        assert!(conv.needs_convert());
    }

    #[test]
    fn test_planar_to_biplanar() {
        let mut conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Yuv420p, 8, 8, TargetLayout::BiPlanar)
                .unwrap();
        let buf = conv.convert(yuv420_source(8, 8, 60, 90, 180)).unwrap();
        assert_eq!(buf.format, PixelFormat::Nv12);
        assert_eq!(buf.planes[1].data[0], 90);
        assert_eq!(buf.planes[1].data[1], 180);
    }

    #[test]
    fn test_yuv_to_bgra_neutral_chroma_is_gray() {
        let mut conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Yuv420p, 4, 4, TargetLayout::Bgra)
                .unwrap();
        let buf = conv.convert(yuv420_source(4, 4, 128, 128, 128)).unwrap();
        assert_eq!(buf.format, PixelFormat::Bgra);
        let px = &buf.planes[0].data[0..4];
        assert_eq!(px, &[128, 128, 128, 255]);
    }

    #[test]
    fn test_dimension_change_rebuilds_pool() {
        let mut conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Yuv420p, 4, 4, TargetLayout::BiPlanar)
                .unwrap();
        let held = conv.convert(yuv420_source(4, 4, 10, 20, 30)).unwrap();

        let grown = conv.convert(yuv420_source(8, 8, 40, 50, 60)).unwrap();
        assert_eq!(grown.dimensions(), (8, 8));
        assert_eq!(conv.pool().dimensions(), (8, 8));
        // The buffer handed out before the change stays readable
        assert_eq!(held.planes[0].data[0], 10);
    }

    #[test]
    fn test_exhaustion_returns_backpressure() {
        let mut conv = PixelFormatConverter::open(
            PixelFormat::Yuv420p,
            4,
            4,
            TargetLayout::BiPlanar,
            64,
            1,
        )
        .unwrap();
        let _held = conv.convert(yuv420_source(4, 4, 1, 2, 3)).unwrap();
        match conv.convert(yuv420_source(4, 4, 1, 2, 3)) {
            Err(ConvertError::Exhausted(img)) => assert_eq!(img.width, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn test_unconvertible_frame_is_handed_back() {
        let mut conv =
            PixelFormatConverter::open_with_defaults(PixelFormat::Bgra, 4, 4, TargetLayout::BiPlanar)
                .unwrap();
        let src = SourceImage {
            format: PixelFormat::Bgra,
            width: 4,
            height: 4,
            colorimetry: None,
            pixel_aspect_ratio: None,
            planes: vec![Plane { data: vec![0; 64], stride: 16 }],
        };
        match conv.convert(src) {
            Err(ConvertError::Unconverted { image, .. }) => {
                assert_eq!(image.format, PixelFormat::Bgra);
            }
            other => panic!("expected unconverted, got {other:?}"),
        }
    }
}
