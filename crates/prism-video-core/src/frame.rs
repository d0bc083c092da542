//! Core frame types shared across the pipeline.
//!
//! This module provides the foundational types for decoded media: pixel
//! formats with per-plane geometry, colorimetry tags, decoder-native source
//! images, and the timestamped video/audio frames the queues carry.

use std::time::Duration;

/// Pixel format of a decoded image or a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common software decoder output)
    Yuv420p,
    /// YUV 4:4:4 planar (full-resolution chroma)
    Yuv444p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// BGRA 32-bit packed
    Bgra,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Yuv444p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Bgra => 1,
        }
    }

    /// Returns true if this is a YUV-based format requiring color conversion.
    pub fn is_yuv(&self) -> bool {
        !matches!(self, PixelFormat::Bgra)
    }

    /// Returns the dimensions of a plane in texels.
    ///
    /// Chroma planes of subsampled formats round up, so odd image sizes
    /// keep their last chroma sample.
    pub fn plane_dimensions(&self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        match (self, plane) {
            (PixelFormat::Yuv420p, 1 | 2) | (PixelFormat::Nv12, 1) => {
                (width.div_ceil(2), height.div_ceil(2))
            }
            _ => (width, height),
        }
    }

    /// Returns the bytes per texel of a plane.
    ///
    /// The NV12 chroma plane stores an interleaved Cb/Cr pair per texel.
    pub fn plane_bytes_per_texel(&self, plane: usize) -> usize {
        match (self, plane) {
            (PixelFormat::Bgra, _) => 4,
            (PixelFormat::Nv12, 1) => 2,
            _ => 1,
        }
    }

    /// Returns the unpadded row width of a plane in bytes.
    pub fn plane_row_bytes(&self, plane: usize, width: u32) -> usize {
        let (plane_width, _) = self.plane_dimensions(plane, width, 1);
        plane_width as usize * self.plane_bytes_per_texel(plane)
    }
}

/// YCbCr matrix standard carried by a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixStandard {
    Bt601,
    Bt709,
}

/// Quantization range of the YCbCr samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    /// Limited range (luma 16..235)
    Video,
    /// Full range (luma 0..255)
    Full,
}

/// Colorimetry tag of a decoded image: matrix standard plus sample range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorimetry {
    pub standard: MatrixStandard,
    pub range: ColorRange,
}

impl Default for Colorimetry {
    /// Untagged content decodes as BT.709 full-range.
    fn default() -> Self {
        Self {
            standard: MatrixStandard::Bt709,
            range: ColorRange::Full,
        }
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// A decoder-native image, as produced upstream before pooling.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Colorimetry tag if the stream carries one
    pub colorimetry: Option<Colorimetry>,
    /// Pixel aspect ratio as numerator/denominator, if anamorphic
    pub pixel_aspect_ratio: Option<(u32, u32)>,
    /// Pixel data planes; length matches `format.num_planes()`
    pub planes: Vec<Plane>,
}

impl SourceImage {
    /// Returns a plane by index.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }
}

/// A pool-owned image buffer in the render-ready layout.
///
/// The pool recycles the backing storage; frames hold it through a
/// checked-out [`crate::pool::PooledBuffer`].
#[derive(Debug)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Colorimetry copied from the source image at fill time
    pub colorimetry: Option<Colorimetry>,
    /// Pixel aspect ratio copied from the source image at fill time
    pub pixel_aspect_ratio: Option<(u32, u32)>,
    pub planes: Vec<Plane>,
}

impl PixelBuffer {
    /// Returns a plane by index.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    /// Total bytes across all planes, padding included.
    pub fn byte_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A decoded video frame ready for pacing and rendering.
///
/// Immutable after construction; only the pool mutates buffer contents,
/// and only while it holds the sole reference.
#[derive(Debug)]
pub struct VideoFrame {
    /// Presentation timestamp (when this frame should be displayed)
    pub pts: Duration,
    /// Display duration of this frame
    pub duration: Duration,
    /// Total payload size in bytes
    pub byte_size: usize,
    /// The pooled pixel data
    pub buffer: crate::pool::PooledBuffer,
}

impl VideoFrame {
    pub fn new(pts: Duration, duration: Duration, buffer: crate::pool::PooledBuffer) -> Self {
        let byte_size = buffer.byte_size();
        Self {
            pts,
            duration,
            byte_size,
            buffer,
        }
    }

    /// Returns the frame dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.buffer.width, self.buffer.height)
    }
}

/// A decoded audio frame: interleaved f32 PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: Duration,
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: usize,
    /// Interleaved samples; length is a multiple of `channels`
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Total payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_planes() {
        assert_eq!(PixelFormat::Yuv420p.num_planes(), 3);
        assert_eq!(PixelFormat::Yuv444p.num_planes(), 3);
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
        assert_eq!(PixelFormat::Bgra.num_planes(), 1);
        assert!(PixelFormat::Nv12.is_yuv());
        assert!(!PixelFormat::Bgra.is_yuv());
    }

    #[test]
    fn test_chroma_dimensions_round_up() {
        // Odd dimensions keep their last chroma sample
        assert_eq!(PixelFormat::Yuv420p.plane_dimensions(1, 1919, 1079), (960, 540));
        assert_eq!(PixelFormat::Nv12.plane_dimensions(1, 1920, 1080), (960, 540));
        // 4:4:4 chroma is full resolution
        assert_eq!(PixelFormat::Yuv444p.plane_dimensions(2, 1919, 1079), (1919, 1079));
    }

    #[test]
    fn test_plane_row_bytes() {
        // NV12 chroma rows carry two bytes per texel
        assert_eq!(PixelFormat::Nv12.plane_row_bytes(1, 1920), 1920);
        assert_eq!(PixelFormat::Bgra.plane_row_bytes(0, 1920), 7680);
        assert_eq!(PixelFormat::Yuv420p.plane_row_bytes(1, 1920), 960);
    }

    #[test]
    fn test_default_colorimetry() {
        let c = Colorimetry::default();
        assert_eq!(c.standard, MatrixStandard::Bt709);
        assert_eq!(c.range, ColorRange::Full);
    }

    #[test]
    fn test_audio_frame_counts() {
        let frame = AudioFrame {
            pts: Duration::ZERO,
            duration: Duration::from_millis(10),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; 960],
        };
        assert_eq!(frame.frame_count(), 480);
        assert_eq!(frame.byte_size(), 3840);
    }
}
