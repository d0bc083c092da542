//! YCbCr to RGB conversion constants for the GPU path.
//!
//! The matrices are fixed per standard and range; nothing here is derived
//! at runtime. Matrices are column-major, so `cols[c][r]` is row `r` of
//! column `c`, matching the WGSL `mat3x3` constructor.

use bytemuck::{Pod, Zeroable};

use crate::frame::{ColorRange, Colorimetry, MatrixStandard, PixelFormat};

/// A 3x3 conversion matrix, column-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix {
    pub cols: [[f32; 3]; 3],
}

/// Per-component offset applied to (Y, Cb, Cr) before the matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorOffset(pub [f32; 3]);

pub const MATRIX_BT601_VIDEO: ColorMatrix = ColorMatrix {
    cols: [
        [1.164, 1.164, 1.164],
        [0.0, 0.392, 2.017],
        [1.596, 0.813, 0.0],
    ],
};

pub const MATRIX_BT601_FULL: ColorMatrix = ColorMatrix {
    cols: [
        [1.0, 1.0, 1.0],
        [0.0, -0.343, 1.765],
        [1.4, -0.711, 0.0],
    ],
};

pub const MATRIX_BT709_VIDEO: ColorMatrix = ColorMatrix {
    cols: [
        [1.164, 1.164, 1.164],
        [0.0, -0.213, 2.112],
        [1.793, -0.533, 0.0],
    ],
};

pub const MATRIX_BT709_FULL: ColorMatrix = ColorMatrix {
    cols: [
        [1.0, 1.0, 1.0],
        [0.0, -0.187, 1.856],
        [1.570, -0.467, 0.0],
    ],
};

pub const OFFSET_VIDEO: ColorOffset = ColorOffset([-(16.0 / 255.0), -0.5, -0.5]);
pub const OFFSET_FULL: ColorOffset = ColorOffset([0.0, -0.5, -0.5]);

/// Selects the matrix and offset a frame binds, or `None` for packed BGRA
/// which needs no conversion.
///
/// Untagged frames decode as BT.709 full-range. The offset is chosen
/// purely by the frame's range.
pub fn conversion(
    format: PixelFormat,
    colorimetry: Option<Colorimetry>,
) -> Option<(ColorMatrix, ColorOffset)> {
    if format == PixelFormat::Bgra {
        return None;
    }
    let colorimetry = colorimetry.unwrap_or_default();
    let matrix = match (colorimetry.standard, colorimetry.range) {
        (MatrixStandard::Bt601, ColorRange::Full) => MATRIX_BT601_FULL,
        // 601 video-range deliberately resolves to the full-range matrix;
        // kept so output matches established behavior (see DESIGN.md).
        // MATRIX_BT601_VIDEO stays in the table for when this is revisited.
        (MatrixStandard::Bt601, ColorRange::Video) => MATRIX_BT601_FULL,
        (MatrixStandard::Bt709, ColorRange::Full) => MATRIX_BT709_FULL,
        (MatrixStandard::Bt709, ColorRange::Video) => MATRIX_BT709_VIDEO,
    };
    let offset = match colorimetry.range {
        ColorRange::Video => OFFSET_VIDEO,
        ColorRange::Full => OFFSET_FULL,
    };
    Some((matrix, offset))
}

/// The fragment uniform carrying the conversion.
///
/// WGSL std140-style layout: each mat3x3 column and the offset vector pad
/// to 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ColorUniform {
    pub matrix: [[f32; 4]; 3],
    pub offset: [f32; 4],
}

impl ColorUniform {
    pub fn new(matrix: ColorMatrix, offset: ColorOffset) -> Self {
        let pad = |c: [f32; 3]| [c[0], c[1], c[2], 0.0];
        Self {
            matrix: [pad(matrix.cols[0]), pad(matrix.cols[1]), pad(matrix.cols[2])],
            offset: pad(offset.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(standard: MatrixStandard, range: ColorRange) -> Option<Colorimetry> {
        Some(Colorimetry { standard, range })
    }

    #[test]
    fn test_bgra_binds_nothing() {
        assert!(conversion(PixelFormat::Bgra, None).is_none());
        assert!(conversion(
            PixelFormat::Bgra,
            tag(MatrixStandard::Bt601, ColorRange::Video)
        )
        .is_none());
    }

    #[test]
    fn test_untagged_defaults_to_709_full() {
        let (m, o) = conversion(PixelFormat::Nv12, None).unwrap();
        assert_eq!(m, MATRIX_BT709_FULL);
        assert_eq!(o, OFFSET_FULL);
    }

    #[test]
    fn test_709_video_range() {
        let (m, o) =
            conversion(PixelFormat::Nv12, tag(MatrixStandard::Bt709, ColorRange::Video)).unwrap();
        assert_eq!(m, MATRIX_BT709_VIDEO);
        assert_eq!(o, OFFSET_VIDEO);
    }

    #[test]
    fn test_601_video_range_substitutes_full_matrix() {
        // Matrix is the full-range one, but the offset still follows the
        // tagged range
        let (m, o) =
            conversion(PixelFormat::Nv12, tag(MatrixStandard::Bt601, ColorRange::Video)).unwrap();
        assert_eq!(m, MATRIX_BT601_FULL);
        assert_eq!(o, OFFSET_VIDEO);
    }

    #[test]
    fn test_exact_constants() {
        assert_eq!(MATRIX_BT709_VIDEO.cols[2], [1.793, -0.533, 0.0]);
        assert_eq!(MATRIX_BT601_VIDEO.cols[1], [0.0, 0.392, 2.017]);
        assert_eq!(OFFSET_VIDEO.0[0], -(16.0 / 255.0));
    }

    #[test]
    fn test_uniform_padding() {
        let u = ColorUniform::new(MATRIX_BT709_FULL, OFFSET_FULL);
        assert_eq!(std::mem::size_of::<ColorUniform>(), 64);
        assert_eq!(u.matrix[0], [1.0, 1.0, 1.0, 0.0]);
        assert_eq!(u.offset, [0.0, -0.5, -0.5, 0.0]);
    }
}
