mod f16;
mod parallel;
pub mod tonemap;

use parallel::{RowLayout, for_each_row};

use crate::backend::MappedSurface;
use crate::error::{CaptureError, CaptureResult};

pub use tonemap::{FilmicCurve, ToneMapLut, ToneMapStrategy};

/// Pre-initialize expensive one-time resources (rayon pool, tone-map LUT)
/// so the first capture doesn't pay the cost. Safe to call repeatedly.
pub fn warmup() {
    parallel::warmup_pool();
    let _ = ToneMapLut::global();
}

/// Pixel layout of a mapped capture surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfacePixelFormat {
    /// 8-bit BGRA, already display-referred. Copied as-is.
    Bgra8,
    /// Half-float linear RGBA (scRGB) used for HDR capture.
    Rgba16Float,
}

impl SurfacePixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 => 4,
            Self::Rgba16Float => f16::RGBA16F_BYTES_PER_PIXEL,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bgra8 => "bgra8",
            Self::Rgba16Float => "rgba16f",
        }
    }
}

/// Destination raster for a conversion: tightly sized BGRA8 rows
/// `stride` bytes apart.
pub(crate) struct BgraTarget<'a> {
    pub(crate) pixels: &'a mut [u8],
    pub(crate) stride: usize,
}

/// Converts a mapped surface into BGRA8.
///
/// BGRA8 surfaces are copied row by row; RGBA16F surfaces go through the
/// CPU tone-map LUT. Returns the strategy that produced the pixels.
pub(crate) fn convert_surface_to_bgra(
    source: &MappedSurface<'_>,
    target: BgraTarget<'_>,
) -> CaptureResult<ToneMapStrategy> {
    let width = source.size.width as usize;
    let height = source.size.height as usize;
    if width == 0 || height == 0 {
        return Err(CaptureError::InvalidConfig(
            "cannot convert an empty surface".into(),
        ));
    }

    let src_row_bytes = width
        .checked_mul(source.format.bytes_per_pixel())
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_row_bytes = width.checked_mul(4).ok_or(CaptureError::BufferOverflow)?;
    let src_required = source
        .row_pitch
        .checked_mul(height - 1)
        .and_then(|base| base.checked_add(src_row_bytes))
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_required = target
        .stride
        .checked_mul(height - 1)
        .and_then(|base| base.checked_add(dst_row_bytes))
        .ok_or(CaptureError::BufferOverflow)?;
    if source.row_pitch < src_row_bytes || source.data.len() < src_required {
        return Err(CaptureError::Platform(anyhow::anyhow!(
            "mapped surface too small: pitch={}, len={}, required={}",
            source.row_pitch,
            source.data.len(),
            src_required
        )));
    }
    if target.stride < dst_row_bytes || target.pixels.len() < dst_required {
        return Err(CaptureError::BufferOverflow);
    }

    let layout = RowLayout {
        src_pitch: source.row_pitch,
        src_row_bytes,
        dst_stride: target.stride,
        dst_row_bytes,
        height,
    };

    match source.format {
        SurfacePixelFormat::Bgra8 => {
            for_each_row(source.data, target.pixels, layout, |src, dst| {
                dst.copy_from_slice(src)
            });
            Ok(ToneMapStrategy::RawCopy)
        }
        SurfacePixelFormat::Rgba16Float => {
            let lut = ToneMapLut::global();
            for_each_row(source.data, target.pixels, layout, |src, dst| {
                f16::tonemap_row_rgba16f_to_bgra8(src, dst, lut)
            });
            Ok(ToneMapStrategy::CpuLut)
        }
    }
}
