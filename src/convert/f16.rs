use half::f16;

use super::tonemap::ToneMapLut;

/// Bytes per RGBA16F source pixel.
pub(crate) const RGBA16F_BYTES_PER_PIXEL: usize = 8;

#[inline(always)]
fn channel(bytes: &[u8], offset: usize) -> f32 {
    f16::from_le_bytes([bytes[offset], bytes[offset + 1]]).to_f32()
}

/// Decodes one little-endian RGBA16F pixel to linear f32 components.
#[inline(always)]
pub(crate) fn decode_rgba16f(pixel: &[u8]) -> [f32; 4] {
    [
        channel(pixel, 0),
        channel(pixel, 2),
        channel(pixel, 4),
        channel(pixel, 6),
    ]
}

/// Tone maps one row of linear RGBA16F pixels into opaque BGRA8.
///
/// `src` holds `n * 8` bytes and `dst` holds `n * 4` bytes. Source alpha
/// is ignored.
pub(crate) fn tonemap_row_rgba16f_to_bgra8(src: &[u8], dst: &mut [u8], lut: &ToneMapLut) {
    debug_assert_eq!(src.len() / RGBA16F_BYTES_PER_PIXEL, dst.len() / 4);
    for (pixel, out) in src
        .chunks_exact(RGBA16F_BYTES_PER_PIXEL)
        .zip(dst.chunks_exact_mut(4))
    {
        let [r, g, b, _] = decode_rgba16f(pixel);
        out[0] = lut.map(b);
        out[1] = lut.map(g);
        out[2] = lut.map(r);
        out[3] = 0xFF;
    }
}
