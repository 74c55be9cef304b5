use std::time::{Duration, Instant};

use crate::convert::ToneMapStrategy;
use crate::error::{CaptureError, CaptureResult};

/// Color space / transfer function describing the frame's pixel data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorSpace {
    /// Standard sRGB, captured from an SDR surface.
    #[default]
    Srgb,
    /// sRGB-encoded output of the filmic tone-mapper applied to an
    /// scRGB (linear, extended range) HDR surface.
    TonemappedHdr,
}

/// Metadata attached to each produced frame.
#[derive(Clone, Debug)]
pub struct FrameMetadata {
    /// Monotonic sequence number, starting at 1 for the first frame of a
    /// capture session.
    pub sequence: u64,
    /// Taken when the frame-arrived callback began processing the frame.
    pub capture_time: Option<Instant>,
    /// Time spent in readback and pixel conversion.
    pub conversion_duration: Option<Duration>,
    pub color_space: ColorSpace,
    pub strategy: ToneMapStrategy,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            sequence: 0,
            capture_time: None,
            conversion_duration: None,
            color_space: ColorSpace::Srgb,
            strategy: ToneMapStrategy::RawCopy,
        }
    }
}

/// A BGRA8 raster with `stride == width * 4`.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            metadata: FrameMetadata::default(),
        }
    }

    pub fn from_bgra8(width: u32, height: u32, data: Vec<u8>) -> CaptureResult<Self> {
        let expected = bgra_len(width, height)?;
        if data.len() != expected {
            return Err(CaptureError::InvalidConfig(format!(
                "BGRA frame data length mismatch: got {}, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            metadata: FrameMetadata::default(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes between the starts of consecutive rows.
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bgra_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_bgra_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resizes the pixel buffer to `width x height`, reallocating only on
    /// a dimension change. Pixel contents are unspecified afterwards.
    pub(crate) fn ensure_bgra_capacity(&mut self, width: u32, height: u32) -> CaptureResult<()> {
        if self.width == width && self.height == height && !self.data.is_empty() {
            return Ok(());
        }
        let len = bgra_len(width, height)?;
        self.data.clear();
        self.data.shrink_to(len);
        self.data.resize(len, 0);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Frees the pixel buffer.
    pub(crate) fn clear(&mut self) {
        self.data = Vec::new();
        self.width = 0;
        self.height = 0;
        self.metadata = FrameMetadata::default();
    }

    /// Copies pixels and metadata into `dst`, reusing its allocation.
    pub(crate) fn clone_into_frame(&self, dst: &mut Frame) {
        dst.data.clear();
        dst.data.extend_from_slice(&self.data);
        dst.width = self.width;
        dst.height = self.height;
        dst.metadata = self.metadata.clone();
    }
}

fn bgra_len(width: u32, height: u32) -> CaptureResult<usize> {
    let w = usize::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
    let h = usize::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
    w.checked_mul(h)
        .and_then(|px| px.checked_mul(4))
        .ok_or(CaptureError::BufferOverflow)
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_len", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Zero-copy view of the latest frame, returned by
/// [`WindowCapturer::try_get_frame_data`](crate::WindowCapturer::try_get_frame_data).
///
/// `ptr` stays valid until the matching `release_frame()` call; the
/// producer will not write to the slot it points into before then.
#[derive(Clone, Copy, Debug)]
pub struct FrameData {
    pub ptr: *const u8,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub sequence: u64,
}

// SAFETY: the pointer is a read-only view into a slot pinned by the
// capturer; it carries no thread affinity.
unsafe impl Send for FrameData {}

impl FrameData {
    pub fn len(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The caller must not use the slice after calling `release_frame()`
    /// on the capturer that produced this view.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        // SAFETY: upheld by the caller; the slot is pinned and holds
        // `stride * height` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_capacity_resizes_only_on_change() -> CaptureResult<()> {
        let mut frame = Frame::empty();
        frame.ensure_bgra_capacity(4, 2)?;
        assert_eq!(frame.as_bgra_bytes().len(), 32);
        assert_eq!(frame.stride(), 16);

        frame.as_mut_bgra_bytes()[0] = 7;
        frame.ensure_bgra_capacity(4, 2)?;
        assert_eq!(frame.as_bgra_bytes()[0], 7);

        frame.ensure_bgra_capacity(3, 3)?;
        assert_eq!(frame.dimensions(), (3, 3));
        assert_eq!(frame.as_bgra_bytes().len(), 36);
        Ok(())
    }

    #[test]
    fn from_bgra8_rejects_length_mismatch() {
        assert!(Frame::from_bgra8(2, 2, vec![0; 15]).is_err());
        assert!(Frame::from_bgra8(2, 2, vec![0; 16]).is_ok());
    }
}
