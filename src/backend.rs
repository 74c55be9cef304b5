use std::sync::Arc;

use crate::convert::SurfacePixelFormat;
use crate::error::CaptureResult;
use crate::region::{Region, WindowFrameBounds};
use crate::window::WindowId;

/// Number of surfaces in the OS frame pool.
pub const FRAME_POOL_BUFFER_COUNT: u32 = 3;

/// Dimensions of a captured surface in physical pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A GPU device shared between the capture item, the staging cache and
/// the GPU tone-mapper.
pub trait GpuDevice: Send + Sync {
    /// Returns `Err(CaptureError::DeviceLost { .. })` once the device has
    /// been removed or hung. Never recovers.
    fn check_status(&self) -> CaptureResult<()>;

    /// Adapter description for logs.
    fn description(&self) -> String;

    /// Lets a backend recover its concrete device type.
    fn as_any(&self) -> &dyn std::any::Any;
}

pub type SharedDevice = Arc<dyn GpuDevice>;

/// How the OS capture source should be configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub pixel_format: SurfacePixelFormat,
    pub buffer_count: u32,
    pub capture_cursor: bool,
    pub border_required: bool,
}

impl SourceConfig {
    pub const fn new(pixel_format: SurfacePixelFormat) -> Self {
        Self {
            pixel_format,
            buffer_count: FRAME_POOL_BUFFER_COUNT,
            capture_cursor: false,
            border_required: false,
        }
    }
}

/// A CPU view of GPU surface data, valid for the duration of a read
/// callback.
#[derive(Clone, Copy, Debug)]
pub struct MappedSurface<'a> {
    pub data: &'a [u8],
    /// Byte distance between rows; may exceed `width * bytes_per_pixel`.
    pub row_pitch: usize,
    pub size: SurfaceSize,
    pub format: SurfacePixelFormat,
}

/// Receives mapped surface data. The view must not escape the call.
pub type SurfaceSink<'s> = dyn FnMut(MappedSurface<'_>) -> CaptureResult<()> + 's;

/// One frame delivered by the OS, borrowed for the duration of
/// [`FrameObserver::on_frame_arrived`].
pub trait ArrivedFrame {
    /// Size of the captured content. Differs from the pool size right
    /// after the target was resized.
    fn content_size(&self) -> SurfaceSize;

    fn pixel_format(&self) -> SurfacePixelFormat;

    /// Rebuilds the frame pool at `size`. Frames already delivered at the
    /// old size stay valid until they are dropped.
    fn recreate_pool(&mut self, size: SurfaceSize) -> CaptureResult<()>;

    /// Copies `region` of the frame into the staging texture and hands the
    /// mapped bytes (in the surface's own pixel format) to `sink`.
    fn read_region(&mut self, region: Region, sink: &mut SurfaceSink<'_>) -> CaptureResult<()>;

    /// Tone maps `region` on the GPU and hands the mapped BGRA8 result to
    /// `sink`.
    fn read_region_tonemapped(
        &mut self,
        region: Region,
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()>;

    /// Drops the GPU tone-mapper's shader and textures once the strategy
    /// has been disabled.
    fn release_gpu_tonemapper(&mut self);
}

/// Observer registered with a [`CaptureItem`].
///
/// Callbacks arrive on an OS-owned thread, possibly concurrently.
pub trait FrameObserver: Send + Sync {
    fn on_frame_arrived(&self, frame: &mut dyn ArrivedFrame);

    /// The OS closed the capture item (for example because the window was
    /// destroyed). No further frames follow.
    fn on_closed(&self);
}

/// An OS capture source bound to one window.
pub trait CaptureItem: Send {
    /// Surface size at creation time.
    fn initial_size(&self) -> SurfaceSize;

    fn start(&mut self, observer: Arc<dyn FrameObserver>) -> CaptureResult<()>;

    /// Unregisters the observer and releases the frame pool, staging
    /// texture and GPU tone-mapper. Idempotent.
    fn stop(&mut self);
}

pub trait CaptureBackend: Send + Sync {
    /// Fails with `InvalidHandle` when `window` is null or not a live
    /// window.
    fn validate_window(&self, window: WindowId) -> CaptureResult<()>;

    fn create_device(&self) -> CaptureResult<SharedDevice>;

    /// Whether the monitor hosting `window` is in HDR mode. `false` when
    /// the query fails.
    fn window_hdr_enabled(&self, window: WindowId) -> bool;

    /// Current window geometry, or `None` when it cannot be queried.
    fn window_frame_bounds(&self, window: WindowId) -> Option<WindowFrameBounds>;

    fn create_capture_item(
        &self,
        window: WindowId,
        device: &SharedDevice,
        config: &SourceConfig,
    ) -> CaptureResult<Box<dyn CaptureItem>>;
}

pub fn default_backend() -> CaptureResult<Arc<dyn CaptureBackend>> {
    crate::platform::build_backend()
}
