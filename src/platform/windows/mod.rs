pub(crate) mod com;
pub(crate) mod d3d11;
pub(crate) mod gpu_tonemap;
pub(crate) mod monitor;
pub(crate) mod surface;
pub(crate) mod wgc;
pub(crate) mod window;

use std::sync::Arc;

use crate::backend::{CaptureBackend, CaptureItem, SharedDevice, SourceConfig};
use crate::error::{CaptureError, CaptureResult};
use crate::region::WindowFrameBounds;
use crate::window::WindowId;

use self::d3d11::D3dDevice;

/// Windows Graphics Capture on a D3D11 hardware device.
pub(crate) struct WindowsBackend;

impl WindowsBackend {
    pub(crate) fn new() -> CaptureResult<Self> {
        wgc::validate_support()?;
        Ok(Self)
    }
}

impl CaptureBackend for WindowsBackend {
    fn validate_window(&self, window: WindowId) -> CaptureResult<()> {
        window::validate(window)
    }

    fn create_device(&self) -> CaptureResult<SharedDevice> {
        let device = D3dDevice::create()?;
        Ok(Arc::new(device))
    }

    fn window_hdr_enabled(&self, window: WindowId) -> bool {
        match monitor::window_hdr_enabled(window::hwnd(window)) {
            Ok(enabled) => enabled,
            Err(error) => {
                tracing::warn!(%error, "HDR probe failed; assuming SDR");
                false
            }
        }
    }

    fn window_frame_bounds(&self, window: WindowId) -> Option<WindowFrameBounds> {
        window::frame_bounds(window)
    }

    fn create_capture_item(
        &self,
        window: WindowId,
        device: &SharedDevice,
        config: &SourceConfig,
    ) -> CaptureResult<Box<dyn CaptureItem>> {
        let device = device
            .as_any()
            .downcast_ref::<D3dDevice>()
            .ok_or_else(|| {
                CaptureError::InvalidConfig("device was not created by the Windows backend".into())
            })?
            .clone();
        let item = wgc::WgcCaptureItem::new(window::hwnd(window), device, *config)?;
        Ok(Box::new(item))
    }
}
