use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use windows::Foundation::{EventRegistrationToken, TypedEventHandler};
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem,
    GraphicsCaptureSession,
};
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::core::{IInspectable, Interface};

use crate::backend::{
    ArrivedFrame, CaptureItem, FrameObserver, SourceConfig, SurfaceSink, SurfaceSize,
};
use crate::convert::SurfacePixelFormat;
use crate::error::{CaptureError, CaptureResult};
use crate::region::Region;

use super::com::ApartmentGuard;
use super::d3d11::D3dDevice;
use super::gpu_tonemap::GpuToneMapper;
use super::surface::StagingCache;

pub(crate) fn validate_support() -> CaptureResult<()> {
    let supported = GraphicsCaptureSession::IsSupported()
        .context("GraphicsCaptureSession::IsSupported failed")
        .map_err(CaptureError::Platform)?;
    if supported {
        Ok(())
    } else {
        Err(CaptureError::BackendUnavailable(
            "Windows Graphics Capture is not supported on this system".into(),
        ))
    }
}

fn create_window_capture_item(window: HWND) -> CaptureResult<GraphicsCaptureItem> {
    let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
        .context("failed to get IGraphicsCaptureItemInterop factory")
        .map_err(CaptureError::Platform)?;
    unsafe { interop.CreateForWindow(window) }
        .context("IGraphicsCaptureItemInterop::CreateForWindow failed")
        .map_err(CaptureError::Platform)
}

fn directx_format(format: SurfacePixelFormat) -> DirectXPixelFormat {
    match format {
        SurfacePixelFormat::Bgra8 => DirectXPixelFormat::B8G8R8A8UIntNormalized,
        SurfacePixelFormat::Rgba16Float => DirectXPixelFormat::R16G16B16A16Float,
    }
}

fn to_size_int32(size: SurfaceSize) -> SizeInt32 {
    SizeInt32 {
        Width: size.width.min(i32::MAX as u32) as i32,
        Height: size.height.min(i32::MAX as u32) as i32,
    }
}

fn from_size_int32(size: SizeInt32) -> SurfaceSize {
    SurfaceSize::new(size.Width.max(0) as u32, size.Height.max(0) as u32)
}

/// GPU objects reused across frames. Locked lazily by each frame so a
/// callback the session drops never waits on one that is converting.
#[derive(Default)]
struct FrameResources {
    staging: StagingCache,
    tonemapper: Option<GpuToneMapper>,
}

// SAFETY: the D3D11 objects inside belong to a free-threaded device and are
// only touched while the surrounding mutex is held.
unsafe impl Send for FrameResources {}

/// State the frame-arrived handler needs; shared with the item so that
/// `stop` can release GPU objects.
struct FrameContext {
    device: D3dDevice,
    config: SourceConfig,
    resources: Mutex<FrameResources>,
}

impl FrameContext {
    fn resources(&self) -> CaptureResult<MutexGuard<'_, FrameResources>> {
        self.resources.lock().map_err(|_| {
            CaptureError::Platform(anyhow::anyhow!("capture resource mutex was poisoned"))
        })
    }

    fn release_resources(&self) {
        let mut resources = match self.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        resources.staging.clear();
        resources.tonemapper = None;
    }
}

struct RunningCapture {
    pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    frame_arrived_token: EventRegistrationToken,
    closed_token: EventRegistrationToken,
}

/// Windows Graphics Capture source for one top-level window.
pub(crate) struct WgcCaptureItem {
    item: GraphicsCaptureItem,
    initial_size: SurfaceSize,
    context: Arc<FrameContext>,
    running: Option<RunningCapture>,
    _apartment: ApartmentGuard,
}

impl WgcCaptureItem {
    pub(crate) fn new(hwnd: HWND, device: D3dDevice, config: SourceConfig) -> CaptureResult<Self> {
        let apartment = ApartmentGuard::enter_mta()?;
        let item = create_window_capture_item(hwnd)?;
        let initial_size = item
            .Size()
            .context("GraphicsCaptureItem::Size failed")
            .map_err(CaptureError::Platform)?;

        Ok(Self {
            item,
            initial_size: from_size_int32(initial_size),
            context: Arc::new(FrameContext {
                device,
                config,
                resources: Mutex::new(FrameResources::default()),
            }),
            running: None,
            _apartment: apartment,
        })
    }
}

impl CaptureItem for WgcCaptureItem {
    fn initial_size(&self) -> SurfaceSize {
        self.initial_size
    }

    fn start(&mut self, observer: Arc<dyn FrameObserver>) -> CaptureResult<()> {
        if self.running.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }

        let config = self.context.config;
        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            self.context.device.winrt(),
            directx_format(config.pixel_format),
            config.buffer_count as i32,
            to_size_int32(self.initial_size),
        )
        .context("Direct3D11CaptureFramePool::CreateFreeThreaded failed")
        .map_err(CaptureError::Platform)?;
        let session = pool
            .CreateCaptureSession(&self.item)
            .context("Direct3D11CaptureFramePool::CreateCaptureSession failed")
            .map_err(CaptureError::Platform)?;

        // Both toggles are missing on older builds of Windows 10.
        if let Err(error) = session.SetIsCursorCaptureEnabled(config.capture_cursor) {
            tracing::debug!(%error, "cursor capture toggle unavailable");
        }
        if let Err(error) = session.SetIsBorderRequired(config.border_required) {
            tracing::debug!(%error, "capture border toggle unavailable");
        }

        let frame_context = self.context.clone();
        let frame_observer = observer.clone();
        let frame_arrived_token = pool
            .FrameArrived(
                &TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new(
                    move |sender, _| {
                        let Some(pool) = sender else {
                            return Ok(());
                        };
                        let Ok(frame) = pool.TryGetNextFrame() else {
                            return Ok(());
                        };
                        {
                            let mut arrived = WgcFrame::new(&frame, pool, &frame_context);
                            frame_observer.on_frame_arrived(&mut arrived);
                        }
                        let _ = frame.Close();
                        Ok(())
                    },
                ),
            )
            .context("Direct3D11CaptureFramePool::FrameArrived registration failed")
            .map_err(CaptureError::Platform)?;

        let closed_token = match self.item.Closed(&TypedEventHandler::<
            GraphicsCaptureItem,
            IInspectable,
        >::new(move |_, _| {
            observer.on_closed();
            Ok(())
        })) {
            Ok(token) => token,
            Err(error) => {
                let _ = pool.RemoveFrameArrived(frame_arrived_token);
                let _ = session.Close();
                let _ = pool.Close();
                return Err(CaptureError::Platform(
                    anyhow::Error::from(error).context("GraphicsCaptureItem::Closed registration failed"),
                ));
            }
        };

        let running = RunningCapture {
            pool,
            session,
            frame_arrived_token,
            closed_token,
        };
        if let Err(error) = running.session.StartCapture() {
            shutdown(&self.item, running);
            return Err(CaptureError::Platform(
                anyhow::Error::from(error).context("GraphicsCaptureSession::StartCapture failed"),
            ));
        }

        tracing::debug!(
            width = self.initial_size.width,
            height = self.initial_size.height,
            format = config.pixel_format.as_str(),
            "capture session started"
        );
        self.running = Some(running);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            shutdown(&self.item, running);
            tracing::debug!("capture session closed");
        }
        self.context.release_resources();
    }
}

impl Drop for WgcCaptureItem {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shutdown(item: &GraphicsCaptureItem, running: RunningCapture) {
    let _ = running.pool.RemoveFrameArrived(running.frame_arrived_token);
    let _ = item.RemoveClosed(running.closed_token);
    let _ = running.session.Close();
    let _ = running.pool.Close();
}

/// One delivered WGC frame, valid for the duration of the handler.
struct WgcFrame<'a> {
    frame: &'a Direct3D11CaptureFrame,
    pool: &'a Direct3D11CaptureFramePool,
    context: &'a FrameContext,
    content_size: SurfaceSize,
    texture: Option<ID3D11Texture2D>,
}

impl<'a> WgcFrame<'a> {
    fn new(
        frame: &'a Direct3D11CaptureFrame,
        pool: &'a Direct3D11CaptureFramePool,
        context: &'a FrameContext,
    ) -> Self {
        let content_size = frame
            .ContentSize()
            .map(from_size_int32)
            .unwrap_or_default();
        Self {
            frame,
            pool,
            context,
            content_size,
            texture: None,
        }
    }

    fn texture(&mut self) -> CaptureResult<ID3D11Texture2D> {
        if let Some(texture) = &self.texture {
            return Ok(texture.clone());
        }
        let device = &self.context.device;
        let surface = self
            .frame
            .Surface()
            .map_err(|error| device.classify(error, "Direct3D11CaptureFrame::Surface failed"))?;
        let access: IDirect3DDxgiInterfaceAccess = surface
            .cast()
            .context("failed to cast frame surface to IDirect3DDxgiInterfaceAccess")
            .map_err(CaptureError::Platform)?;
        let texture: ID3D11Texture2D = unsafe { access.GetInterface() }.map_err(|error| {
            device.classify(error, "IDirect3DDxgiInterfaceAccess::GetInterface failed")
        })?;
        self.texture = Some(texture.clone());
        Ok(texture)
    }
}

impl ArrivedFrame for WgcFrame<'_> {
    fn content_size(&self) -> SurfaceSize {
        self.content_size
    }

    fn pixel_format(&self) -> SurfacePixelFormat {
        self.context.config.pixel_format
    }

    fn recreate_pool(&mut self, size: SurfaceSize) -> CaptureResult<()> {
        let config = self.context.config;
        self.pool
            .Recreate(
                self.context.device.winrt(),
                directx_format(config.pixel_format),
                config.buffer_count as i32,
                to_size_int32(size),
            )
            .map_err(|error| {
                self.context
                    .device
                    .classify(error, "Direct3D11CaptureFramePool::Recreate failed")
            })
    }

    fn read_region(&mut self, region: Region, sink: &mut SurfaceSink<'_>) -> CaptureResult<()> {
        let texture = self.texture()?;
        let device = &self.context.device;
        let mut resources = self.context.resources()?;
        let context = device.context()?;
        resources.staging.read(
            device,
            &context,
            &texture,
            region,
            self.context.config.pixel_format,
            sink,
        )
    }

    fn read_region_tonemapped(
        &mut self,
        region: Region,
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()> {
        let texture = self.texture()?;
        let device = &self.context.device;
        let mut resources = self.context.resources()?;
        let tonemapper = match &mut resources.tonemapper {
            Some(tonemapper) => tonemapper,
            slot @ None => slot.insert(GpuToneMapper::new(device)?),
        };
        tonemapper.tonemap(device, &texture, region, sink)
    }

    fn release_gpu_tonemapper(&mut self) {
        let mut resources = match self.context.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if resources.tonemapper.take().is_some() {
            tracing::info!("GPU tone-mapper released");
        }
    }
}
