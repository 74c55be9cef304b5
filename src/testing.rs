//! Scriptable in-process capture backend for unit tests.
//!
//! Frames are delivered synchronously on the test thread through
//! [`MockBackend::deliver_frame`], which calls the registered observer the
//! same way the OS frame-arrived callback would.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{
    ArrivedFrame, CaptureBackend, CaptureItem, FrameObserver, GpuDevice, MappedSurface,
    SharedDevice, SourceConfig, SurfaceSink, SurfaceSize,
};
use crate::convert::{SurfacePixelFormat, ToneMapLut};
use crate::error::{CaptureError, CaptureResult};
use crate::region::{Region, WindowFrameBounds};
use crate::window::WindowId;

/// Bytes of padding appended to every mapped row, so consumers that
/// ignore the row pitch produce visibly wrong frames.
const ROW_PADDING: usize = 16;

pub(crate) struct MockDevice {
    id: usize,
    lost: Mutex<Option<String>>,
}

impl GpuDevice for MockDevice {
    fn check_status(&self) -> CaptureResult<()> {
        match self.lost.lock().unwrap().as_ref() {
            Some(reason) => Err(CaptureError::device_lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn description(&self) -> String {
        format!("mock-device-{}", self.id)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// State shared between the backend, its current item and delivered
/// frames.
#[derive(Default)]
struct ItemState {
    observer: Mutex<Option<Arc<dyn FrameObserver>>>,
    pool_size: Mutex<SurfaceSize>,
    config: Mutex<Option<SourceConfig>>,
    started: AtomicBool,
    stopped: AtomicBool,
    pool_recreations: AtomicUsize,
}

struct MockItem {
    state: Arc<ItemState>,
}

impl CaptureItem for MockItem {
    fn initial_size(&self) -> SurfaceSize {
        *self.state.pool_size.lock().unwrap()
    }

    fn start(&mut self, observer: Arc<dyn FrameObserver>) -> CaptureResult<()> {
        *self.state.observer.lock().unwrap() = Some(observer);
        self.state.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.observer.lock().unwrap().take();
        self.state.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockBackend {
    window_alive: AtomicBool,
    hdr_monitor: AtomicBool,
    bounds: Mutex<Option<WindowFrameBounds>>,
    surface_size: Mutex<SurfaceSize>,
    fail_device_creation: AtomicBool,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    item: Mutex<Option<Arc<ItemState>>>,
    /// Linear value written to every channel of HDR frames.
    hdr_value: Mutex<f32>,
    gpu_failures_remaining: AtomicU32,
    shader_compile_fails: AtomicBool,
    gpu_calls: AtomicUsize,
    gpu_releases: AtomicUsize,
    reenter_on_read: AtomicBool,
    lose_device_on_read: Mutex<Option<String>>,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.window_alive.store(true, Ordering::SeqCst);
        *backend.surface_size.lock().unwrap() = SurfaceSize::new(1920, 1080);
        *backend.hdr_value.lock().unwrap() = 1.0;
        Arc::new(backend)
    }

    pub(crate) fn window() -> WindowId {
        WindowId::from_raw_handle(0x1234)
    }

    pub(crate) fn set_window_alive(&self, alive: bool) {
        self.window_alive.store(alive, Ordering::SeqCst);
    }

    pub(crate) fn set_hdr_monitor(&self, hdr: bool) {
        self.hdr_monitor.store(hdr, Ordering::SeqCst);
    }

    pub(crate) fn set_frame_bounds(&self, bounds: Option<WindowFrameBounds>) {
        *self.bounds.lock().unwrap() = bounds;
    }

    /// Size reported by items created after this call.
    pub(crate) fn set_surface_size(&self, size: SurfaceSize) {
        *self.surface_size.lock().unwrap() = size;
    }

    pub(crate) fn set_hdr_value(&self, value: f32) {
        *self.hdr_value.lock().unwrap() = value;
    }

    pub(crate) fn fail_device_creation(&self, fail: bool) {
        self.fail_device_creation.store(fail, Ordering::SeqCst);
    }

    /// Marks every device created so far as removed.
    pub(crate) fn lose_device(&self, reason: &str) {
        for device in self.devices.lock().unwrap().iter() {
            *device.lost.lock().unwrap() = Some(reason.to_owned());
        }
    }

    /// Loses the device while the next frame is being read back.
    pub(crate) fn lose_device_during_next_read(&self, reason: &str) {
        *self.lose_device_on_read.lock().unwrap() = Some(reason.to_owned());
    }

    pub(crate) fn fail_next_gpu_passes(&self, count: u32) {
        self.gpu_failures_remaining.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_shader_compilation(&self, fail: bool) {
        self.shader_compile_fails.store(fail, Ordering::SeqCst);
    }

    /// Makes the next readback call the observer again from inside the
    /// callback.
    pub(crate) fn reenter_on_next_read(&self) {
        self.reenter_on_read.store(true, Ordering::SeqCst);
    }

    pub(crate) fn devices_created(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub(crate) fn gpu_calls(&self) -> usize {
        self.gpu_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn gpu_releases(&self) -> usize {
        self.gpu_releases.load(Ordering::SeqCst)
    }

    pub(crate) fn pool_recreations(&self) -> usize {
        self.current_item()
            .map(|item| item.pool_recreations.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub(crate) fn item_started(&self) -> bool {
        self.current_item()
            .map(|item| item.started.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub(crate) fn item_stopped(&self) -> bool {
        self.current_item()
            .map(|item| item.stopped.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub(crate) fn source_config(&self) -> Option<SourceConfig> {
        let item = self.current_item()?;
        let config = *item.config.lock().unwrap();
        config
    }

    fn current_item(&self) -> Option<Arc<ItemState>> {
        self.item.lock().unwrap().clone()
    }

    /// Delivers one frame of `content_size` to the current observer.
    /// Returns `false` when no observer is registered.
    pub(crate) fn deliver_frame(self: &Arc<Self>, content_size: SurfaceSize) -> bool {
        let Some(item) = self.current_item() else {
            return false;
        };
        let observer = item.observer.lock().unwrap().clone();
        let Some(observer) = observer else {
            return false;
        };
        let format = item
            .config
            .lock()
            .unwrap()
            .map(|config| config.pixel_format)
            .unwrap_or(SurfacePixelFormat::Bgra8);
        let mut frame = MockFrame {
            backend: Arc::clone(self),
            item,
            observer: Arc::clone(&observer),
            content_size,
            format,
        };
        observer.on_frame_arrived(&mut frame);
        true
    }

    /// Fires the item's `Closed` notification.
    pub(crate) fn close_item(&self) {
        let Some(item) = self.current_item() else {
            return;
        };
        let observer = item.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_closed();
        }
    }
}

impl CaptureBackend for MockBackend {
    fn validate_window(&self, window: WindowId) -> CaptureResult<()> {
        if window.is_null() || !self.window_alive.load(Ordering::SeqCst) {
            return Err(CaptureError::InvalidHandle(window.stable_id()));
        }
        Ok(())
    }

    fn create_device(&self) -> CaptureResult<SharedDevice> {
        if self.fail_device_creation.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceCreation(anyhow::anyhow!(
                "no hardware adapter"
            )));
        }
        let mut devices = self.devices.lock().unwrap();
        let device = Arc::new(MockDevice {
            id: devices.len(),
            lost: Mutex::new(None),
        });
        devices.push(Arc::clone(&device));
        Ok(device)
    }

    fn window_hdr_enabled(&self, _window: WindowId) -> bool {
        self.hdr_monitor.load(Ordering::SeqCst)
    }

    fn window_frame_bounds(&self, _window: WindowId) -> Option<WindowFrameBounds> {
        *self.bounds.lock().unwrap()
    }

    fn create_capture_item(
        &self,
        _window: WindowId,
        _device: &SharedDevice,
        config: &SourceConfig,
    ) -> CaptureResult<Box<dyn CaptureItem>> {
        let state = Arc::new(ItemState::default());
        *state.pool_size.lock().unwrap() = *self.surface_size.lock().unwrap();
        *state.config.lock().unwrap() = Some(*config);
        *self.item.lock().unwrap() = Some(Arc::clone(&state));
        Ok(Box::new(MockItem { state }))
    }
}

struct MockFrame {
    backend: Arc<MockBackend>,
    item: Arc<ItemState>,
    observer: Arc<dyn FrameObserver>,
    content_size: SurfaceSize,
    format: SurfacePixelFormat,
}

impl MockFrame {
    fn before_read(&mut self) {
        if self.backend.reenter_on_read.swap(false, Ordering::SeqCst) {
            let mut nested = MockFrame {
                backend: Arc::clone(&self.backend),
                item: Arc::clone(&self.item),
                observer: Arc::clone(&self.observer),
                content_size: self.content_size,
                format: self.format,
            };
            self.observer.on_frame_arrived(&mut nested);
        }
        if let Some(reason) = self.backend.lose_device_on_read.lock().unwrap().take() {
            self.backend.lose_device(&reason);
        }
    }

    fn emit(
        region: Region,
        format: SurfacePixelFormat,
        pixel: impl Fn(u32, u32, &mut [u8]),
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()> {
        let row_bytes = region.width() as usize * format.bytes_per_pixel();
        let row_pitch = row_bytes + ROW_PADDING;
        let mut data = vec![0xEE; row_pitch * region.height() as usize];
        for y in 0..region.height() {
            let row = &mut data[y as usize * row_pitch..][..row_bytes];
            for (x, px) in row.chunks_exact_mut(format.bytes_per_pixel()).enumerate() {
                pixel(region.left + x as u32, region.top + y, px);
            }
        }
        sink(MappedSurface {
            data: &data,
            row_pitch,
            size: region.size(),
            format,
        })
    }
}

/// BGRA pattern encoding the absolute surface coordinate of each pixel.
pub(crate) fn sdr_pixel(x: u32, y: u32) -> [u8; 4] {
    [x as u8, y as u8, (x >> 8) as u8 ^ (y >> 8) as u8, 255]
}

impl ArrivedFrame for MockFrame {
    fn content_size(&self) -> SurfaceSize {
        self.content_size
    }

    fn pixel_format(&self) -> SurfacePixelFormat {
        self.format
    }

    fn recreate_pool(&mut self, size: SurfaceSize) -> CaptureResult<()> {
        *self.item.pool_size.lock().unwrap() = size;
        self.item.pool_recreations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_region(&mut self, region: Region, sink: &mut SurfaceSink<'_>) -> CaptureResult<()> {
        self.before_read();
        match self.format {
            SurfacePixelFormat::Bgra8 => {
                Self::emit(region, self.format, |x, y, px| px.copy_from_slice(&sdr_pixel(x, y)), sink)
            }
            SurfacePixelFormat::Rgba16Float => {
                let value = half::f16::from_f32(*self.backend.hdr_value.lock().unwrap());
                let mut px = Vec::with_capacity(8);
                for _ in 0..3 {
                    px.extend_from_slice(&value.to_le_bytes());
                }
                px.extend_from_slice(&half::f16::ONE.to_le_bytes());
                Self::emit(region, self.format, |_, _, dst| dst.copy_from_slice(&px), sink)
            }
        }
    }

    fn read_region_tonemapped(
        &mut self,
        region: Region,
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()> {
        self.before_read();
        self.backend.gpu_calls.fetch_add(1, Ordering::SeqCst);
        if self.backend.shader_compile_fails.load(Ordering::SeqCst) {
            return Err(CaptureError::ShaderCompilation(
                "X3000: syntax error".into(),
            ));
        }
        let injected = self
            .backend
            .gpu_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "injected Dispatch failure"
            )));
        }
        let value = half::f16::from_f32(*self.backend.hdr_value.lock().unwrap()).to_f32();
        let mapped = ToneMapLut::global().map(value);
        Self::emit(
            region,
            SurfacePixelFormat::Bgra8,
            |_, _, dst| dst.copy_from_slice(&[mapped, mapped, mapped, 255]),
            sink,
        )
    }

    fn release_gpu_tonemapper(&mut self) {
        self.backend.gpu_releases.fetch_add(1, Ordering::SeqCst);
    }
}
