use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::{
    ArrivedFrame, CaptureBackend, CaptureItem, FrameObserver, SharedDevice, SourceConfig,
    SurfaceSink, SurfaceSize,
};
use crate::convert::tonemap::GpuToneMapGate;
use crate::convert::{self, BgraTarget, SurfacePixelFormat, ToneMapStrategy};
use crate::device::DeviceManager;
use crate::env_config;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{ColorSpace, Frame};
use crate::region::{self, Region};
use crate::triple_buffer::{TripleBuffer, WriteOutcome};
use crate::window::WindowId;

/// Upper bound on how long `stop` waits for an in-flight frame callback.
pub const STOP_CALLBACK_WAIT: Duration = Duration::from_millis(100);

/// Options accepted by [`WindowCapturer::start`](crate::WindowCapturer::start).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Capture in RGBA16F and tone map to SDR. `None` follows the HDR
    /// state of the monitor hosting the window.
    pub enable_hdr: Option<bool>,
    /// Prefer the GPU compute tone-mapper over the CPU lookup table.
    /// `None` means yes.
    pub gpu_hdr_conversion: Option<bool>,
    /// Compose the mouse cursor into captured frames.
    pub capture_cursor: bool,
    /// Keep the OS capture border around the window. Best effort.
    pub border_required: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub(crate) hdr: bool,
    pub(crate) gpu_tonemap: bool,
    pub(crate) capture_cursor: bool,
    pub(crate) border_required: bool,
}

impl CaptureOptions {
    pub(crate) fn resolve(&self, hdr_probe: impl FnOnce() -> bool) -> ResolvedOptions {
        let hdr = match self.enable_hdr {
            Some(explicit) => explicit,
            None => hdr_probe(),
        };
        let gpu_tonemap =
            hdr && self.gpu_hdr_conversion.unwrap_or(true) && env_config::gpu_tonemap_allowed();
        ResolvedOptions {
            hdr,
            gpu_tonemap,
            capture_cursor: self.capture_cursor,
            border_required: self.border_required,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Capturing = 1,
    Stopping = 2,
}

impl SessionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Capturing,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// Point-in-time counters for the current (or last) capture session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_produced: u64,
    /// Frame-arrived events dropped because a previous callback was still
    /// running.
    pub dropped_reentrant: u64,
    /// Events consumed by a surface resize.
    pub skipped_resize: u64,
    /// Frames dropped because readers held every spare slot.
    pub dropped_no_slot: u64,
    /// Per-frame failures that did not end the session.
    pub transient_errors: u64,
    /// Strategy that produced the most recent frame.
    pub strategy: Option<ToneMapStrategy>,
}

const NO_STRATEGY: u8 = u8::MAX;

/// State shared between the capturer's consumer API and the frame
/// callback. Outlives individual sessions; `begin_session` resets it.
pub(crate) struct SessionShared {
    state: AtomicU8,
    generation: AtomicU64,
    in_callback: AtomicBool,
    pub(crate) frames: TripleBuffer,
    frames_produced: AtomicU64,
    dropped_reentrant: AtomicU64,
    skipped_resize: AtomicU64,
    dropped_no_slot: AtomicU64,
    transient_errors: AtomicU64,
    strategy: AtomicU8,
    last_error: Mutex<Option<CaptureError>>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            generation: AtomicU64::new(0),
            in_callback: AtomicBool::new(false),
            frames: TripleBuffer::new(),
            frames_produced: AtomicU64::new(0),
            dropped_reentrant: AtomicU64::new(0),
            skipped_resize: AtomicU64::new(0),
            dropped_no_slot: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            strategy: AtomicU8::new(NO_STRATEGY),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.state() == SessionState::Capturing
    }

    pub(crate) fn frame_count(&self) -> u64 {
        self.frames_produced.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> CaptureStats {
        let strategy = match self.strategy.load(Ordering::Acquire) {
            NO_STRATEGY => None,
            raw => Some(ToneMapStrategy::from_u8(raw)),
        };
        CaptureStats {
            frames_produced: self.frames_produced.load(Ordering::Acquire),
            dropped_reentrant: self.dropped_reentrant.load(Ordering::Relaxed),
            skipped_resize: self.skipped_resize.load(Ordering::Relaxed),
            dropped_no_slot: self.dropped_no_slot.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            strategy,
        }
    }

    fn last_error_slot(&self) -> MutexGuard<'_, Option<CaptureError>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn last_error(&self) -> Option<CaptureError> {
        self.last_error_slot().as_ref().map(CaptureError::to_sendable)
    }

    /// Resets counters, reopens the frame store and returns the new
    /// session generation.
    fn begin_session(&self) -> u64 {
        self.frames_produced.store(0, Ordering::Release);
        self.dropped_reentrant.store(0, Ordering::Relaxed);
        self.skipped_resize.store(0, Ordering::Relaxed);
        self.dropped_no_slot.store(0, Ordering::Relaxed);
        self.transient_errors.store(0, Ordering::Relaxed);
        self.strategy.store(NO_STRATEGY, Ordering::Release);
        *self.last_error_slot() = None;
        self.frames.reopen();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation && self.is_capturing()
    }

    /// Ends the session after a GPU-fatal error. Only the first caller
    /// records its error.
    fn fail(&self, generation: u64, error: CaptureError) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let transitioned = self
            .state
            .compare_exchange(
                SessionState::Capturing as u8,
                SessionState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !transitioned {
            return;
        }
        self.frames.close_and_clear();
        self.set_state(SessionState::Idle);
        tracing::error!(generation, "capture stopped: {error}");
        *self.last_error_slot() = Some(error);
    }

    /// Spin-waits until no frame callback is running or `timeout` passes.
    /// Returns `false` on timeout.
    fn wait_for_callback(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_callback.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }
}

/// Clears the re-entrancy flag when the callback returns.
struct CallbackGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CallbackGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Mutable per-session pipeline state, touched only by the callback
/// holding the re-entrancy guard.
struct PipelineState {
    surface_size: SurfaceSize,
    region: Region,
    gate: GpuToneMapGate,
    sequence: u64,
}

enum FrameOutcome {
    Produced,
    SkippedResize,
    Discarded,
}

/// The observer registered with the capture item.
struct FrameProcessor {
    shared: Arc<SessionShared>,
    generation: u64,
    window: WindowId,
    backend: Arc<dyn CaptureBackend>,
    device: SharedDevice,
    hdr: bool,
    pipeline: Mutex<PipelineState>,
}

impl FrameProcessor {
    fn pipeline(&self) -> MutexGuard<'_, PipelineState> {
        self.pipeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process(&self, frame: &mut dyn ArrivedFrame) -> CaptureResult<FrameOutcome> {
        let started = Instant::now();
        self.device.check_status()?;

        let mut pipeline = self.pipeline();
        let size = frame.content_size();
        if size.is_empty() {
            return Ok(FrameOutcome::Discarded);
        }
        if size != pipeline.surface_size {
            frame.recreate_pool(size)?;
            let bounds = self.backend.window_frame_bounds(self.window);
            pipeline.surface_size = size;
            pipeline.region = region::client_region(size, bounds);
            tracing::debug!(
                width = size.width,
                height = size.height,
                region = ?pipeline.region,
                "capture surface resized"
            );
            return Ok(FrameOutcome::SkippedResize);
        }
        if !pipeline.region.fits(size) || pipeline.region.is_empty() {
            let bounds = self.backend.window_frame_bounds(self.window);
            pipeline.region = region::client_region(size, bounds);
        }
        let region = pipeline.region;
        let sequence = pipeline.sequence + 1;
        let hdr_surface = frame.pixel_format() == SurfacePixelFormat::Rgba16Float;

        let mut outcome = None;
        if hdr_surface && pipeline.gate.is_enabled() {
            match self.write_frame(frame, region, ToneMapStrategy::GpuCompute, sequence) {
                Ok(result) => {
                    pipeline.gate.record_success();
                    outcome = Some((result, ToneMapStrategy::GpuCompute));
                }
                Err(err @ CaptureError::DeviceLost { .. }) => return Err(err),
                Err(err) => {
                    self.shared.transient_errors.fetch_add(1, Ordering::Relaxed);
                    if pipeline.gate.record_failure(&err) {
                        tracing::warn!(
                            reason = pipeline.gate.disabled_reason().unwrap_or_default(),
                            "GPU tone mapping disabled for this session, using CPU lookup table"
                        );
                        frame.release_gpu_tonemapper();
                    } else {
                        tracing::warn!(
                            consecutive_failures = pipeline.gate.consecutive_failures(),
                            "GPU tone mapping failed, falling back to CPU for this frame: {err}"
                        );
                    }
                }
            }
        }
        let (result, strategy) = match outcome {
            Some(done) => done,
            None => {
                let strategy = if hdr_surface {
                    ToneMapStrategy::CpuLut
                } else {
                    ToneMapStrategy::RawCopy
                };
                (self.write_frame(frame, region, strategy, sequence)?, strategy)
            }
        };

        match result {
            WriteOutcome::Published { .. } => {}
            WriteOutcome::NoFreeSlot => {
                self.shared.dropped_no_slot.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence, "frame dropped: every spare slot is pinned");
                return Ok(FrameOutcome::Discarded);
            }
            WriteOutcome::Rejected => return Ok(FrameOutcome::Discarded),
        }
        // A session stopped or restarted during the write does not count it.
        if !self.shared.is_current(self.generation) {
            return Ok(FrameOutcome::Discarded);
        }
        pipeline.sequence = sequence;
        self.shared
            .strategy
            .store(strategy.to_u8(), Ordering::Release);
        self.shared.frames_produced.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            sequence,
            strategy = strategy.as_str(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "frame produced"
        );
        Ok(FrameOutcome::Produced)
    }

    /// Reads `region` back with `strategy` and publishes it into the frame
    /// store. Device status is checked after the GPU work and before the
    /// slot is published.
    fn write_frame(
        &self,
        frame: &mut dyn ArrivedFrame,
        region: Region,
        strategy: ToneMapStrategy,
        sequence: u64,
    ) -> CaptureResult<WriteOutcome> {
        let started = Instant::now();
        let device = &self.device;
        let hdr = self.hdr;
        self.shared.frames.write(region.size(), |slot| {
            let stride = slot.stride();
            let sink: &mut SurfaceSink<'_> = &mut |mapped| {
                convert::convert_surface_to_bgra(
                    &mapped,
                    BgraTarget {
                        pixels: slot.as_mut_bgra_bytes(),
                        stride,
                    },
                )
                .map(|_| ())
            };
            match strategy {
                ToneMapStrategy::GpuCompute => frame.read_region_tonemapped(region, sink)?,
                ToneMapStrategy::CpuLut | ToneMapStrategy::RawCopy => {
                    frame.read_region(region, sink)?
                }
            }
            device.check_status()?;

            let metadata = &mut slot.metadata;
            metadata.sequence = sequence;
            metadata.capture_time = Some(started);
            metadata.conversion_duration = Some(started.elapsed());
            metadata.color_space = if hdr {
                ColorSpace::TonemappedHdr
            } else {
                ColorSpace::Srgb
            };
            metadata.strategy = strategy;
            Ok(())
        })
    }

    fn handle_error(&self, error: CaptureError) {
        if error.is_terminal() {
            self.shared.fail(self.generation, error);
            return;
        }
        self.shared.transient_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(generation = self.generation, "frame capture failed: {error}");
    }
}

impl FrameObserver for FrameProcessor {
    fn on_frame_arrived(&self, frame: &mut dyn ArrivedFrame) {
        if !self.shared.is_current(self.generation) {
            return;
        }
        let Some(_guard) = CallbackGuard::enter(&self.shared.in_callback) else {
            self.shared.dropped_reentrant.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("frame dropped: previous callback still running");
            return;
        };
        // `stop` may have run between the first check and taking the guard.
        if !self.shared.is_current(self.generation) {
            return;
        }

        match self.process(frame) {
            Ok(FrameOutcome::SkippedResize) => {
                self.shared.skipped_resize.fetch_add(1, Ordering::Relaxed);
            }
            Ok(FrameOutcome::Produced | FrameOutcome::Discarded) => {}
            Err(err) => {
                if err.is_terminal() {
                    frame.release_gpu_tonemapper();
                }
                self.handle_error(err);
            }
        }
    }

    fn on_closed(&self) {
        tracing::info!(window = %self.window.stable_id(), "capture item closed");
        self.shared.fail(self.generation, CaptureError::ItemClosed);
    }
}

/// A running capture of one window. Created by [`CaptureSession::start`];
/// [`stop`](Self::stop) tears it down.
pub struct CaptureSession {
    shared: Arc<SessionShared>,
    item: Option<Box<dyn CaptureItem>>,
    device: Option<SharedDevice>,
    window: WindowId,
    generation: u64,
}

impl CaptureSession {
    pub(crate) fn start(
        backend: &Arc<dyn CaptureBackend>,
        devices: &DeviceManager,
        shared: &Arc<SessionShared>,
        window: WindowId,
        options: CaptureOptions,
    ) -> CaptureResult<Self> {
        if window.is_null() {
            return Err(CaptureError::InvalidHandle(window.stable_id()));
        }
        backend.validate_window(window)?;

        let resolved = options.resolve(|| devices.hdr_enabled_for(window));
        let device = devices.acquire()?;
        let pixel_format = if resolved.hdr {
            SurfacePixelFormat::Rgba16Float
        } else {
            SurfacePixelFormat::Bgra8
        };
        let config = SourceConfig {
            capture_cursor: resolved.capture_cursor,
            border_required: resolved.border_required,
            ..SourceConfig::new(pixel_format)
        };
        let mut item = backend.create_capture_item(window, &device, &config)?;

        let initial_size = item.initial_size();
        let region = region::client_region(initial_size, backend.window_frame_bounds(window));
        let generation = shared.begin_session();
        let processor = Arc::new(FrameProcessor {
            shared: Arc::clone(shared),
            generation,
            window,
            backend: Arc::clone(backend),
            device: Arc::clone(&device),
            hdr: resolved.hdr,
            pipeline: Mutex::new(PipelineState {
                surface_size: initial_size,
                region,
                gate: GpuToneMapGate::new(resolved.gpu_tonemap),
                sequence: 0,
            }),
        });

        shared.set_state(SessionState::Capturing);
        if let Err(err) = item.start(processor) {
            shared.set_state(SessionState::Idle);
            item.stop();
            return Err(err);
        }

        tracing::info!(
            window = %window.stable_id(),
            generation,
            format = pixel_format.as_str(),
            gpu_tonemap = resolved.gpu_tonemap,
            width = initial_size.width,
            height = initial_size.height,
            "capture started"
        );
        Ok(Self {
            shared: Arc::clone(shared),
            item: Some(item),
            device: Some(device),
            window,
            generation,
        })
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Halts capture, waits up to [`STOP_CALLBACK_WAIT`] for an in-flight
    /// callback and releases GPU resources. Idempotent.
    pub fn stop(&mut self) {
        let Some(mut item) = self.item.take() else {
            return;
        };
        let was_current = self.shared.generation.load(Ordering::SeqCst) == self.generation;
        if was_current {
            self.shared.set_state(SessionState::Stopping);
        }
        if !self.shared.wait_for_callback(STOP_CALLBACK_WAIT) {
            tracing::warn!(
                generation = self.generation,
                "frame callback still running after {STOP_CALLBACK_WAIT:?}, stopping anyway"
            );
        }
        item.stop();
        if was_current {
            self.shared.frames.close_and_clear();
            self.shared.set_state(SessionState::Idle);
        }
        self.device = None;
        tracing::info!(generation = self.generation, "capture stopped");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Copies the latest frame out of the store, or `None`.
pub(crate) fn latest_frame(shared: &SessionShared) -> Option<Frame> {
    shared.frames.read().map(|guard| (*guard).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{ScreenRect, WindowFrameBounds};
    use crate::testing::{MockBackend, sdr_pixel};

    struct Harness {
        backend: Arc<MockBackend>,
        devices: DeviceManager,
        shared: Arc<SessionShared>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = MockBackend::new();
            Self {
                devices: DeviceManager::new(backend.clone()),
                backend,
                shared: Arc::new(SessionShared::new()),
            }
        }

        fn start(&self, options: CaptureOptions) -> CaptureResult<CaptureSession> {
            let backend: Arc<dyn CaptureBackend> = self.backend.clone();
            CaptureSession::start(
                &backend,
                &self.devices,
                &self.shared,
                MockBackend::window(),
                options,
            )
        }
    }

    fn hdr_options(gpu: bool) -> CaptureOptions {
        CaptureOptions {
            enable_hdr: Some(true),
            gpu_hdr_conversion: Some(gpu),
            ..CaptureOptions::default()
        }
    }

    #[test]
    fn options_resolve_against_probe() {
        let auto = CaptureOptions::default();
        assert!(auto.resolve(|| true).hdr);
        assert!(!auto.resolve(|| false).hdr);
        assert!(!auto.resolve(|| false).gpu_tonemap);

        let forced_sdr = CaptureOptions {
            enable_hdr: Some(false),
            ..CaptureOptions::default()
        };
        assert!(!forced_sdr.resolve(|| true).hdr);
        assert!(!hdr_options(false).resolve(|| false).gpu_tonemap);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: CaptureOptions =
            serde_json::from_str(r#"{"enable_hdr": true}"#).expect("valid options");
        assert_eq!(options.enable_hdr, Some(true));
        assert_eq!(options.gpu_hdr_conversion, None);
        assert!(!options.capture_cursor);
    }

    #[test]
    fn sdr_frame_crops_to_client_area() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(800, 600));
        h.backend.set_frame_bounds(Some(WindowFrameBounds {
            extended_frame: ScreenRect {
                left: 50,
                top: 50,
                right: 850,
                bottom: 650,
            },
            client: ScreenRect {
                left: 58,
                top: 81,
                right: 842,
                bottom: 642,
            },
            topmost: false,
        }));
        let _session = h.start(CaptureOptions::default())?;
        assert!(h.backend.deliver_frame(SurfaceSize::new(800, 600)));

        let frame = latest_frame(&h.shared).expect("frame produced");
        assert_eq!(frame.dimensions(), (784, 561));
        assert_eq!(&frame.as_bgra_bytes()[..4], &sdr_pixel(8, 31));
        let last_row = &frame.as_bgra_bytes()[frame.stride() * 560..];
        assert_eq!(&last_row[..4], &sdr_pixel(8, 591));
        assert_eq!(frame.metadata.sequence, 1);
        assert_eq!(frame.metadata.color_space, ColorSpace::Srgb);
        assert_eq!(frame.metadata.strategy, ToneMapStrategy::RawCopy);
        Ok(())
    }

    #[test]
    fn resize_skips_exactly_one_event() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(640, 480));
        let _session = h.start(CaptureOptions::default())?;

        h.backend.deliver_frame(SurfaceSize::new(640, 480));
        assert_eq!(h.shared.frame_count(), 1);

        h.backend.deliver_frame(SurfaceSize::new(1024, 768));
        assert_eq!(h.shared.frame_count(), 1);
        assert_eq!(h.shared.stats().skipped_resize, 1);
        assert_eq!(h.backend.pool_recreations(), 1);
        assert_eq!(
            latest_frame(&h.shared).expect("old frame kept").dimensions(),
            (640, 480)
        );

        h.backend.deliver_frame(SurfaceSize::new(1024, 768));
        assert_eq!(h.shared.frame_count(), 2);
        assert_eq!(
            latest_frame(&h.shared).expect("frame").dimensions(),
            (1024, 768)
        );
        Ok(())
    }

    #[test]
    fn reentrant_callback_is_dropped() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(64, 64));
        let _session = h.start(CaptureOptions::default())?;

        h.backend.reenter_on_next_read();
        h.backend.deliver_frame(SurfaceSize::new(64, 64));
        let stats = h.shared.stats();
        assert_eq!(stats.dropped_reentrant, 1);
        assert_eq!(stats.frames_produced, 1);
        Ok(())
    }

    #[test]
    fn device_loss_is_terminal() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(32, 32));
        let _session = h.start(CaptureOptions::default())?;
        h.backend.deliver_frame(SurfaceSize::new(32, 32));
        assert!(latest_frame(&h.shared).is_some());

        h.backend.lose_device_during_next_read("DXGI_ERROR_DEVICE_REMOVED");
        h.backend.deliver_frame(SurfaceSize::new(32, 32));
        assert!(!h.shared.is_capturing());
        assert!(latest_frame(&h.shared).is_none());
        assert!(matches!(
            h.shared.last_error(),
            Some(CaptureError::DeviceLost { .. })
        ));

        // Later events are ignored.
        assert!(h.backend.deliver_frame(SurfaceSize::new(32, 32)));
        assert_eq!(h.shared.frame_count(), 1);
        Ok(())
    }

    #[test]
    fn gpu_failures_trip_breaker_after_three() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(16, 16));
        h.backend.set_hdr_value(0.5);
        let _session = h.start(hdr_options(true))?;

        h.backend.fail_next_gpu_passes(3);
        for _ in 0..5 {
            h.backend.deliver_frame(SurfaceSize::new(16, 16));
        }
        assert_eq!(h.backend.gpu_calls(), 3);
        assert_eq!(h.backend.gpu_releases(), 1);
        let stats = h.shared.stats();
        assert_eq!(stats.frames_produced, 5);
        assert_eq!(stats.transient_errors, 3);
        assert_eq!(stats.strategy, Some(ToneMapStrategy::CpuLut));
        assert!(h.shared.is_capturing());
        Ok(())
    }

    #[test]
    fn gpu_recovers_before_breaker_trips() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(16, 16));
        let _session = h.start(hdr_options(true))?;

        h.backend.fail_next_gpu_passes(2);
        for _ in 0..4 {
            h.backend.deliver_frame(SurfaceSize::new(16, 16));
        }
        assert_eq!(h.backend.gpu_calls(), 4);
        assert_eq!(h.backend.gpu_releases(), 0);
        assert_eq!(h.shared.stats().strategy, Some(ToneMapStrategy::GpuCompute));
        Ok(())
    }

    #[test]
    fn shader_compile_failure_disables_gpu_immediately() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(8, 8));
        h.backend.fail_shader_compilation(true);
        let _session = h.start(hdr_options(true))?;

        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        assert_eq!(h.backend.gpu_calls(), 1);
        assert_eq!(h.shared.frame_count(), 2);
        Ok(())
    }

    #[test]
    fn cpu_and_gpu_paths_agree() -> CaptureResult<()> {
        for value in [0.0005f32, 0.18, 1.0, 11.2, 40.0] {
            let mut outputs = Vec::new();
            for gpu in [false, true] {
                let h = Harness::new();
                h.backend.set_surface_size(SurfaceSize::new(4, 4));
                h.backend.set_hdr_value(value);
                let _session = h.start(hdr_options(gpu))?;
                h.backend.deliver_frame(SurfaceSize::new(4, 4));
                let frame = latest_frame(&h.shared).expect("frame");
                assert_eq!(frame.metadata.color_space, ColorSpace::TonemappedHdr);
                outputs.push(frame.as_bgra_bytes()[..4].to_vec());
            }
            for channel in 0..3 {
                let diff = i16::from(outputs[0][channel]) - i16::from(outputs[1][channel]);
                assert!(diff.abs() <= 1, "value {value}: {outputs:?}");
            }
            assert_eq!(outputs[0][3], 255);
        }
        Ok(())
    }

    #[test]
    fn closed_item_ends_session() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(8, 8));
        let _session = h.start(CaptureOptions::default())?;
        h.backend.close_item();
        assert!(!h.shared.is_capturing());
        assert!(matches!(h.shared.last_error(), Some(CaptureError::ItemClosed)));
        Ok(())
    }

    #[test]
    fn stop_is_idempotent_and_restart_reinitializes() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(8, 8));
        let mut session = h.start(CaptureOptions::default())?;
        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        session.stop();
        session.stop();
        assert!(h.backend.item_stopped());
        assert!(!h.shared.is_capturing());
        assert!(latest_frame(&h.shared).is_none());
        assert!(!h.backend.deliver_frame(SurfaceSize::new(8, 8)));

        let _restarted = h.start(CaptureOptions::default())?;
        assert!(h.backend.item_started());
        assert_eq!(h.shared.frame_count(), 0);
        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        let frame = latest_frame(&h.shared).expect("frame after restart");
        assert_eq!(frame.metadata.sequence, 1);
        Ok(())
    }

    #[test]
    fn start_rejects_invalid_window_and_missing_device() {
        let h = Harness::new();
        let backend: Arc<dyn CaptureBackend> = h.backend.clone();
        let null = CaptureSession::start(
            &backend,
            &h.devices,
            &h.shared,
            WindowId::from_raw_handle(0),
            CaptureOptions::default(),
        );
        assert!(matches!(null, Err(CaptureError::InvalidHandle(_))));

        h.backend.set_window_alive(false);
        assert!(matches!(
            h.start(CaptureOptions::default()),
            Err(CaptureError::InvalidHandle(_))
        ));

        h.backend.set_window_alive(true);
        h.backend.fail_device_creation(true);
        assert!(matches!(
            h.start(CaptureOptions::default()),
            Err(CaptureError::DeviceCreation(_))
        ));
        assert!(!h.shared.is_capturing());
    }

    #[test]
    fn source_config_follows_options() -> CaptureResult<()> {
        let h = Harness::new();
        let _session = h.start(CaptureOptions {
            enable_hdr: Some(true),
            capture_cursor: true,
            ..CaptureOptions::default()
        })?;
        let config = h.backend.source_config().expect("item created");
        assert_eq!(config.pixel_format, SurfacePixelFormat::Rgba16Float);
        assert_eq!(config.buffer_count, 3);
        assert!(config.capture_cursor);
        assert!(!config.border_required);
        Ok(())
    }

    #[test]
    fn default_options_follow_monitor_hdr_state() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_surface_size(SurfaceSize::new(8, 8));
        h.backend.set_hdr_monitor(true);
        let mut session = h.start(CaptureOptions::default())?;
        let config = h.backend.source_config().expect("item created");
        assert_eq!(config.pixel_format, SurfacePixelFormat::Rgba16Float);

        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        let frame = latest_frame(&h.shared).expect("frame");
        assert_eq!(frame.metadata.color_space, ColorSpace::TonemappedHdr);
        assert_eq!(frame.metadata.strategy, ToneMapStrategy::GpuCompute);
        session.stop();

        h.backend.set_hdr_monitor(false);
        let _session = h.start(CaptureOptions::default())?;
        let config = h.backend.source_config().expect("item created");
        assert_eq!(config.pixel_format, SurfacePixelFormat::Bgra8);
        h.backend.deliver_frame(SurfaceSize::new(8, 8));
        let frame = latest_frame(&h.shared).expect("frame");
        assert_eq!(frame.metadata.color_space, ColorSpace::Srgb);
        Ok(())
    }

    #[test]
    fn explicit_sdr_overrides_hdr_monitor() -> CaptureResult<()> {
        let h = Harness::new();
        h.backend.set_hdr_monitor(true);
        let _session = h.start(CaptureOptions {
            enable_hdr: Some(false),
            ..CaptureOptions::default()
        })?;
        let config = h.backend.source_config().expect("item created");
        assert_eq!(config.pixel_format, SurfacePixelFormat::Bgra8);
        Ok(())
    }
}
