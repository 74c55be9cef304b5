use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{self, CaptureBackend};
use crate::capture_session::{self, CaptureOptions, CaptureSession, CaptureStats, SessionShared};
use crate::device::DeviceManager;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{Frame, FrameData};
use crate::triple_buffer::ReadGuard;
use crate::window::WindowId;

const NO_PIN: u8 = u8::MAX;

/// Captures one window at a time and hands out the latest tone-mapped
/// BGRA8 frame.
///
/// `start`/`stop` serialize on an internal lock. Frame reads
/// ([`capture`](Self::capture), [`try_get_frame_data`](Self::try_get_frame_data),
/// [`read_latest`](Self::read_latest)) are lock-free and never wait on the
/// capture thread.
pub struct WindowCapturer {
    backend: Arc<dyn CaptureBackend>,
    devices: DeviceManager,
    shared: Arc<SessionShared>,
    session: Mutex<Option<CaptureSession>>,
    /// Slot pinned by `try_get_frame_data` until `release_frame`.
    pinned: AtomicU8,
}

/// A borrowed view of the latest frame. The producer skips the slot until
/// the guard is dropped.
pub struct FrameGuard<'a> {
    inner: ReadGuard<'a>,
}

impl Deref for FrameGuard<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.inner
    }
}

impl WindowCapturer {
    /// Uses the platform backend. Fails with `BackendUnavailable` on
    /// platforms without window capture.
    pub fn new() -> CaptureResult<Self> {
        Ok(Self::with_backend(backend::default_backend()?))
    }

    pub fn with_backend(backend: Arc<dyn CaptureBackend>) -> Self {
        // Build the LUT and conversion pool up front so the first HDR frame
        // doesn't pay for them on the capture thread.
        crate::convert::warmup();
        Self {
            devices: DeviceManager::new(Arc::clone(&backend)),
            backend,
            shared: Arc::new(SessionShared::new()),
            session: Mutex::new(None),
            pinned: AtomicU8::new(NO_PIN),
        }
    }

    fn session_slot(&self) -> CaptureResult<MutexGuard<'_, Option<CaptureSession>>> {
        self.session.lock().map_err(|_| {
            CaptureError::Platform(anyhow::anyhow!("capture control mutex was poisoned"))
        })
    }

    /// Begins capturing `window`.
    ///
    /// Fails with `AlreadyCapturing` while a session is running. A
    /// session that ended on its own (device loss, window closed) is torn
    /// down and replaced.
    pub fn start(&self, window: WindowId, options: CaptureOptions) -> CaptureResult<()> {
        let mut slot = self.session_slot()?;
        if slot.is_some() && self.shared.is_capturing() {
            return Err(CaptureError::AlreadyCapturing);
        }
        if let Some(mut stale) = slot.take() {
            stale.stop();
        }
        // A lost device must not be handed to the new session.
        if self.devices.is_device_lost() {
            self.devices.release();
        }
        let session =
            CaptureSession::start(&self.backend, &self.devices, &self.shared, window, options)?;
        *slot = Some(session);
        Ok(())
    }

    /// Stops capture and releases GPU resources. Safe to call repeatedly
    /// and when nothing is running.
    pub fn stop(&self) {
        let stale = match self.session_slot() {
            Ok(mut slot) => slot.take(),
            Err(err) => {
                tracing::warn!("stop: {err}");
                None
            }
        };
        if let Some(mut session) = stale {
            session.stop();
        }
        self.devices.release();
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing()
    }

    /// Frames produced since the last `start`.
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count()
    }

    /// The error that ended the last session on its own, if any.
    pub fn last_error(&self) -> Option<CaptureError> {
        self.shared.last_error()
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats()
    }

    /// An owned copy of the latest frame, or `None` when no frame is
    /// available.
    pub fn capture(&self) -> Option<Frame> {
        capture_session::latest_frame(&self.shared)
    }

    /// Copies the latest frame into `dst`, reusing its allocation. Returns
    /// `false` when no frame is available.
    pub fn capture_into(&self, dst: &mut Frame) -> bool {
        match self.shared.frames.read() {
            Some(guard) => {
                guard.clone_into_frame(dst);
                true
            }
            None => false,
        }
    }

    /// Borrows the latest frame without copying.
    pub fn read_latest(&self) -> Option<FrameGuard<'_>> {
        self.shared.frames.read().map(|inner| FrameGuard { inner })
    }

    /// Pins the latest frame and returns a raw view of it. The view stays
    /// valid until [`release_frame`](Self::release_frame). Calling this
    /// again before releasing returns the same frame.
    pub fn try_get_frame_data(&self) -> Option<FrameData> {
        let pinned = self.pinned.load(Ordering::Acquire);
        if pinned != NO_PIN {
            return Some(self.frame_data(pinned));
        }

        let slot = self.shared.frames.acquire()?;
        match self
            .pinned
            .compare_exchange(NO_PIN, slot, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(self.frame_data(slot)),
            Err(current) => {
                // Another thread pinned first; share its slot.
                if let Err(err) = self.shared.frames.release(slot) {
                    tracing::warn!("failed to unpin duplicate frame slot: {err}");
                }
                Some(self.frame_data(current))
            }
        }
    }

    fn frame_data(&self, slot: u8) -> FrameData {
        // SAFETY: `slot` is pinned in `self.pinned` and stays pinned until
        // `release_frame`.
        let frame = unsafe { self.shared.frames.slot(slot) };
        FrameData {
            ptr: frame.as_bgra_bytes().as_ptr(),
            width: frame.width(),
            height: frame.height(),
            stride: frame.stride(),
            sequence: frame.metadata.sequence,
        }
    }

    /// Unpins the frame returned by `try_get_frame_data`. No-op when
    /// nothing is pinned.
    pub fn release_frame(&self) {
        let slot = self.pinned.swap(NO_PIN, Ordering::AcqRel);
        if slot == NO_PIN {
            return;
        }
        if let Err(err) = self.shared.frames.release(slot) {
            tracing::warn!("release_frame: {err}");
        }
    }
}

impl Drop for WindowCapturer {
    fn drop(&mut self) {
        self.release_frame();
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SurfaceSize;
    use crate::testing::MockBackend;

    fn capturer() -> (Arc<MockBackend>, WindowCapturer) {
        let backend = MockBackend::new();
        let capturer = WindowCapturer::with_backend(backend.clone());
        (backend, capturer)
    }

    #[test]
    fn full_hd_sdr_window_yields_full_hd_frame() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        assert!(capturer.capture().is_none());

        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        assert!(capturer.is_capturing());
        backend.deliver_frame(SurfaceSize::new(1920, 1080));

        let frame = capturer.capture().expect("first frame");
        assert_eq!(frame.dimensions(), (1920, 1080));
        assert_eq!(frame.stride(), 7680);
        assert_eq!(frame.as_bgra_bytes().len(), 7680 * 1080);
        assert_eq!(capturer.frame_count(), 1);
        Ok(())
    }

    #[test]
    fn second_start_is_rejected_while_running() -> CaptureResult<()> {
        let (_backend, capturer) = capturer();
        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        assert!(matches!(
            capturer.start(MockBackend::window(), CaptureOptions::default()),
            Err(CaptureError::AlreadyCapturing)
        ));
        Ok(())
    }

    #[test]
    fn zero_copy_view_survives_new_frames() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        backend.set_surface_size(SurfaceSize::new(8, 4));
        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        backend.deliver_frame(SurfaceSize::new(8, 4));

        let data = capturer.try_get_frame_data().expect("frame pinned");
        assert_eq!((data.width, data.height, data.stride), (8, 4, 32));
        // SAFETY: released at the end of the test.
        let before = unsafe { data.as_slice() }.to_vec();

        for _ in 0..6 {
            backend.deliver_frame(SurfaceSize::new(8, 4));
        }
        let again = capturer.try_get_frame_data().expect("still pinned");
        assert_eq!(again.ptr, data.ptr);
        assert_eq!(again.sequence, 1);
        assert_eq!(unsafe { data.as_slice() }, &before[..]);

        capturer.release_frame();
        capturer.release_frame();
        let latest = capturer.try_get_frame_data().expect("latest pinned");
        assert_eq!(latest.sequence, 7);
        capturer.release_frame();
        Ok(())
    }

    #[test]
    fn capture_returns_newest_frame_while_zero_copy_view_is_held() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        backend.set_surface_size(SurfaceSize::new(8, 4));
        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        backend.deliver_frame(SurfaceSize::new(8, 4));
        let held = capturer.try_get_frame_data().expect("frame pinned");
        assert_eq!(held.sequence, 1);

        for _ in 0..6 {
            backend.deliver_frame(SurfaceSize::new(8, 4));
        }
        let frame = capturer.capture().expect("latest frame");
        assert_eq!(frame.metadata.sequence, 7);
        assert_eq!(capturer.frame_count(), 7);
        assert_eq!(capturer.read_latest().expect("frame").metadata.sequence, 7);
        assert_eq!(capturer.try_get_frame_data().expect("still pinned").sequence, 1);

        capturer.release_frame();
        Ok(())
    }

    #[test]
    fn device_removed_stops_capture_until_restart() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        backend.set_surface_size(SurfaceSize::new(16, 16));
        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        backend.deliver_frame(SurfaceSize::new(16, 16));
        assert!(capturer.capture().is_some());

        backend.lose_device("DXGI_ERROR_DEVICE_REMOVED");
        backend.deliver_frame(SurfaceSize::new(16, 16));
        assert!(!capturer.is_capturing());
        assert!(capturer.capture().is_none());
        assert!(capturer.try_get_frame_data().is_none());
        assert!(matches!(
            capturer.last_error(),
            Some(CaptureError::DeviceLost { .. })
        ));

        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        assert_eq!(backend.devices_created(), 2);
        assert!(capturer.last_error().is_none());
        backend.deliver_frame(SurfaceSize::new(16, 16));
        assert!(capturer.capture().is_some());
        Ok(())
    }

    #[test]
    fn repeated_stop_converges() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        capturer.stop();
        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        backend.deliver_frame(SurfaceSize::new(1920, 1080));
        capturer.stop();
        capturer.stop();
        assert!(!capturer.is_capturing());
        assert!(capturer.capture().is_none());

        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        assert!(capturer.is_capturing());
        assert_eq!(capturer.frame_count(), 0);
        Ok(())
    }

    #[test]
    fn capture_into_reuses_buffer() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        backend.set_surface_size(SurfaceSize::new(4, 4));
        let mut frame = Frame::empty();
        assert!(!capturer.capture_into(&mut frame));

        capturer.start(MockBackend::window(), CaptureOptions::default())?;
        backend.deliver_frame(SurfaceSize::new(4, 4));
        assert!(capturer.capture_into(&mut frame));
        assert_eq!(frame.dimensions(), (4, 4));

        let guard = capturer.read_latest().expect("frame");
        assert_eq!(guard.as_bgra_bytes(), frame.as_bgra_bytes());
        Ok(())
    }

    #[test]
    fn concurrent_consumers_while_producing() -> CaptureResult<()> {
        let (backend, capturer) = capturer();
        backend.set_surface_size(SurfaceSize::new(32, 32));
        capturer.start(MockBackend::window(), CaptureOptions::default())?;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..300 {
                    backend.deliver_frame(SurfaceSize::new(32, 32));
                }
            });
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..300 {
                        if let Some(frame) = capturer.capture() {
                            assert_eq!(frame.dimensions(), (32, 32));
                            assert_eq!(frame.as_bgra_bytes().len(), 32 * 32 * 4);
                        }
                    }
                });
            }
        });
        let stats = capturer.stats();
        assert!(stats.frames_produced > 0);
        assert_eq!(stats.frames_produced + stats.dropped_no_slot, 300);
        Ok(())
    }
}
