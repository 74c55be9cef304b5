use std::sync::{Arc, Mutex};

use crate::backend::{CaptureBackend, SharedDevice};
use crate::env_config;
use crate::error::{CaptureError, CaptureResult};
use crate::window::WindowId;

/// Owns the GPU device shared by a capture session and its tone-mapper.
///
/// The device is created lazily on the first [`acquire`](Self::acquire)
/// and reused until [`release`](Self::release). A lost device is never
/// recreated here; the owner stops the session and a later `start`
/// acquires a fresh one.
pub struct DeviceManager {
    backend: Arc<dyn CaptureBackend>,
    device: Mutex<Option<SharedDevice>>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            device: Mutex::new(None),
        }
    }

    fn slot(&self) -> CaptureResult<std::sync::MutexGuard<'_, Option<SharedDevice>>> {
        self.device.lock().map_err(|_| {
            CaptureError::Platform(anyhow::anyhow!("device manager mutex was poisoned"))
        })
    }

    pub fn acquire(&self) -> CaptureResult<SharedDevice> {
        let mut slot = self.slot()?;
        if let Some(device) = slot.as_ref() {
            if device.check_status().is_ok() {
                return Ok(Arc::clone(device));
            }
            tracing::info!("discarding lost GPU device before creating a new one");
            *slot = None;
        }

        let device = self.backend.create_device().map_err(|err| match err {
            CaptureError::DeviceCreation(_) => err,
            other => CaptureError::DeviceCreation(anyhow::Error::new(other)),
        })?;
        tracing::debug!(adapter = %device.description(), "created GPU device");
        *slot = Some(Arc::clone(&device));
        Ok(device)
    }

    /// `true` when a device is held and reports removal or hang.
    pub fn is_device_lost(&self) -> bool {
        self.slot()
            .ok()
            .and_then(|slot| slot.as_ref().map(|device| device.check_status().is_err()))
            .unwrap_or(false)
    }

    /// Drops this manager's reference. Other holders (the capture item,
    /// the GPU tone-mapper) keep the device alive until they drop theirs.
    pub fn release(&self) {
        if let Ok(mut slot) = self.slot() {
            *slot = None;
        }
    }

    /// Per-monitor HDR probe for the monitor hosting `window`.
    pub fn hdr_enabled_for(&self, window: WindowId) -> bool {
        if env_config::force_sdr() {
            return false;
        }
        self.backend.window_hdr_enabled(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    #[test]
    fn reuses_device_until_released() -> CaptureResult<()> {
        let backend = MockBackend::new();
        let manager = DeviceManager::new(backend.clone());
        let first = manager.acquire()?;
        let second = manager.acquire()?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.devices_created(), 1);

        manager.release();
        let _third = manager.acquire()?;
        assert_eq!(backend.devices_created(), 2);
        Ok(())
    }

    #[test]
    fn replaces_lost_device_on_next_acquire() -> CaptureResult<()> {
        let backend = MockBackend::new();
        let manager = DeviceManager::new(backend.clone());
        let _device = manager.acquire()?;
        backend.lose_device("DXGI_ERROR_DEVICE_HUNG");
        assert!(manager.is_device_lost());

        let _fresh = manager.acquire()?;
        assert_eq!(backend.devices_created(), 2);
        assert!(!manager.is_device_lost());
        Ok(())
    }

    #[test]
    fn creation_failure_maps_to_device_creation() {
        let backend = MockBackend::new();
        backend.fail_device_creation(true);
        let manager = DeviceManager::new(backend);
        let err = manager.acquire().err().expect("creation must fail");
        assert!(matches!(err, CaptureError::DeviceCreation(_)));
    }
}
