use anyhow::Context;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx, CoUninitialize};

use crate::error::{CaptureError, CaptureResult};

/// Keeps the calling thread in the multithreaded apartment while a capture
/// item is alive.
///
/// A thread that already joined an STA keeps it; the guard then leaves
/// COM untouched on drop.
pub(crate) struct ApartmentGuard {
    owns_init: bool,
}

impl ApartmentGuard {
    pub(crate) fn enter_mta() -> CaptureResult<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            tracing::debug!("thread already in a single-threaded apartment");
            return Ok(Self { owns_init: false });
        }
        hr.ok()
            .context("CoInitializeEx(COINIT_MULTITHREADED) failed")
            .map_err(CaptureError::Platform)?;
        Ok(Self { owns_init: true })
    }
}

impl Drop for ApartmentGuard {
    fn drop(&mut self) {
        if self.owns_init {
            unsafe { CoUninitialize() };
        }
    }
}
