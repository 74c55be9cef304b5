use std::sync::Arc;

use crate::backend::CaptureBackend;
use crate::error::CaptureResult;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(target_os = "windows")]
pub(crate) fn build_backend() -> CaptureResult<Arc<dyn CaptureBackend>> {
    Ok(Arc::new(windows::WindowsBackend::new()?))
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn build_backend() -> CaptureResult<Arc<dyn CaptureBackend>> {
    Err(crate::error::CaptureError::BackendUnavailable(
        "window capture is only supported on Windows".into(),
    ))
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;
    use crate::error::{CaptureError, CaptureErrorClass};

    #[test]
    fn non_windows_reports_backend_unavailable() {
        let err = build_backend().err().expect("no backend off Windows");
        assert!(matches!(err, CaptureError::BackendUnavailable(_)));
        assert_eq!(err.class(), CaptureErrorClass::Unsupported);
    }
}
