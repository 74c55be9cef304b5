use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_SDK_VERSION, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
    DXGI_ERROR_DRIVER_INTERNAL_ERROR, IDXGIDevice,
};
use windows::Win32::System::WinRT::Direct3D11::CreateDirect3D11DeviceFromDXGIDevice;
use windows::core::{HRESULT, Interface};

use crate::backend::GpuDevice;
use crate::error::{CaptureError, CaptureResult};

/// A hardware D3D11 device plus the WinRT wrapper the frame pool needs.
///
/// The immediate context is not thread-safe, so every use goes through
/// [`D3dDevice::context`].
#[derive(Clone)]
pub(crate) struct D3dDevice {
    device: ID3D11Device,
    context: Arc<Mutex<ID3D11DeviceContext>>,
    winrt: IDirect3DDevice,
    description: String,
}

// SAFETY: the device is created without D3D11_CREATE_DEVICE_SINGLETHREADED,
// which makes ID3D11Device free-threaded. The immediate context is only
// reached through the mutex.
unsafe impl Send for D3dDevice {}
unsafe impl Sync for D3dDevice {}

impl D3dDevice {
    /// Creates a device on the default hardware adapter. The free-threaded
    /// frame pool touches it from OS threads, so it must not be created
    /// single-threaded.
    pub(crate) fn create() -> CaptureResult<Self> {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        let feature_levels = [D3D_FEATURE_LEVEL_11_0];

        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&feature_levels),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .context("D3D11CreateDevice failed")
        .map_err(CaptureError::DeviceCreation)?;

        let device = device
            .context("D3D11CreateDevice did not return a device")
            .map_err(CaptureError::DeviceCreation)?;
        let context = context
            .context("D3D11CreateDevice did not return a device context")
            .map_err(CaptureError::DeviceCreation)?;

        let dxgi_device: IDXGIDevice = device
            .cast()
            .context("failed to cast ID3D11Device to IDXGIDevice")
            .map_err(CaptureError::DeviceCreation)?;
        let description = adapter_description(&dxgi_device);
        let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device) }
            .context("CreateDirect3D11DeviceFromDXGIDevice failed")
            .map_err(CaptureError::DeviceCreation)?;
        let winrt: IDirect3DDevice = inspectable
            .cast()
            .context("failed to cast IInspectable to IDirect3DDevice")
            .map_err(CaptureError::DeviceCreation)?;

        Ok(Self {
            device,
            context: Arc::new(Mutex::new(context)),
            winrt,
            description,
        })
    }

    pub(crate) fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub(crate) fn winrt(&self) -> &IDirect3DDevice {
        &self.winrt
    }

    pub(crate) fn context(&self) -> CaptureResult<MutexGuard<'_, ID3D11DeviceContext>> {
        self.context.lock().map_err(|_| {
            CaptureError::Platform(anyhow::anyhow!("device context mutex was poisoned"))
        })
    }

    /// Maps a failed D3D call to `DeviceLost` when the device is gone,
    /// otherwise to a platform error carrying `what`.
    pub(crate) fn classify(&self, error: windows::core::Error, what: &str) -> CaptureError {
        if let Err(lost) = self.check_status() {
            return lost;
        }
        if let Some(reason) = removal_reason(error.code()) {
            return CaptureError::device_lost(reason);
        }
        CaptureError::Platform(anyhow::Error::from(error).context(what.to_string()))
    }
}

impl GpuDevice for D3dDevice {
    fn check_status(&self) -> CaptureResult<()> {
        let hr = unsafe { self.device.GetDeviceRemovedReason() };
        match hr {
            Ok(()) => Ok(()),
            Err(error) => Err(CaptureError::device_lost(
                removal_reason(error.code())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("device removed ({:#010x})", error.code().0)),
            )),
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn removal_reason(code: HRESULT) -> Option<&'static str> {
    match code {
        DXGI_ERROR_DEVICE_REMOVED => Some("DXGI_ERROR_DEVICE_REMOVED"),
        DXGI_ERROR_DEVICE_HUNG => Some("DXGI_ERROR_DEVICE_HUNG"),
        DXGI_ERROR_DEVICE_RESET => Some("DXGI_ERROR_DEVICE_RESET"),
        DXGI_ERROR_DRIVER_INTERNAL_ERROR => Some("DXGI_ERROR_DRIVER_INTERNAL_ERROR"),
        _ => None,
    }
}

fn adapter_description(dxgi_device: &IDXGIDevice) -> String {
    let Ok(adapter) = (unsafe { dxgi_device.GetAdapter() }) else {
        return "unknown adapter".into();
    };
    let Ok(desc) = (unsafe { adapter.GetDesc() }) else {
        return "unknown adapter".into();
    };
    let len = desc
        .Description
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}
