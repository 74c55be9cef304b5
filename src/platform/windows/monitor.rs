use anyhow::Context;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020, DXGI_COLOR_SPACE_RGB_STUDIO_G2084_NONE_P2020,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, IDXGIFactory1, IDXGIOutput, IDXGIOutput6,
};
use windows::Win32::Graphics::Gdi::{HMONITOR, MONITOR_DEFAULTTONEAREST, MonitorFromWindow};
use windows::core::Interface;

use crate::error::{CaptureError, CaptureResult};

/// Whether the monitor that hosts most of `hwnd` is running in HDR
/// (PQ / BT.2020) mode.
pub(crate) fn window_hdr_enabled(hwnd: HWND) -> CaptureResult<bool> {
    let monitor = unsafe { MonitorFromWindow(hwnd, MONITOR_DEFAULTTONEAREST) };
    if monitor.is_invalid() {
        return Ok(false);
    }
    match find_output(monitor)? {
        Some(output) => Ok(output_is_hdr(&output)),
        None => Ok(false),
    }
}

fn find_output(monitor: HMONITOR) -> CaptureResult<Option<IDXGIOutput>> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
        .context("CreateDXGIFactory1 failed")
        .map_err(CaptureError::Platform)?;

    let mut adapter_idx = 0u32;
    loop {
        let adapter = match unsafe { factory.EnumAdapters1(adapter_idx) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => return Ok(None),
            Err(e) => {
                return Err(CaptureError::Platform(
                    anyhow::Error::from(e).context(format!("EnumAdapters1({adapter_idx}) failed")),
                ));
            }
        };

        let mut output_idx = 0u32;
        loop {
            let output = match unsafe { adapter.EnumOutputs(output_idx) } {
                Ok(output) => output,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => {
                    return Err(CaptureError::Platform(anyhow::Error::from(e).context(
                        format!("EnumOutputs({output_idx}) on adapter {adapter_idx} failed"),
                    )));
                }
            };
            let desc = unsafe { output.GetDesc() }
                .context("IDXGIOutput::GetDesc failed")
                .map_err(CaptureError::Platform)?;
            if desc.Monitor == monitor {
                return Ok(Some(output));
            }
            output_idx += 1;
        }

        adapter_idx += 1;
    }
}

fn output_is_hdr(output: &IDXGIOutput) -> bool {
    let Ok(output6) = output.cast::<IDXGIOutput6>() else {
        return false;
    };
    let Ok(desc1) = (unsafe { output6.GetDesc1() }) else {
        return false;
    };
    matches!(
        desc1.ColorSpace,
        DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020 | DXGI_COLOR_SPACE_RGB_STUDIO_G2084_NONE_P2020
    )
}
