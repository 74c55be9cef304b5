use std::ffi::c_void;

use windows::Win32::Foundation::{HWND, POINT, RECT};
use windows::Win32::Graphics::Dwm::{DWMWA_EXTENDED_FRAME_BOUNDS, DwmGetWindowAttribute};
use windows::Win32::Graphics::Gdi::ClientToScreen;
use windows::Win32::UI::WindowsAndMessaging::{
    GWL_EXSTYLE, GetClientRect, GetWindowLongPtrW, IsWindow, WS_EX_TOPMOST,
};

use crate::error::{CaptureError, CaptureResult};
use crate::region::{ScreenRect, WindowFrameBounds};
use crate::window::WindowId;

pub(crate) fn hwnd(window: WindowId) -> HWND {
    HWND(window.raw_handle() as *mut c_void)
}

pub(crate) fn validate(window: WindowId) -> CaptureResult<()> {
    if window.is_null() {
        return Err(CaptureError::InvalidHandle(format!(
            "window handle is null: {}",
            window.stable_id()
        )));
    }
    if !unsafe { IsWindow(hwnd(window)) }.as_bool() {
        return Err(CaptureError::InvalidHandle(format!(
            "window handle is not valid: {}",
            window.stable_id()
        )));
    }
    Ok(())
}

/// Extended frame bounds, client rectangle in screen space and the
/// always-on-top flag. `None` when DWM or the client query fails.
pub(crate) fn frame_bounds(window: WindowId) -> Option<WindowFrameBounds> {
    let hwnd = hwnd(window);

    let mut frame = RECT::default();
    unsafe {
        DwmGetWindowAttribute(
            hwnd,
            DWMWA_EXTENDED_FRAME_BOUNDS,
            &mut frame as *mut RECT as *mut c_void,
            std::mem::size_of::<RECT>() as u32,
        )
    }
    .ok()?;

    let mut client = RECT::default();
    unsafe { GetClientRect(hwnd, &mut client) }.ok()?;
    let mut origin = POINT {
        x: client.left,
        y: client.top,
    };
    if !unsafe { ClientToScreen(hwnd, &mut origin) }.as_bool() {
        return None;
    }

    let ex_style = unsafe { GetWindowLongPtrW(hwnd, GWL_EXSTYLE) } as u32;

    Some(WindowFrameBounds {
        extended_frame: ScreenRect {
            left: frame.left,
            top: frame.top,
            right: frame.right,
            bottom: frame.bottom,
        },
        client: ScreenRect {
            left: origin.x,
            top: origin.y,
            right: origin.x + (client.right - client.left),
            bottom: origin.y + (client.bottom - client.top),
        },
        topmost: ex_style & WS_EX_TOPMOST.0 != 0,
    })
}
