//! Client-area cropping.
//!
//! A captured window surface includes the non-client frame and, on
//! Windows 10+, an invisible resize border / drop shadow. [`Region`]
//! describes the client-area rectangle inside that surface so frames
//! contain only window content.

use crate::backend::SurfaceSize;

/// A rectangle in physical pixels relative to the captured surface.
/// `right` and `bottom` are exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Region {
    pub const fn full(size: SurfaceSize) -> Self {
        Self {
            left: 0,
            top: 0,
            right: size.width,
            bottom: size.height,
        }
    }

    pub const fn width(&self) -> u32 {
        self.right - self.left
    }

    pub const fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub const fn size(&self) -> SurfaceSize {
        SurfaceSize::new(self.width(), self.height())
    }

    /// `true` when the region lies fully inside a surface of `size`.
    pub const fn fits(&self, size: SurfaceSize) -> bool {
        self.left <= self.right
            && self.top <= self.bottom
            && self.right <= size.width
            && self.bottom <= size.height
    }
}

/// A screen-space rectangle as reported by the window manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScreenRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Geometry of a window queried from the OS at the time of a resize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowFrameBounds {
    /// Visible frame bounds in screen coordinates, excluding the drop
    /// shadow (`DWMWA_EXTENDED_FRAME_BOUNDS` on Windows).
    pub extended_frame: ScreenRect,
    /// Client area in screen coordinates.
    pub client: ScreenRect,
    /// Always-on-top windows whose frame bounds are not reliable enough
    /// to crop against.
    pub topmost: bool,
}

/// Computes the client-area crop for a captured surface.
///
/// Falls back to the full surface when `bounds` is unavailable, for
/// topmost windows, and when the computed rectangle would be empty.
pub fn client_region(surface: SurfaceSize, bounds: Option<WindowFrameBounds>) -> Region {
    let full = Region::full(surface);
    let Some(bounds) = bounds else {
        return full;
    };
    if bounds.topmost {
        return full;
    }

    let offset_x = i64::from(bounds.client.left) - i64::from(bounds.extended_frame.left);
    let offset_y = i64::from(bounds.client.top) - i64::from(bounds.extended_frame.top);
    let client_w = i64::from(bounds.client.right) - i64::from(bounds.client.left);
    let client_h = i64::from(bounds.client.bottom) - i64::from(bounds.client.top);
    if client_w <= 0 || client_h <= 0 {
        return full;
    }

    let surface_w = i64::from(surface.width);
    let surface_h = i64::from(surface.height);
    let left = offset_x.clamp(0, surface_w);
    let top = offset_y.clamp(0, surface_h);
    let right = (offset_x + client_w).clamp(left, surface_w);
    let bottom = (offset_y + client_h).clamp(top, surface_h);

    let region = Region {
        left: left as u32,
        top: top as u32,
        right: right as u32,
        bottom: bottom as u32,
    };
    if region.is_empty() { full } else { region }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(left: i32, top: i32, right: i32, bottom: i32) -> ScreenRect {
        ScreenRect {
            left,
            top,
            right,
            bottom,
        }
    }

    #[test]
    fn crops_title_bar_and_borders() {
        // 1000x800 visible frame at (100,100); 1px side borders and a 31px title bar.
        let bounds = WindowFrameBounds {
            extended_frame: rect(100, 100, 1100, 900),
            client: rect(101, 131, 1099, 899),
            topmost: false,
        };
        let region = client_region(SurfaceSize::new(1000, 800), Some(bounds));
        assert_eq!(
            region,
            Region {
                left: 1,
                top: 31,
                right: 999,
                bottom: 799
            }
        );
        assert_eq!(region.size(), SurfaceSize::new(998, 768));
    }

    #[test]
    fn clips_to_surface_when_client_overhangs() {
        let bounds = WindowFrameBounds {
            extended_frame: rect(0, 0, 640, 480),
            client: rect(8, 30, 700, 600),
            topmost: false,
        };
        let region = client_region(SurfaceSize::new(640, 480), Some(bounds));
        assert!(region.fits(SurfaceSize::new(640, 480)));
        assert_eq!(region.right, 640);
        assert_eq!(region.bottom, 480);
    }

    #[test]
    fn falls_back_to_full_surface() {
        let size = SurfaceSize::new(320, 240);
        assert_eq!(client_region(size, None), Region::full(size));

        let topmost = WindowFrameBounds {
            extended_frame: rect(0, 0, 320, 240),
            client: rect(4, 20, 316, 236),
            topmost: true,
        };
        assert_eq!(client_region(size, Some(topmost)), Region::full(size));

        let collapsed = WindowFrameBounds {
            extended_frame: rect(0, 0, 320, 240),
            client: rect(10, 10, 10, 10),
            topmost: false,
        };
        assert_eq!(client_region(size, Some(collapsed)), Region::full(size));

        let outside = WindowFrameBounds {
            extended_frame: rect(0, 0, 320, 240),
            client: rect(400, 300, 500, 400),
            topmost: false,
        };
        assert_eq!(client_region(size, Some(outside)), Region::full(size));
    }
}
