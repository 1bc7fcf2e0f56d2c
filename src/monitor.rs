// Monitor enumeration and DPI-aware coordinate transforms.
//
// The process runs per-monitor DPI aware (v2); every coordinate
// exchanged with the OS click APIs is physical. Logical coordinates
// exist only for clients that need scale-independent math. Readers
// take an immutable snapshot; re-enumeration swaps the snapshot
// without invalidating outstanding copies.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use windows::core::BOOL;
use windows::Win32::Foundation::{HWND, LPARAM, POINT, RECT};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, GetMonitorInfoW, MonitorFromPoint, MonitorFromWindow, HDC, HMONITOR,
    MONITORINFO, MONITORINFOEXW, MONITOR_DEFAULTTONEAREST,
};
use windows::Win32::UI::HiDpi::{
    GetDpiForMonitor, SetProcessDpiAwarenessContext, MDT_EFFECTIVE_DPI,
    DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
};
use windows::Win32::UI::WindowsAndMessaging::GetClientRect;

const MONITORINFOF_PRIMARY: u32 = 1;
const BASE_DPI: f32 = 96.0;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Point in physical virtual-screen coordinates. May be negative on
/// monitors left of / above the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in physical virtual-screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.left && p.x < self.right && p.y >= self.top && p.y < self.bottom
    }

    fn from_win32(r: RECT) -> Self {
        Self {
            left: r.left,
            top: r.top,
            right: r.right,
            bottom: r.bottom,
        }
    }
}

/// Point in logical (scale-independent) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogicalPoint {
    pub x: f32,
    pub y: f32,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// One display: identity, physical bounds, and scale factor.
#[derive(Debug, Clone)]
pub struct Monitor {
    /// Handle stored as isize so snapshots cross threads.
    handle_ptr: isize,
    /// Device name (e.g. `\\.\DISPLAY1`).
    pub name: String,
    /// Physical bounds in virtual-screen coordinates. Non-overlapping
    /// across the snapshot.
    pub bounds: Rect,
    /// Effective DPI scale (1.0 = 96 dpi).
    pub scale: f32,
    pub is_primary: bool,
}

impl Monitor {
    pub fn handle(&self) -> HMONITOR {
        HMONITOR(self.handle_ptr as *mut _)
    }

    /// Physical → logical, relative to this monitor's origin.
    pub fn to_logical(&self, p: Point) -> LogicalPoint {
        LogicalPoint {
            x: self.bounds.left as f32 + (p.x - self.bounds.left) as f32 / self.scale,
            y: self.bounds.top as f32 + (p.y - self.bounds.top) as f32 / self.scale,
        }
    }

    /// Logical → physical, relative to this monitor's origin. Rounds
    /// to the nearest device pixel.
    pub fn to_physical(&self, p: LogicalPoint) -> Point {
        Point {
            x: self.bounds.left + ((p.x - self.bounds.left as f32) * self.scale).round() as i32,
            y: self.bounds.top + ((p.y - self.bounds.top as f32) * self.scale).round() as i32,
        }
    }
}

/// Enable per-monitor DPI awareness (v2).
///
/// Must run before any window or monitor query so the OS reports
/// physical pixels. Repeated calls are safe; failure means a host
/// already set an awareness context, which is fine.
pub fn enable_dpi_awareness() {
    unsafe {
        // SAFETY: best-effort process-wide mode switch, no pointers involved.
        let _ = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Snapshot-based monitor registry. `refresh()` on display-change
/// events; readers keep whatever snapshot they hold until the next
/// tick boundary.
pub struct MonitorRegistry {
    snapshot: Mutex<Arc<Vec<Monitor>>>,
}

impl MonitorRegistry {
    /// Enumerate displays and build the initial snapshot.
    pub fn new() -> Result<Self> {
        enable_dpi_awareness();
        let monitors = enumerate_monitors()?;
        Ok(Self {
            snapshot: Mutex::new(Arc::new(monitors)),
        })
    }

    /// Current snapshot, in system enumeration order.
    pub fn list_monitors(&self) -> Arc<Vec<Monitor>> {
        Arc::clone(&self.snapshot.lock().expect("registry mutex poisoned"))
    }

    /// Re-enumerate after a display-change event.
    pub fn refresh(&self) -> Result<()> {
        let monitors = enumerate_monitors()?;
        *self.snapshot.lock().expect("registry mutex poisoned") = Arc::new(monitors);
        Ok(())
    }

    /// Monitor containing (or nearest to) a physical point.
    pub fn monitor_for_point(&self, p: Point) -> Option<Monitor> {
        let hmonitor = unsafe {
            // SAFETY: MonitorFromPoint always returns a valid handle
            // with MONITOR_DEFAULTTONEAREST.
            MonitorFromPoint(POINT { x: p.x, y: p.y }, MONITOR_DEFAULTTONEAREST)
        };
        self.find_by_handle(hmonitor)
    }

    /// Monitor hosting (most of) a window.
    pub fn monitor_for_window(&self, hwnd: HWND) -> Option<Monitor> {
        let hmonitor = unsafe {
            // SAFETY: valid for any HWND; nearest monitor on failure.
            MonitorFromWindow(hwnd, MONITOR_DEFAULTTONEAREST)
        };
        self.find_by_handle(hmonitor)
    }

    fn find_by_handle(&self, hmonitor: HMONITOR) -> Option<Monitor> {
        let snap = self.list_monitors();
        snap.iter()
            .find(|m| m.handle_ptr == hmonitor.0 as isize)
            .cloned()
    }
}

/// Client area of a window in physical virtual-screen pixels.
pub fn window_client_rect(hwnd: HWND) -> Result<Rect> {
    unsafe {
        // SAFETY: both calls only read window state; hwnd validity is
        // checked by the calls themselves (they fail on dead windows).
        let mut client = RECT::default();
        if GetClientRect(hwnd, &mut client).is_err() {
            bail!("GetClientRect failed");
        }
        let mut origin = POINT { x: 0, y: 0 };
        if !windows::Win32::Graphics::Gdi::ClientToScreen(hwnd, &mut origin).as_bool() {
            bail!("ClientToScreen failed");
        }
        Ok(Rect {
            left: origin.x,
            top: origin.y,
            right: origin.x + client.right,
            bottom: origin.y + client.bottom,
        })
    }
}

// --- Internal enumeration ---

fn enumerate_monitors() -> Result<Vec<Monitor>> {
    unsafe {
        let mut monitors: Vec<Monitor> = Vec::new();
        let ok = EnumDisplayMonitors(
            Some(HDC::default()),
            None,
            Some(enum_monitor_proc),
            LPARAM(&mut monitors as *mut _ as isize),
        );
        if !ok.as_bool() {
            bail!("EnumDisplayMonitors failed");
        }
        if monitors.is_empty() {
            bail!("no monitors detected");
        }
        Ok(monitors)
    }
}

unsafe extern "system" fn enum_monitor_proc(
    hmonitor: HMONITOR,
    _: HDC,
    _: *mut RECT,
    lparam: LPARAM,
) -> BOOL {
    // SAFETY: lparam points to a Vec<Monitor> on the stack of
    // enumerate_monitors(); the callback runs synchronously on the
    // same thread for the duration of EnumDisplayMonitors.
    let monitors = &mut *(lparam.0 as *mut Vec<Monitor>);

    let mut info = MONITORINFOEXW {
        monitorInfo: MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFOEXW>() as u32,
            ..Default::default()
        },
        ..Default::default()
    };

    if GetMonitorInfoW(hmonitor, &mut info.monitorInfo as *mut _ as *mut _).as_bool() {
        let name = String::from_utf16_lossy(&info.szDevice)
            .trim_end_matches('\0')
            .to_string();

        let mut dpi_x = BASE_DPI as u32;
        let mut dpi_y = BASE_DPI as u32;
        if GetDpiForMonitor(hmonitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y).is_err() {
            dpi_x = BASE_DPI as u32;
        }

        monitors.push(Monitor {
            handle_ptr: hmonitor.0 as isize,
            name,
            bounds: Rect::from_win32(info.monitorInfo.rcMonitor),
            scale: dpi_x as f32 / BASE_DPI,
            is_primary: (info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY) != 0,
        });
    }

    BOOL(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_at(left: i32, top: i32, w: i32, h: i32, scale: f32) -> Monitor {
        Monitor {
            handle_ptr: 0,
            name: "\\\\.\\DISPLAY_TEST".into(),
            bounds: Rect {
                left,
                top,
                right: left + w,
                bottom: top + h,
            },
            scale,
            is_primary: left == 0 && top == 0,
        }
    }

    #[test]
    fn test_logical_physical_round_trip() {
        let m = monitor_at(-1920, 0, 1920, 1080, 1.5);
        let p = Point::new(-1820, 120);
        let logical = m.to_logical(p);
        let back = m.to_physical(logical);
        assert_eq!(back, p);
    }

    #[test]
    fn test_to_logical_negative_origin() {
        // Secondary monitor left of primary at 1.5x scale: 100 physical
        // pixels from the origin are 100 / 1.5 logical pixels.
        let m = monitor_at(-1920, 0, 1920, 1080, 1.5);
        let logical = m.to_logical(Point::new(-1920 + 300, 150));
        assert!((logical.x - (-1920.0 + 200.0)).abs() < 1e-3);
        assert!((logical.y - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_unit_scale_is_identity() {
        let m = monitor_at(0, 0, 2560, 1440, 1.0);
        let p = Point::new(1234, 987);
        let logical = m.to_logical(p);
        assert_eq!(m.to_physical(logical), p);
        assert_eq!(logical.x, 1234.0);
        assert_eq!(logical.y, 987.0);
    }

    #[test]
    fn test_rect_contains() {
        let r = Rect {
            left: -1920,
            top: 0,
            right: 0,
            bottom: 1080,
        };
        assert!(r.contains(Point::new(-1720, 220)));
        assert!(!r.contains(Point::new(0, 220)));
        assert!(!r.contains(Point::new(-1720, 1080)));
        assert_eq!(r.width(), 1920);
        assert_eq!(r.height(), 1080);
    }

    // Live enumeration: requires a desktop session.
    #[test]
    fn test_enumerate_monitors_live() {
        let registry = match MonitorRegistry::new() {
            Ok(r) => r,
            Err(_) => {
                println!("SKIPPED: no display available");
                return;
            }
        };
        let monitors = registry.list_monitors();
        assert!(!monitors.is_empty());
        assert_eq!(monitors.iter().filter(|m| m.is_primary).count(), 1);
        for m in monitors.iter() {
            assert!(m.bounds.width() > 0);
            assert!(m.bounds.height() > 0);
            assert!(m.scale >= 1.0);
        }
    }
}
