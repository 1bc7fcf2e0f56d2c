// Non-activating click dispatch via window messages.
//
// The click point is computed in physical screen coordinates from the
// capture-frame match point, optionally verified against the target's
// current client rect (the window may have moved since the frame was
// captured), converted to client-relative coordinates, and delivered
// as WM_LBUTTONDOWN / WM_LBUTTONUP. The system cursor never moves and
// no focus change is induced. A per-handle cooldown refuses rapid
// re-clicks silently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use windows::Win32::Foundation::{HWND, LPARAM, POINT, WPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    IsWindow, PostMessageW, SendMessageTimeoutW, SMTO_ABORTIFHUNG, WM_LBUTTONDOWN, WM_LBUTTONUP,
};

use crate::error::ClickError;
use crate::monitor::{window_client_rect, Point, Rect};

/// wParam key-state flag for a pressed left button (WinUser.h).
const MK_LBUTTON: usize = 0x0001;

/// Guarded-send expiry; beyond this the target is presumed hung.
const SEND_TIMEOUT_MS: u32 = 500;

/// Where a click landed, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickPoint {
    /// Physical screen coordinates.
    pub screen: Point,
    /// Client-relative coordinates actually encoded in the messages.
    pub client: Point,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Refuse clicks to the same handle within this window.
    pub cooldown: Duration,
    /// Verify the point is still inside the client rect before posting.
    pub verify_bounds: bool,
    /// Use SendMessageTimeout instead of PostMessage for hang
    /// protection.
    pub hang_guard: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            verify_bounds: true,
            hang_guard: false,
        }
    }
}

/// Per-handle cooldown ledger.
#[derive(Default)]
struct CooldownGate {
    last_click: HashMap<isize, Instant>,
}

impl CooldownGate {
    fn ready(&self, handle: isize, cooldown: Duration, now: Instant) -> bool {
        match self.last_click.get(&handle) {
            Some(&last) => now.duration_since(last) >= cooldown,
            None => true,
        }
    }

    fn note(&mut self, handle: isize, now: Instant) {
        self.last_click.insert(handle, now);
    }
}

/// Screen point for a match: client origin + frame point + offset.
/// Valid because captured frames are clipped to the client content and
/// both sides are physical pixels.
fn screen_point(client: Rect, frame_point: (i32, i32), offset: [i32; 2]) -> Point {
    Point::new(
        client.left + frame_point.0 + offset[0],
        client.top + frame_point.1 + offset[1],
    )
}

pub struct ClickDispatcher {
    opts: DispatchOptions,
    gate: CooldownGate,
}

impl ClickDispatcher {
    pub fn new(opts: DispatchOptions) -> Self {
        Self {
            opts,
            gate: CooldownGate::default(),
        }
    }

    /// Dispatch a left click at `frame_point` (capture-frame
    /// coordinates) inside `hwnd`'s client area.
    pub fn dispatch(
        &mut self,
        hwnd: HWND,
        frame_point: (i32, i32),
        click_offset: [i32; 2],
    ) -> Result<ClickPoint, ClickError> {
        let handle = hwnd.0 as isize;
        let now = Instant::now();

        if !self.gate.ready(handle, self.opts.cooldown, now) {
            debug!(handle, "click refused, cooldown active");
            return Err(ClickError::Cooling);
        }

        // SAFETY: IsWindow reads handle-table state only.
        if !unsafe { IsWindow(Some(hwnd)).as_bool() } {
            return Err(ClickError::WindowGone);
        }

        let client = window_client_rect(hwnd).map_err(|_| ClickError::WindowGone)?;
        let screen = screen_point(client, frame_point, click_offset);

        if self.opts.verify_bounds && !client.contains(screen) {
            return Err(ClickError::OutOfBounds {
                x: screen.x,
                y: screen.y,
            });
        }

        // Posted mouse messages expect client-relative coordinates.
        let client_point = Point::new(screen.x - client.left, screen.y - client.top);
        let lparam = LPARAM((((client_point.y as u32) << 16) | (client_point.x as u32 & 0xFFFF)) as isize);

        self.send(hwnd, WM_LBUTTONDOWN, WPARAM(MK_LBUTTON), lparam)?;
        self.send(hwnd, WM_LBUTTONUP, WPARAM(0), lparam)?;

        self.gate.note(handle, now);
        info!(
            handle,
            screen_x = screen.x,
            screen_y = screen.y,
            "click dispatched"
        );
        Ok(ClickPoint {
            screen,
            client: client_point,
        })
    }

    fn send(&self, hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Result<(), ClickError> {
        if self.opts.hang_guard {
            // SAFETY: guarded send; SMTO_ABORTIFHUNG + timeout bounds a
            // hung target.
            let result = unsafe {
                SendMessageTimeoutW(
                    hwnd,
                    msg,
                    wparam,
                    lparam,
                    SMTO_ABORTIFHUNG,
                    SEND_TIMEOUT_MS,
                    None,
                )
            };
            if result.0 == 0 {
                return Err(ClickError::PostFailed(format!(
                    "SendMessageTimeout(0x{msg:04X}) expired after {SEND_TIMEOUT_MS}ms"
                )));
            }
            Ok(())
        } else {
            // SAFETY: PostMessage never blocks on the target.
            unsafe {
                PostMessageW(Some(hwnd), msg, wparam, lparam)
                    .map_err(|e| ClickError::PostFailed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_point_multi_monitor_offset() {
        // Monitor 2 at virtual origin (-1920, 0): a window whose client
        // top-left is physical (-1820, 120), match at frame (100, 100).
        let client = Rect {
            left: -1820,
            top: 120,
            right: -300,
            bottom: 1000,
        };
        let p = screen_point(client, (100, 100), [0, 0]);
        assert_eq!(p, Point::new(-1720, 220));
        assert!(client.contains(p));
    }

    #[test]
    fn test_screen_point_applies_click_offset() {
        let client = Rect {
            left: 10,
            top: 20,
            right: 800,
            bottom: 600,
        };
        let p = screen_point(client, (50, 60), [5, -8]);
        assert_eq!(p, Point::new(65, 72));
    }

    #[test]
    fn test_out_of_bounds_detection() {
        let client = Rect {
            left: 0,
            top: 0,
            right: 100,
            bottom: 100,
        };
        // The window shrank since the frame was captured.
        let p = screen_point(client, (150, 40), [0, 0]);
        assert!(!client.contains(p));
    }

    #[test]
    fn test_cooldown_gate_refuses_within_window() {
        let mut gate = CooldownGate::default();
        let cooldown = Duration::from_secs(5);
        let t0 = Instant::now();

        assert!(gate.ready(1, cooldown, t0));
        gate.note(1, t0);
        assert!(!gate.ready(1, cooldown, t0 + Duration::from_secs(3)));
        assert!(gate.ready(1, cooldown, t0 + Duration::from_secs(5)));
        // Independent per handle.
        assert!(gate.ready(2, cooldown, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_dispatch_to_dead_window_fails() {
        let mut dispatcher = ClickDispatcher::new(DispatchOptions::default());
        // Odd handle values are never live windows.
        let result = dispatcher.dispatch(HWND(0x3 as *mut _), (10, 10), [0, 0]);
        assert!(matches!(result, Err(ClickError::WindowGone)));
    }
}
