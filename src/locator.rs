// Target window resolution: explicit handle, title pattern, or owning
// process. Resolution never activates or raises windows; it yields at
// most one handle per tick, preferring the topmost visible
// non-minimized candidate (EnumWindows order is z-order, so stable
// sorting keeps that tie-break for free).

use std::collections::{HashMap, HashSet};

use windows::core::BOOL;
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, LPARAM};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetForegroundWindow, GetWindowLongPtrW, GetWindowTextLengthW, GetWindowTextW,
    GetWindowThreadProcessId, IsIconic, IsWindow, IsWindowVisible, GWL_EXSTYLE, WS_EX_TOOLWINDOW,
};

use crate::error::LocateError;
use crate::monitor::{window_client_rect, Rect};

// ---------------------------------------------------------------------------
// Target identity
// ---------------------------------------------------------------------------

/// Stable identity of the window to capture and click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowTarget {
    /// Explicit handle, validated as a live top-level window.
    Handle(isize),
    /// Case-sensitive title pattern; substring match when `partial`.
    Title { pattern: String, partial: bool },
    /// Executable image name (`Code.exe`) or full path.
    Process(String),
}

/// RAII guard for kernel handles opened during resolution.
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        // SAFETY: self.0 is a live handle we opened; closed exactly once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a target to a live top-level window.
pub fn resolve(target: &WindowTarget) -> Result<HWND, LocateError> {
    match target {
        WindowTarget::Handle(raw) => {
            let hwnd = HWND(*raw as *mut core::ffi::c_void);
            // SAFETY: IsWindow only reads handle-table state.
            let live = unsafe { IsWindow(Some(hwnd)).as_bool() };
            if live {
                Ok(hwnd)
            } else {
                Err(LocateError::Stale)
            }
        }
        WindowTarget::Title { pattern, partial } => {
            let candidates = enumerate_candidates(|c| {
                if *partial {
                    c.title.contains(pattern.as_str())
                } else {
                    c.title == *pattern
                }
            });
            pick_best(candidates)
        }
        WindowTarget::Process(name) => {
            let wants_path = name.contains('\\') || name.contains('/');
            if wants_path {
                let target_path = name.to_lowercase().replace('/', "\\");
                let mut path_cache: HashMap<u32, Option<String>> = HashMap::new();
                let candidates = enumerate_candidates(|c| {
                    let path = path_cache
                        .entry(c.pid)
                        .or_insert_with(|| process_image_path(c.pid));
                    path.as_deref()
                        .is_some_and(|p| p.to_lowercase() == target_path)
                });
                pick_best(candidates)
            } else {
                let pids = pids_for_process(name);
                if pids.is_empty() {
                    return Err(LocateError::NotFound);
                }
                let candidates = enumerate_candidates(|c| pids.contains(&c.pid));
                pick_best(candidates)
            }
        }
    }
}

/// Current foreground window, if any.
pub fn foreground_handle() -> Option<HWND> {
    // SAFETY: returns null when no window has the foreground.
    let hwnd = unsafe { GetForegroundWindow() };
    if hwnd.0.is_null() {
        None
    } else {
        Some(hwnd)
    }
}

/// Image file name (e.g. `Code.exe`) of the process owning the
/// foreground window.
pub fn foreground_process() -> Option<String> {
    let hwnd = foreground_handle()?;
    let mut pid = 0u32;
    // SAFETY: GetWindowThreadProcessId reads window state only.
    unsafe {
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
    }
    if pid == 0 {
        return None;
    }
    let path = process_image_path(pid)?;
    path.rsplit('\\').next().map(str::to_string)
}

/// Client area of a resolved window in physical pixels.
pub fn client_rect(hwnd: HWND) -> Result<Rect, LocateError> {
    // SAFETY: IsWindow only reads handle-table state.
    if !unsafe { IsWindow(Some(hwnd)).as_bool() } {
        return Err(LocateError::Stale);
    }
    window_client_rect(hwnd).map_err(|_| LocateError::Stale)
}

// --- Phase 1: PID collection (Toolhelp snapshot) ---

/// PIDs whose executable name matches, case-insensitively.
fn pids_for_process(process: &str) -> HashSet<u32> {
    let target = process.to_lowercase();
    let mut pids = HashSet::new();

    unsafe {
        // SAFETY: snapshot handle is closed by the guard on every path.
        let snapshot = match CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) {
            Ok(s) => s,
            Err(_) => return pids,
        };
        let _guard = HandleGuard(snapshot);

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                let name = String::from_utf16_lossy(&entry.szExeFile)
                    .trim_end_matches('\0')
                    .to_lowercase();
                if name == target {
                    pids.insert(entry.th32ProcessID);
                }
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
    }

    pids
}

/// Full image path of a process, or None when access is denied.
fn process_image_path(pid: u32) -> Option<String> {
    unsafe {
        // SAFETY: PROCESS_QUERY_LIMITED_INFORMATION succeeds for most
        // processes without elevation; handle is closed by the guard.
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
        let _guard = HandleGuard(handle);

        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            windows::core::PWSTR(buf.as_mut_ptr()),
            &mut len,
        )
        .ok()?;
        Some(String::from_utf16_lossy(&buf[..len as usize]))
    }
}

// --- Phase 2: candidate enumeration and ranking ---

struct Candidate {
    hwnd: HWND,
    pid: u32,
    title: String,
    visible: bool,
    minimized: bool,
    tool: bool,
}

struct EnumCtx {
    candidates: Vec<Candidate>,
}

/// Enumerate top-level windows (z-order, topmost first) and keep those
/// accepted by `filter`.
fn enumerate_candidates(mut filter: impl FnMut(&Candidate) -> bool) -> Vec<Candidate> {
    let mut ctx = EnumCtx {
        candidates: Vec::new(),
    };
    unsafe {
        // SAFETY: ctx lives on this stack frame for the whole
        // synchronous EnumWindows call.
        let _ = EnumWindows(Some(enum_window_proc), LPARAM(&mut ctx as *mut _ as isize));
    }
    ctx.candidates.retain(|c| filter(c));
    ctx.candidates
}

unsafe extern "system" fn enum_window_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: lparam points to an EnumCtx on the caller's stack; the
    // callback runs synchronously on the same thread.
    let ctx = &mut *(lparam.0 as *mut EnumCtx);

    let mut pid = 0u32;
    GetWindowThreadProcessId(hwnd, Some(&mut pid));
    if pid == 0 {
        return BOOL(1);
    }

    let title_len = GetWindowTextLengthW(hwnd);
    let title = if title_len > 0 {
        let mut buf = vec![0u16; title_len as usize + 1];
        let copied = GetWindowTextW(hwnd, &mut buf);
        String::from_utf16_lossy(&buf[..copied.max(0) as usize])
    } else {
        String::new()
    };

    let exstyle = GetWindowLongPtrW(hwnd, GWL_EXSTYLE) as u32;

    ctx.candidates.push(Candidate {
        hwnd,
        pid,
        title,
        visible: IsWindowVisible(hwnd).as_bool(),
        minimized: IsIconic(hwnd).as_bool(),
        tool: (exstyle & WS_EX_TOOLWINDOW.0) != 0,
    });

    BOOL(1)
}

/// Pick the best candidate: visible ≫ non-tool ≫ non-minimized, ties
/// broken by z-order (stable sort over enumeration order).
fn pick_best(mut candidates: Vec<Candidate>) -> Result<HWND, LocateError> {
    if candidates.is_empty() {
        return Err(LocateError::NotFound);
    }
    candidates.sort_by_key(|c| {
        let mut score = 0i32;
        if c.visible {
            score += 10_000;
        }
        if !c.tool {
            score += 3_000;
        }
        if !c.minimized {
            score += 1_000;
        }
        -score
    });
    Ok(candidates[0].hwnd)
}
