// Scanner orchestrator: the state machine that composes locator,
// capture, cache, templates, matcher, scheduler, and click dispatch.
//
//   Idle ─start→ Arming ─source-ready→ Scanning
//   Scanning ─miss→ Scanning (rescheduled)
//   Scanning ─hit (streak ≥ min)→ Cooldown ─timer→ Scanning
//   Scanning ─capture-error→ Faulted ─backoff→ Arming
//   any ─stop→ Idle,  any ─pause→ Paused ─resume→ Scanning
//
// The scanner is the single backoff authority: capture and click code
// report faults without self-retrying. Cancellation is cooperative: a
// cancel token is checked at every suspension point.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use windows::Win32::Foundation::{FILETIME, HWND};
use windows::Win32::System::ProcessStatus::{K32GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::Threading::{GetCurrentProcess, GetProcessTimes};

use crate::cache::FrameCache;
use crate::capture::{CaptureOptions, CaptureSession, CaptureSource};
use crate::click::{ClickDispatcher, DispatchOptions};
use crate::config::{CaptureBackend, Config};
use crate::error::{CaptureError, ConfigError, LocateError};
use crate::locator::{self, WindowTarget};
use crate::matcher::{MatchResult, MatchSettings, Matcher};
use crate::monitor::MonitorRegistry;
use crate::scheduler::{AdaptiveScheduler, SchedulerConfig};
use crate::status::{StatusEvent, StatusSender};
use crate::template::{TemplateBank, TemplateId};

/// Cache tag under which the scanner acquires frames.
const SCANNER_TAG: &str = "scanner";

/// Faulted backoff ladder, capped at the last entry.
const FAULT_BACKOFF_S: [u64; 4] = [1, 2, 4, 8];

/// Faults within this window count toward the sticky budget.
const FAULT_WINDOW: Duration = Duration::from_secs(60);

/// Faults inside the window that make Faulted sticky.
const FAULT_BUDGET: usize = 5;

/// PerfTick emission cadence.
const PERF_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive stale ticks that promote to Faulted.
const STALE_FAULT_STREAK: u32 = 5;

// ---------------------------------------------------------------------------
// State machine types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Idle,
    Arming,
    Scanning,
    Cooldown,
    Paused,
    Faulted,
}

/// Control commands from the hosting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerCommand {
    Start,
    Stop,
    Pause,
    Resume,
}

/// Cooperative cancellation: checked at every suspension point, wakes
/// sleepers immediately.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().expect("cancel mutex poisoned") = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().expect("cancel mutex poisoned")
    }

    /// Sleep until `timeout` elapses or the token fires. Returns true
    /// when cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock.lock().expect("cancel mutex poisoned");
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(cancelled, remaining)
                .expect("cancel mutex poisoned");
            cancelled = guard;
        }
        true
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Hit streaks
// ---------------------------------------------------------------------------

/// Consecutive qualifying-match counter per template. Any tick in
/// which a template does not match resets its streak.
pub struct HitTracker {
    streaks: HashMap<TemplateId, u32>,
    min_detections: u32,
}

impl HitTracker {
    pub fn new(min_detections: u32) -> Self {
        Self {
            streaks: HashMap::new(),
            min_detections: min_detections.max(1),
        }
    }

    /// Record the tick outcome. With at most one winning template per
    /// tick, every other template missed. Returns the winning
    /// template's streak when it reached `min_detections`.
    pub fn record(&mut self, hit: Option<TemplateId>) -> Option<u32> {
        match hit {
            Some(id) => {
                let streak = self.streaks.entry(id).or_insert(0);
                *streak += 1;
                let reached = *streak >= self.min_detections;
                let value = *streak;
                self.streaks.retain(|&k, _| k == id);
                reached.then_some(value)
            }
            None => {
                self.streaks.clear();
                None
            }
        }
    }

    /// Reset after a dispatched click.
    pub fn reset(&mut self) {
        self.streaks.clear();
    }

    pub fn streak(&self, id: TemplateId) -> u32 {
        self.streaks.get(&id).copied().unwrap_or(0)
    }
}

/// Backoff delay for the n-th consecutive fault (0-based).
fn fault_backoff(consecutive: usize) -> Duration {
    let idx = consecutive.min(FAULT_BACKOFF_S.len() - 1);
    Duration::from_secs(FAULT_BACKOFF_S[idx])
}

/// Rolling fault window: push a fault, drop expired entries, and
/// report whether the budget is exhausted.
fn fault_budget_exhausted(times: &mut VecDeque<Instant>, now: Instant) -> bool {
    times.push_back(now);
    while let Some(&front) = times.front() {
        if now.duration_since(front) > FAULT_WINDOW {
            times.pop_front();
        } else {
            break;
        }
    }
    times.len() >= FAULT_BUDGET
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    config: Config,
    registry: MonitorRegistry,
    cache: Arc<FrameCache>,
    bank: TemplateBank,
    matcher: Matcher,
    scheduler: AdaptiveScheduler,
    dispatcher: ClickDispatcher,
    tracker: HitTracker,
    status: StatusSender,

    state: ScannerState,
    session: Option<CaptureSession>,
    /// Resolved click/capture target window (raw handle value).
    target_hwnd: Option<isize>,
    last_foreground: Option<String>,

    consecutive_faults: usize,
    fault_times: VecDeque<Instant>,
    sticky_fault: bool,
    /// Consecutive ticks whose frame was stale; promotes to Faulted.
    stale_streak: u32,

    cooldown_until: Option<Instant>,
    perf: PerfTracker,
    debug_image_seq: u64,
}

impl Scanner {
    /// Build a scanner from a validated config. Template problems drop
    /// individual templates; having none at all is fatal.
    pub fn new(config: Config, status: StatusSender) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = MonitorRegistry::new()
            .map_err(|e| ConfigError::Invalid(format!("monitor enumeration failed: {e}")))?;

        let mut bank = TemplateBank::new(&config.effective_scales());
        for path in config.effective_template_paths() {
            if let Err(e) = bank.load(&path) {
                warn!(error = %e, "dropping template");
                status.send(StatusEvent::Error {
                    error_kind: "bad_template".into(),
                    detail: e.to_string(),
                });
            }
        }
        if bank.is_empty() {
            return Err(ConfigError::Invalid(
                "no template could be loaded".into(),
            ));
        }

        let matcher = Matcher::new(MatchSettings {
            threshold: config.threshold,
            grayscale: config.grayscale,
        });
        let scheduler = AdaptiveScheduler::new(SchedulerConfig::from_config(&config));
        let dispatcher = ClickDispatcher::new(DispatchOptions {
            cooldown: Duration::from_secs_f32(config.cooldown_s.max(0.0)),
            verify_bounds: config.verify_window_before_click,
            hang_guard: false,
        });
        let tracker = HitTracker::new(config.min_detections);

        Ok(Self {
            config,
            registry,
            cache: FrameCache::new(),
            bank,
            matcher,
            scheduler,
            dispatcher,
            tracker,
            status,
            state: ScannerState::Idle,
            session: None,
            target_hwnd: None,
            last_foreground: None,
            consecutive_faults: 0,
            fault_times: VecDeque::new(),
            sticky_fault: false,
            stale_streak: 0,
            cooldown_until: None,
            perf: PerfTracker::new(),
            debug_image_seq: 0,
        })
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Run the state machine until the token cancels or a Stop command
    /// arrives with no restart.
    pub fn run(
        &mut self,
        commands: &crossbeam_channel::Receiver<ScannerCommand>,
        cancel: &CancelToken,
    ) {
        self.set_state(ScannerState::Arming);

        while !cancel.is_cancelled() {
            // Drain pending control commands first.
            while let Ok(cmd) = commands.try_recv() {
                self.apply_command(cmd);
            }

            match self.state {
                ScannerState::Idle => {
                    // Parked: wait for a Start command.
                    match commands.recv_timeout(Duration::from_millis(200)) {
                        Ok(cmd) => self.apply_command(cmd),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                ScannerState::Arming => self.arm(cancel),
                ScannerState::Scanning => self.tick(cancel),
                ScannerState::Cooldown => self.cooldown(cancel),
                ScannerState::Paused => {
                    match commands.recv_timeout(Duration::from_millis(200)) {
                        Ok(cmd) => self.apply_command(cmd),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                ScannerState::Faulted => self.faulted(cancel),
            }
        }

        self.teardown();
        self.set_state(ScannerState::Idle);
    }

    fn apply_command(&mut self, cmd: ScannerCommand) {
        match cmd {
            ScannerCommand::Start => {
                if self.state == ScannerState::Idle {
                    self.sticky_fault = false;
                    self.consecutive_faults = 0;
                    self.fault_times.clear();
                    self.set_state(ScannerState::Arming);
                }
            }
            ScannerCommand::Stop => {
                self.teardown();
                self.set_state(ScannerState::Idle);
            }
            ScannerCommand::Pause => {
                if self.state != ScannerState::Idle {
                    self.set_state(ScannerState::Paused);
                }
            }
            ScannerCommand::Resume => {
                if self.state == ScannerState::Paused {
                    // Re-arm if the session was lost while paused.
                    let next = if self.session.is_some() {
                        ScannerState::Scanning
                    } else {
                        ScannerState::Arming
                    };
                    self.set_state(next);
                }
            }
        }
    }

    fn set_state(&mut self, state: ScannerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
            self.status.send(StatusEvent::StatusChanged { state });
        }
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        self.target_hwnd = None;
        self.tracker.reset();
    }

    // -- Arming ------------------------------------------------------------

    fn arm(&mut self, cancel: &CancelToken) {
        match self.open_session() {
            Ok(()) => {
                self.consecutive_faults = 0;
                self.stale_streak = 0;
                self.set_state(ScannerState::Scanning);
            }
            // An unresolved target is a next-tick retry, not a fault:
            // the user may simply not have the IDE open yet.
            Err(ArmError::Locate(e)) => {
                debug!(error = %e, "target not resolved, retrying");
                self.status.send(StatusEvent::Error {
                    error_kind: "target_not_found".into(),
                    detail: e.to_string(),
                });
                cancel.sleep(Duration::from_millis(self.config.interval_ms));
            }
            Err(e) => {
                // Faulted state owns the backoff sleep.
                let fatal = matches!(e, ArmError::Capture(CaptureError::Unsupported));
                self.report_fault(&e.to_string(), fatal);
            }
        }
    }

    fn open_session(&mut self) -> Result<(), ArmError> {
        let source = match self.config.capture_backend {
            CaptureBackend::Monitor => {
                let monitors = self.registry.list_monitors();
                let idx = (self.config.monitor_index.max(1) - 1) as usize;
                let monitor = monitors.get(idx).ok_or_else(|| {
                    ArmError::Locate(LocateError::NotFound)
                })?;
                // A window target may still be configured for clicks.
                self.target_hwnd = self.resolve_target().ok().map(|h| h.0 as isize);
                CaptureSource::Monitor(monitor.handle().0 as isize)
            }
            CaptureBackend::Window => {
                let hwnd = self.resolve_target().map_err(ArmError::Locate)?;
                self.target_hwnd = Some(hwnd.0 as isize);
                CaptureSource::Window(hwnd.0 as isize)
            }
        };

        let opts = CaptureOptions {
            include_cursor: self.config.include_cursor,
            border_required: self.config.border_required,
            fps_max: self.config.fps_max,
            timeout_ms: self.config.capture_timeout_ms,
            restore_minimized: self.config.restore_minimized_noactivate,
        };

        let session = CaptureSession::start(source, opts, Arc::clone(&self.cache))
            .map_err(ArmError::Capture)?;
        self.session = Some(session);
        info!(?source, "scanner armed");
        Ok(())
    }

    /// Build the window target from config precedence:
    /// explicit handle > title > process.
    fn resolve_target(&self) -> Result<HWND, LocateError> {
        let target = if self.config.target_hwnd != 0 {
            WindowTarget::Handle(self.config.target_hwnd)
        } else if !self.config.target_window_title.is_empty() {
            WindowTarget::Title {
                pattern: self.config.target_window_title.clone(),
                partial: self.config.window_title_partial_match,
            }
        } else if !self.config.target_process.is_empty() {
            WindowTarget::Process(self.config.target_process.clone())
        } else {
            return Err(LocateError::NotFound);
        };
        locator::resolve(&target)
    }

    // -- Scanning ----------------------------------------------------------

    fn tick(&mut self, cancel: &CancelToken) {
        // Foreground tracking feeds the scheduler.
        let foreground = locator::foreground_process();
        if foreground != self.last_foreground {
            self.scheduler.on_foreground_change(foreground.as_deref());
            self.last_foreground = foreground;
        }

        // Suspension point 1: the scheduler-chosen delay.
        let delay = self.scheduler.next_delay(Instant::now());
        if cancel.sleep(delay) {
            return;
        }

        self.emit_perf_tick();
        self.cache.sweep();

        // Re-resolve the target when configured; a changed handle
        // means the session must be rebuilt on the new window.
        if self.config.auto_update_hwnd_by_process
            && self.config.capture_backend == CaptureBackend::Window
        {
            match self.resolve_target() {
                Ok(hwnd) => {
                    let raw = hwnd.0 as isize;
                    if self.target_hwnd != Some(raw) {
                        info!(old = ?self.target_hwnd, new = raw, "target window changed");
                        self.teardown();
                        self.set_state(ScannerState::Arming);
                        return;
                    }
                }
                Err(_) => {
                    self.status.send(StatusEvent::Error {
                        error_kind: "target_not_found".into(),
                        detail: "target window no longer resolves".into(),
                    });
                }
            }
        }

        // Session health.
        let session_closed = self
            .session
            .as_ref()
            .map(|s| s.is_closed())
            .unwrap_or(true);
        if session_closed {
            // Target destroyed: restart the session from Arming.
            self.status.send(StatusEvent::Error {
                error_kind: "capture_closed".into(),
                detail: "capture session lost".into(),
            });
            self.teardown();
            self.set_state(ScannerState::Arming);
            return;
        }

        // Frame availability (minimized target etc).
        if let Some(session) = &self.session {
            if let Err(e) = session.latest_frame() {
                match e {
                    CaptureError::Unavailable => {
                        self.status.send(StatusEvent::Error {
                            error_kind: "capture_unavailable".into(),
                            detail: "no frame updates from target".into(),
                        });
                        self.miss();
                        return;
                    }
                    CaptureError::Closed => {
                        self.teardown();
                        self.set_state(ScannerState::Arming);
                        return;
                    }
                    other => {
                        self.report_fault(&other.to_string(), false);
                        return;
                    }
                }
            }
        }

        // Acquire the published frame under the scanner tag.
        let Some(handle) = self.cache.acquire(SCANNER_TAG) else {
            // Nothing published yet: a miss, not an error.
            self.miss();
            return;
        };

        let stale =
            handle.age() > Duration::from_millis(self.config.capture_timeout_ms);
        if stale {
            // A stale tick is a miss; a run of them means the source
            // silently died and promotes to Faulted.
            self.stale_streak += 1;
            if self.stale_streak >= STALE_FAULT_STREAK {
                self.stale_streak = 0;
                self.cache.release(SCANNER_TAG);
                self.report_fault("capture produced no fresh frames", false);
                return;
            }
        } else {
            self.stale_streak = 0;
        }

        let outcome = if stale {
            None
        } else {
            self.matcher
                .find_first(&handle, self.bank.templates(), self.config.roi)
        };

        match outcome {
            Some(result) => {
                self.status.send(StatusEvent::Match {
                    template_id: result.template_id,
                    center: result.center,
                    score: result.score,
                    scale: result.scale,
                });
                self.save_debug_image(&handle, &result);

                let qualified = self.tracker.record(Some(result.template_id)).is_some();
                if qualified {
                    self.dispatch_click(&result);
                }
                self.scheduler.on_hit(Instant::now());
            }
            None => {
                if stale {
                    debug!("frame stale beyond capture timeout, counting as miss");
                }
                self.miss();
            }
        }

        self.cache.release(SCANNER_TAG);
    }

    fn miss(&mut self) {
        self.tracker.record(None);
        self.scheduler.on_miss();
    }

    fn dispatch_click(&mut self, result: &MatchResult) {
        let Some(raw) = self.target_hwnd else {
            debug!("qualifying match without a click target, skipping dispatch");
            return;
        };
        let hwnd = HWND(raw as *mut _);

        // In monitor capture, match coordinates are monitor-relative;
        // translate them into the target's client space.
        let frame_point = match self.config.capture_backend {
            CaptureBackend::Window => result.center,
            CaptureBackend::Monitor => {
                let monitors = self.registry.list_monitors();
                let idx = (self.config.monitor_index.max(1) - 1) as usize;
                let Some(monitor) = monitors.get(idx) else {
                    return;
                };
                let Ok(client) = locator::client_rect(hwnd) else {
                    self.status.send(StatusEvent::Error {
                        error_kind: "window_gone".into(),
                        detail: "click target vanished".into(),
                    });
                    return;
                };
                (
                    monitor.bounds.left + result.center.0 - client.left,
                    monitor.bounds.top + result.center.1 - client.top,
                )
            }
        };

        match self
            .dispatcher
            .dispatch(hwnd, frame_point, self.config.click_offset)
        {
            Ok(point) => {
                self.status.send(StatusEvent::Click {
                    screen: (point.screen.x, point.screen.y),
                    client: (point.client.x, point.client.y),
                });
                self.tracker.reset();
                self.cooldown_until = Some(
                    Instant::now() + Duration::from_millis(self.config.hit_cooldown_ms),
                );
                self.set_state(ScannerState::Cooldown);
            }
            Err(crate::error::ClickError::Cooling) => {
                // Silent by contract.
            }
            Err(e) => {
                warn!(error = %e, "click dispatch failed");
                self.status.send(StatusEvent::Error {
                    error_kind: "click_failed".into(),
                    detail: e.to_string(),
                });
                self.miss();
            }
        }
    }

    // -- Cooldown / Faulted ------------------------------------------------

    fn cooldown(&mut self, cancel: &CancelToken) {
        let remaining = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        if !remaining.is_zero() && cancel.sleep(remaining) {
            return;
        }
        self.cooldown_until = None;
        self.set_state(ScannerState::Scanning);
    }

    fn faulted(&mut self, cancel: &CancelToken) {
        if self.sticky_fault {
            // Requires user action (Stop + Start) to leave.
            cancel.sleep(Duration::from_millis(500));
            return;
        }
        let delay = fault_backoff(self.consecutive_faults.saturating_sub(1));
        if cancel.sleep(delay) {
            return;
        }
        self.teardown();
        self.set_state(ScannerState::Arming);
    }

    fn report_fault(&mut self, detail: &str, fatal: bool) {
        self.consecutive_faults += 1;
        let exhausted = fault_budget_exhausted(&mut self.fault_times, Instant::now());
        if fatal || exhausted {
            self.sticky_fault = true;
        }
        error!(detail, fatal, sticky = self.sticky_fault, "scanner fault");
        self.status.send(StatusEvent::Error {
            error_kind: if fatal {
                "capture_unsupported".into()
            } else {
                "worker_fault".into()
            },
            detail: detail.to_string(),
        });
        self.set_state(ScannerState::Faulted);
    }

    // -- Diagnostics -------------------------------------------------------

    fn emit_perf_tick(&mut self) {
        let frames = self
            .session
            .as_ref()
            .map(|s| s.frames_published())
            .unwrap_or(0);
        if let Some((fps, cpu, mem)) = self.perf.sample(frames) {
            self.status.send(StatusEvent::PerfTick {
                fps,
                cpu_percent: cpu,
                mem_mb: mem,
            });
        }
    }

    fn save_debug_image(&mut self, frame: &crate::capture::Frame, result: &MatchResult) {
        let Some(dir) = self.config.debug_image_dir.clone() else {
            return;
        };
        self.debug_image_seq += 1;
        let path = dir.join(format!(
            "match_{:06}_t{:016x}.png",
            self.debug_image_seq, result.template_id
        ));

        // BGRA rows → RGBA image, honoring row pitch via Frame::row.
        let mut rgba = Vec::with_capacity((frame.width * frame.height * 4) as usize);
        for y in 0..frame.height {
            for px in frame.row(y).chunks_exact(4) {
                rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        match image::RgbaImage::from_raw(frame.width, frame.height, rgba) {
            Some(img) => {
                if let Err(e) = img.save(&path) {
                    warn!(error = %e, "failed to save debug image");
                }
            }
            None => warn!("debug image buffer size mismatch"),
        }
    }
}

/// Error source for the arming phase.
#[derive(Debug, thiserror::Error)]
enum ArmError {
    #[error("{0}")]
    Locate(#[from] LocateError),
    #[error("{0}")]
    Capture(#[from] CaptureError),
}

// ---------------------------------------------------------------------------
// Perf sampling
// ---------------------------------------------------------------------------

struct PerfTracker {
    last_sample: Instant,
    last_frames: u64,
    last_cpu_100ns: u64,
}

impl PerfTracker {
    fn new() -> Self {
        Self {
            last_sample: Instant::now(),
            last_frames: 0,
            last_cpu_100ns: process_cpu_100ns().unwrap_or(0),
        }
    }

    /// Returns (fps, cpu%, mem MB) once per PERF_INTERVAL.
    fn sample(&mut self, frames_total: u64) -> Option<(f32, f32, f32)> {
        let elapsed = self.last_sample.elapsed();
        if elapsed < PERF_INTERVAL {
            return None;
        }

        let fps = (frames_total.saturating_sub(self.last_frames)) as f32
            / elapsed.as_secs_f32();

        let cpu_now = process_cpu_100ns().unwrap_or(self.last_cpu_100ns);
        let cpu_delta_s = cpu_now.saturating_sub(self.last_cpu_100ns) as f32 / 1e7;
        let cpu_percent = (cpu_delta_s / elapsed.as_secs_f32()) * 100.0;

        self.last_sample = Instant::now();
        self.last_frames = frames_total;
        self.last_cpu_100ns = cpu_now;

        Some((fps, cpu_percent, process_mem_mb()))
    }
}

fn filetime_100ns(ft: FILETIME) -> u64 {
    ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64
}

/// Total kernel+user CPU time of this process in 100 ns units.
fn process_cpu_100ns() -> Option<u64> {
    unsafe {
        // SAFETY: pseudo-handle needs no close; out-structs are locals.
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        GetProcessTimes(
            GetCurrentProcess(),
            &mut creation,
            &mut exit,
            &mut kernel,
            &mut user,
        )
        .ok()?;
        Some(filetime_100ns(kernel) + filetime_100ns(user))
    }
}

fn process_mem_mb() -> f32 {
    unsafe {
        // SAFETY: pseudo-handle; pmc is a local out-struct.
        let mut pmc = PROCESS_MEMORY_COUNTERS {
            cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            ..Default::default()
        };
        if K32GetProcessMemoryInfo(GetCurrentProcess(), &mut pmc, pmc.cb).is_ok() {
            pmc.WorkingSetSize as f32 / (1024.0 * 1024.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracker_requires_streak() {
        let mut t = HitTracker::new(2);
        // First qualifying frame: streak 1, no click yet.
        assert_eq!(t.record(Some(7)), None);
        // Second consecutive frame reaches min_detections.
        assert_eq!(t.record(Some(7)), Some(2));
        assert_eq!(t.streak(7), 2);
    }

    #[test]
    fn test_hit_tracker_min_one_fires_immediately() {
        let mut t = HitTracker::new(1);
        assert_eq!(t.record(Some(3)), Some(1));
    }

    #[test]
    fn test_miss_resets_streak() {
        let mut t = HitTracker::new(3);
        assert_eq!(t.record(Some(1)), None);
        assert_eq!(t.record(Some(1)), None);
        assert_eq!(t.record(None), None);
        // The streak restarted from zero.
        assert_eq!(t.record(Some(1)), None);
        assert_eq!(t.streak(1), 1);
    }

    #[test]
    fn test_template_switch_resets_other_streaks() {
        let mut t = HitTracker::new(2);
        assert_eq!(t.record(Some(1)), None);
        // A different template winning the tick means template 1 missed.
        assert_eq!(t.record(Some(2)), None);
        assert_eq!(t.streak(1), 0);
        assert_eq!(t.record(Some(2)), Some(2));
    }

    #[test]
    fn test_fault_backoff_ladder() {
        assert_eq!(fault_backoff(0), Duration::from_secs(1));
        assert_eq!(fault_backoff(1), Duration::from_secs(2));
        assert_eq!(fault_backoff(2), Duration::from_secs(4));
        assert_eq!(fault_backoff(3), Duration::from_secs(8));
        // Capped at 8 s.
        assert_eq!(fault_backoff(9), Duration::from_secs(8));
    }

    #[test]
    fn test_fault_budget_window() {
        let mut times = VecDeque::new();
        let t0 = Instant::now();
        for i in 0..4 {
            assert!(!fault_budget_exhausted(
                &mut times,
                t0 + Duration::from_secs(i)
            ));
        }
        // Fifth fault within 60 s exhausts the budget.
        assert!(fault_budget_exhausted(
            &mut times,
            t0 + Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_fault_budget_expires_old_faults() {
        let mut times = VecDeque::new();
        let t0 = Instant::now();
        for i in 0..4 {
            let _ = fault_budget_exhausted(&mut times, t0 + Duration::from_secs(i * 2));
        }
        // Far in the future: the window slid past the earlier faults.
        assert!(!fault_budget_exhausted(
            &mut times,
            t0 + Duration::from_secs(120)
        ));
    }

    #[test]
    fn test_cancel_token_wakes_sleep() {
        let token = CancelToken::new();
        let waker = token.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.cancel();
        });
        // Would sleep 10 s without cancellation.
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_token_timeout_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_scanner_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ScannerState::Faulted).unwrap(),
            "\"faulted\""
        );
        assert_eq!(
            serde_json::from_str::<ScannerState>("\"cooldown\"").unwrap(),
            ScannerState::Cooldown
        );
    }
}
