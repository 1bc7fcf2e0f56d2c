// Windows.Graphics.Capture session with a dedicated capture thread.
//
// The FrameArrived callback only signals a kernel event; all D3D work
// (surface acquisition, pitch-correct readback, pool recreation) runs
// on the capture thread, which owns the thread-affine device context.
// The capture thread is the sole publisher into the shared frame
// cache. There is no bitblt or print-window path anywhere: when
// graphics capture cannot start, the session fails fast.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem,
    GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DSurface;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND};
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Gdi::HMONITOR;
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::Win32::UI::WindowsAndMessaging::{
    IsIconic, IsWindow, ShowWindowAsync, SW_SHOWNOACTIVATE,
};

use super::frame::{Frame, FramePool};
use crate::cache::FrameCache;
use crate::d3d11::{create_d3d11_device, D3D11Context, TextureReader};
use crate::error::CaptureError;

/// Frame pool buffer count; two is enough for latest-wins draining.
const POOL_BUFFERS: i32 = 2;

/// A new content size must hold for this many consecutive frames
/// before the pool is rebuilt at it.
const RESIZE_DEBOUNCE_FRAMES: u32 = 2;

/// Wait slice for the capture thread; bounds shutdown latency.
const WAIT_SLICE_MS: u32 = 250;

const WAIT_OBJECT_0: u32 = 0;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Capture source. Handles are carried as raw values so the source can
/// cross into the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Window(isize),
    Monitor(isize),
}

impl CaptureSource {
    fn window_handle(self) -> Option<HWND> {
        match self {
            CaptureSource::Window(raw) => Some(HWND(raw as *mut _)),
            CaptureSource::Monitor(_) => None,
        }
    }
}

/// Session options (from the configuration document).
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub include_cursor: bool,
    pub border_required: bool,
    /// Arrival processing cap; surplus arrivals are dropped latest-wins.
    pub fps_max: u32,
    /// Staleness bound for `latest_frame`.
    pub timeout_ms: u64,
    /// Attempt one non-activating restore of a minimized target.
    pub restore_minimized: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_cursor: false,
            border_required: false,
            fps_max: 30,
            timeout_ms: 5000,
            restore_minimized: true,
        }
    }
}

/// Whether this OS exposes Windows.Graphics.Capture.
pub fn is_capture_supported() -> bool {
    GraphicsCaptureSession::IsSupported().unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Running capture session. Frames are published into the cache given
/// at start; `latest_frame` reads the session's own latest slot for
/// cache-less clients.
pub struct CaptureSession {
    shutdown: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<Arc<Frame>>>>,
    published: Arc<AtomicU64>,
    /// Kernel event handle (as usize) used to wake the capture thread.
    wake_event: usize,
    thread: Option<std::thread::JoinHandle<()>>,
    timeout: Duration,
    source: CaptureSource,
}

impl CaptureSession {
    /// Open a capture session and start publishing frames into `cache`.
    ///
    /// Fails fast with `Unsupported` when the OS lacks graphics
    /// capture; there is no fallback path by design.
    pub fn start(
        source: CaptureSource,
        opts: CaptureOptions,
        cache: Arc<FrameCache>,
    ) -> Result<Self, CaptureError> {
        if !is_capture_supported() {
            return Err(CaptureError::Unsupported);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let unavailable = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(Mutex::new(None));
        let published = Arc::new(AtomicU64::new(0));

        let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<usize>>(1);

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            let closed = Arc::clone(&closed);
            let unavailable = Arc::clone(&unavailable);
            let latest = Arc::clone(&latest);
            let published = Arc::clone(&published);
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    capture_thread(
                        source, opts, cache, shutdown, closed, unavailable, latest, published,
                        init_tx,
                    );
                })
                .map_err(|e| CaptureError::Backend(anyhow!("spawn capture thread: {e}")))?
        };

        // Wait for the thread to finish WGC setup so start() reports
        // session-fatal errors synchronously.
        let wake_event = match init_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(CaptureError::Backend(e));
            }
            Err(_) => {
                shutdown.store(true, Ordering::Relaxed);
                let _ = thread.join();
                return Err(CaptureError::Backend(anyhow!("capture setup timed out")));
            }
        };

        info!(?source, "capture session started");
        Ok(Self {
            shutdown,
            closed,
            unavailable,
            latest,
            published,
            wake_event,
            thread: Some(thread),
            timeout: Duration::from_millis(opts.timeout_ms),
            source,
        })
    }

    /// Most recent published frame, or `None` when nothing fresh within
    /// `timeout_ms`. Non-blocking.
    pub fn latest_frame(&self) -> Result<Option<Arc<Frame>>, CaptureError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CaptureError::Closed);
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CaptureError::Unavailable);
        }
        let slot = self.latest.lock().expect("latest slot poisoned");
        match slot.as_ref() {
            Some(frame) if frame.age() <= self.timeout => Ok(Some(Arc::clone(frame))),
            _ => Ok(None),
        }
    }

    /// The capture item reported closed (target destroyed).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Total frames published since start (for perf reporting).
    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn source(&self) -> CaptureSource {
        self.source
    }

    /// Stop the session and join the capture thread. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.wake_event != 0 {
            // SAFETY: the event outlives the thread; signaling a
            // signaled or abandoned-wait event is harmless.
            unsafe {
                let _ = SetEvent(HANDLE(self.wake_event as *mut _));
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("capture session stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Capture thread
// ---------------------------------------------------------------------------

struct WgcState {
    item: GraphicsCaptureItem,
    frame_pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    frame_arrived_token: i64,
    closed_token: i64,
    frame_event: HANDLE,
    direct3d_device: windows::Graphics::DirectX::Direct3D11::IDirect3DDevice,
    pool_width: u32,
    pool_height: u32,
}

#[allow(clippy::too_many_arguments)]
fn capture_thread(
    source: CaptureSource,
    opts: CaptureOptions,
    cache: Arc<FrameCache>,
    shutdown: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<Arc<Frame>>>>,
    published: Arc<AtomicU64>,
    init_tx: crossbeam_channel::Sender<Result<usize>>,
) {
    let (d3d_ctx, mut wgc) = match init_wgc(source, opts, &shutdown, &closed) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok(wgc.frame_event.0 as usize));

    let mut reader = TextureReader::new(d3d_ctx.device.clone(), d3d_ctx.context.clone());
    let buffer_pool = FramePool::new(wgc.pool_width as usize * wgc.pool_height as usize * 4);

    let min_interval = Duration::from_millis(1000 / opts.fps_max.max(1) as u64);
    let mut last_processed: Option<Instant> = None;

    // Resize debounce state: candidate size and how many consecutive
    // frames reported it.
    let mut pending_size: Option<(u32, u32)> = None;
    let mut pending_stable = 0u32;
    // First frame after a pool rebuild may still show pre-rebuild
    // content; drop it.
    let mut drop_next = false;

    while !shutdown.load(Ordering::Relaxed) {
        // SAFETY: frame_event lives until teardown below.
        let wait = unsafe { WaitForSingleObject(wgc.frame_event, WAIT_SLICE_MS) };
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Drain the pool, keeping only the newest surface: latest-wins,
        // never more than one pending frame.
        let mut newest: Option<Direct3D11CaptureFrame> = None;
        while let Ok(f) = wgc.frame_pool.TryGetNextFrame() {
            newest = Some(f);
        }

        let Some(frame) = newest else {
            if wait.0 != WAIT_OBJECT_0 {
                // Timed out with nothing buffered. A minimized window
                // produces no updates: surface Unavailable rather than
                // fabricating black frames.
                if let Some(hwnd) = source.window_handle() {
                    // SAFETY: read-only window state queries.
                    unsafe {
                        if !IsWindow(Some(hwnd)).as_bool() {
                            closed.store(true, Ordering::Relaxed);
                            break;
                        }
                        if IsIconic(hwnd).as_bool() {
                            unavailable.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
            continue;
        };

        // fps_max cap: drop surplus arrivals.
        if let Some(last) = last_processed {
            if last.elapsed() < min_interval {
                continue;
            }
        }

        let content = match frame.ContentSize() {
            Ok(s) => (s.Width.max(0) as u32, s.Height.max(0) as u32),
            Err(_) => continue,
        };
        if content.0 == 0 || content.1 == 0 {
            continue;
        }

        // Content-size debounce: rebuild only after the new size held
        // for RESIZE_DEBOUNCE_FRAMES consecutive frames. Until then,
        // publish clipped to min(content, pool); the region outside
        // the content is undefined.
        if content != (wgc.pool_width, wgc.pool_height) {
            if pending_size == Some(content) {
                pending_stable += 1;
            } else {
                pending_size = Some(content);
                pending_stable = 1;
            }
            if pending_stable >= RESIZE_DEBOUNCE_FRAMES {
                if let Err(e) = recreate_pool(&mut wgc, content) {
                    warn!(error = %e, "frame pool recreate failed");
                    closed.store(true, Ordering::Relaxed);
                    break;
                }
                buffer_pool.retarget(content.0 as usize * content.1 as usize * 4);
                pending_size = None;
                pending_stable = 0;
                drop_next = true;
                continue;
            }
        } else {
            pending_size = None;
            pending_stable = 0;
        }

        if drop_next {
            drop_next = false;
            continue;
        }

        let copy_w = content.0.min(wgc.pool_width);
        let copy_h = content.1.min(wgc.pool_height);

        let texture = match frame_to_texture(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "surface interop failed");
                continue;
            }
        };

        let mut bytes = buffer_pool.acquire_vec();
        match reader.read_texture(&texture, copy_w, copy_h, &mut bytes) {
            Ok((w, h)) => {
                let published_frame =
                    Arc::new(Frame::from_pooled(w, h, content, buffer_pool.wrap(bytes)));
                cache.publish(Arc::clone(&published_frame));
                *latest.lock().expect("latest slot poisoned") = Some(published_frame);
                published.fetch_add(1, Ordering::Relaxed);
                unavailable.store(false, Ordering::Relaxed);
                last_processed = Some(Instant::now());
            }
            Err(e) => {
                warn!(error = %e, "texture readback failed");
            }
        }
        // `frame` drops here, releasing the surface back to the pool
        // strictly after CopyResource inside read_texture.
    }

    teardown_wgc(wgc);
}

fn init_wgc(
    source: CaptureSource,
    opts: CaptureOptions,
    shutdown: &Arc<AtomicBool>,
    closed: &Arc<AtomicBool>,
) -> Result<(D3D11Context, WgcState)> {
    let d3d_ctx = create_d3d11_device()?;

    let item = match source {
        CaptureSource::Window(raw) => {
            let hwnd = HWND(raw as *mut _);
            // SAFETY: read-only window state queries.
            unsafe {
                if !IsWindow(Some(hwnd)).as_bool() {
                    bail!("capture target window is not alive");
                }
                // One non-activating restore attempt per session; never
                // poke the window repeatedly.
                if opts.restore_minimized && IsIconic(hwnd).as_bool() {
                    let _ = ShowWindowAsync(hwnd, SW_SHOWNOACTIVATE);
                    debug!("requested no-activate restore of minimized target");
                }
            }
            create_item_for_window(hwnd)?
        }
        CaptureSource::Monitor(raw) => create_item_for_monitor(HMONITOR(raw as *mut _))?,
    };

    let size = item.Size()?;

    let frame_pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
        &d3d_ctx.direct3d_device,
        DirectXPixelFormat::B8G8R8A8UIntNormalized,
        POOL_BUFFERS,
        size,
    )?;

    // SAFETY: anonymous auto-reset event; closed in teardown_wgc.
    let frame_event =
        unsafe { CreateEventW(None, false, false, None).context("failed to create frame event")? };

    // FrameArrived only signals the kernel event; no D3D work happens
    // on the callback thread.
    let shutdown_cb = Arc::clone(shutdown);
    let event_ptr = frame_event.0 as usize;
    let frame_arrived_token = frame_pool.FrameArrived(&TypedEventHandler::<
        Direct3D11CaptureFramePool,
        windows::core::IInspectable,
    >::new(move |_, _| {
        if !shutdown_cb.load(Ordering::Relaxed) {
            // SAFETY: kernel event handles are thread-safe.
            unsafe {
                let _ = SetEvent(HANDLE(event_ptr as *mut _));
            }
        }
        Ok(())
    }))?;

    // Item closure means the target window was destroyed.
    let closed_flag = Arc::clone(closed);
    let closed_token = item.Closed(&TypedEventHandler::<
        GraphicsCaptureItem,
        windows::core::IInspectable,
    >::new(move |_, _| {
        closed_flag.store(true, Ordering::Relaxed);
        Ok(())
    }))?;

    let session = frame_pool.CreateCaptureSession(&item)?;
    session.SetIsBorderRequired(opts.border_required)?;
    // Cursor capture toggle is absent on older builds; best effort.
    let _ = session.SetIsCursorCaptureEnabled(opts.include_cursor);
    session.StartCapture()?;

    let direct3d_device = d3d_ctx.direct3d_device.clone();
    Ok((
        d3d_ctx,
        WgcState {
            item,
            frame_pool,
            session,
            frame_arrived_token,
            closed_token,
            frame_event,
            direct3d_device,
            pool_width: size.Width.max(0) as u32,
            pool_height: size.Height.max(0) as u32,
        },
    ))
}

fn recreate_pool(wgc: &mut WgcState, size: (u32, u32)) -> Result<()> {
    wgc.frame_pool.Recreate(
        &wgc.direct3d_device,
        DirectXPixelFormat::B8G8R8A8UIntNormalized,
        POOL_BUFFERS,
        windows::Graphics::SizeInt32 {
            Width: size.0 as i32,
            Height: size.1 as i32,
        },
    )?;
    wgc.pool_width = size.0;
    wgc.pool_height = size.1;
    debug!(width = size.0, height = size.1, "frame pool recreated");
    Ok(())
}

fn teardown_wgc(wgc: WgcState) {
    let _ = wgc.frame_pool.RemoveFrameArrived(wgc.frame_arrived_token);
    let _ = wgc.item.RemoveClosed(wgc.closed_token);
    let _ = wgc.session.Close();
    let _ = wgc.frame_pool.Close();
    if !wgc.frame_event.is_invalid() {
        // SAFETY: frame_event was created in init_wgc; closed once here.
        unsafe {
            let _ = CloseHandle(wgc.frame_event);
        }
    }
}

/// Create a GraphicsCaptureItem for a window.
fn create_item_for_window(hwnd: HWND) -> Result<GraphicsCaptureItem> {
    // SAFETY: factory + interop calls; failure means capture is not
    // available for this window.
    unsafe {
        let interop: IGraphicsCaptureItemInterop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("IGraphicsCaptureItemInterop factory failed")?;
        interop
            .CreateForWindow(hwnd)
            .context("CreateForWindow failed")
    }
}

/// Create a GraphicsCaptureItem for a monitor.
fn create_item_for_monitor(hmonitor: HMONITOR) -> Result<GraphicsCaptureItem> {
    // SAFETY: same contract as create_item_for_window.
    unsafe {
        let interop: IGraphicsCaptureItemInterop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("IGraphicsCaptureItemInterop factory failed")?;
        interop
            .CreateForMonitor(hmonitor)
            .context("CreateForMonitor failed")
    }
}

/// Extract the D3D11 texture backing a capture frame. The frame must
/// outlive all access to the returned texture.
fn frame_to_texture(frame: &Direct3D11CaptureFrame) -> Result<ID3D11Texture2D> {
    let surface: IDirect3DSurface = frame.Surface()?;
    let access: IDirect3DDxgiInterfaceAccess = surface.cast()?;
    // SAFETY: access was obtained from a successful cast; GetInterface
    // returns an owned COM reference.
    let texture: ID3D11Texture2D = unsafe {
        access
            .GetInterface()
            .context("failed to get ID3D11Texture2D from surface")?
    };
    Ok(texture)
}
