// Non-intrusive confirmation-button auto-clicker for AI-assisted IDE
// windows, built on Windows.Graphics.Capture.
//
// The pipeline: a window or monitor is captured through the graphics-
// capture API with strict row-pitch handling, frames land in a shared
// latest-frame cache, a normalized-cross-correlation matcher scans
// them for configured button templates, and qualifying hits are
// clicked through non-activating window messages, with no focus theft and no
// pointer movement. The scanner runs in an isolated worker process and
// streams typed status events to its hosting shell.

#![cfg(windows)]

pub mod cache;
pub mod capture;
pub mod click;
pub mod config;
pub mod d3d11;
pub mod error;
pub mod locator;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod scanner;
pub mod scheduler;
pub mod status;
pub mod template;
pub mod worker;

pub use cache::{FrameCache, FrameHandle};
pub use capture::{CaptureOptions, CaptureSession, CaptureSource, Frame, PixelFormat};
pub use click::{ClickDispatcher, ClickPoint, DispatchOptions};
pub use config::{CaptureBackend, ClickMethod, Config, Roi};
pub use error::{CaptureError, ClickError, ConfigError, LocateError, TemplateError};
pub use locator::WindowTarget;
pub use matcher::{MatchResult, MatchSettings, Matcher};
pub use monitor::{Monitor, MonitorRegistry, Point, Rect};
pub use scanner::{CancelToken, Scanner, ScannerCommand, ScannerState};
pub use scheduler::AdaptiveScheduler;
pub use status::{status_channel, StatusEvent, StatusReceiver, StatusSender};
pub use template::{Template, TemplateBank, TemplateId};
pub use worker::{worker_main, Supervisor, WorkerHandle, WORKER_FLAG};
