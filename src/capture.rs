// Capture backend: frame representation and the graphics-capture session.

pub mod frame;
pub mod wgc;

pub use frame::{Frame, FramePool, PixelFormat};
pub use wgc::{is_capture_supported, CaptureOptions, CaptureSession, CaptureSource};
