// Error taxonomy for the capture→match→click pipeline.
//
// Every variant maps to a recovery policy enforced by the scanner:
// transient errors become misses or session restarts, fatal errors
// disable scanning until the configuration changes. Nothing here
// self-retries; the scanner is the single backoff authority.

/// Capture backend errors (graphics-capture session lifecycle).
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The OS lacks Windows.Graphics.Capture. Fatal per session.
    #[error("graphics capture is not supported on this system")]
    Unsupported,

    /// No usable frame right now (minimized target, no updates yet).
    /// Transient; retry on the next tick.
    #[error("capture source temporarily unavailable")]
    Unavailable,

    /// The capture item was closed under us (target window destroyed).
    /// The scanner restarts the session from Arming.
    #[error("capture session closed")]
    Closed,

    /// Session setup or frame readback failed inside the OS stack.
    #[error("capture backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Window locator errors. Both variants are recoverable: the next tick
/// re-resolves the target.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no window matches the configured target")]
    NotFound,

    /// A previously resolved handle no longer refers to a live window.
    #[error("window handle is stale")]
    Stale,
}

/// Click dispatcher errors. All recoverable; the tick that hit one is
/// logged and counted as a miss.
#[derive(Debug, thiserror::Error)]
pub enum ClickError {
    /// The target window died between match and dispatch.
    #[error("target window is gone")]
    WindowGone,

    /// The computed click point fell outside the target's client area
    /// (the window moved or resized after the frame was captured).
    #[error("click point ({x}, {y}) is outside the target client area")]
    OutOfBounds { x: i32, y: i32 },

    /// Message posting failed or the guarded send timed out.
    #[error("failed to post click message: {0}")]
    PostFailed(String),

    /// Cooldown has not elapsed since the last click on this handle.
    /// Silent: not an error condition, just a refusal.
    #[error("click refused: cooldown active")]
    Cooling,
}

/// Template bank errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Undecodable or degenerate (zero-area) image. The bank drops the
    /// template and continues with the remainder.
    #[error("bad template {path}: {detail}")]
    BadTemplate { path: String, detail: String },
}

/// Configuration errors. Fatal: the scanner refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ClickError::OutOfBounds { x: -5, y: 2048 };
        assert_eq!(
            e.to_string(),
            "click point (-5, 2048) is outside the target client area"
        );

        let e = CaptureError::Unsupported;
        assert!(e.to_string().contains("not supported"));
    }

    #[test]
    fn test_backend_from_anyhow() {
        let inner = anyhow::anyhow!("device removed");
        let e: CaptureError = inner.into();
        assert!(matches!(e, CaptureError::Backend(_)));
    }
}
