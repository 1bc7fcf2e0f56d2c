// Shared frame cache: one logical slot, single producer, multiple
// consumers. Publication swaps an Arc; readers holding a handle keep
// the superseded frame alive until they release it, so replacement is
// atomic from a reader's perspective and never frees storage that is
// still referenced.
//
// Consumer tags are opaque strings. Namespace: `preview:*` for
// settings-dialog previews, `scanner` for the detection loop,
// `test:*` for tests. A sweeper unregisters records whose last access
// is older than the session timeout, bounding leaks from clients that
// forget to release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::frame::Frame;

/// Idle time after which a consumer record is swept.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct ConsumerRecord {
    first_access: Instant,
    last_access: Instant,
    hits: u64,
    /// Frame the consumer currently holds, kept alive independently of
    /// the slot.
    held: Option<Arc<Frame>>,
}

/// Access statistics for one consumer tag.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerStats {
    pub first_access: Instant,
    pub last_access: Instant,
    pub hits: u64,
}

struct CacheState {
    slot: Option<Arc<Frame>>,
    consumers: HashMap<String, ConsumerRecord>,
    published_total: u64,
}

/// Latest-frame store shared between the capture thread (producer) and
/// preview/scanner consumers.
pub struct FrameCache {
    state: Mutex<CacheState>,
    session_timeout: Duration,
}

/// Refcounted view into a published frame. The frame bytes are
/// immutable, so reads happen without any lock held.
pub struct FrameHandle {
    frame: Arc<Frame>,
}

impl FrameHandle {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl std::ops::Deref for FrameHandle {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl FrameCache {
    pub fn new() -> Arc<Self> {
        Self::with_session_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_session_timeout(session_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState {
                slot: None,
                consumers: HashMap::new(),
                published_total: 0,
            }),
            session_timeout,
        })
    }

    /// Replace the slot. The previous frame stays alive while any
    /// consumer still holds it.
    pub fn publish(&self, frame: Arc<Frame>) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.slot = Some(frame);
        state.published_total += 1;
    }

    /// Acquire a refcounted view of the current frame under `tag`.
    /// Re-acquiring under the same tag replaces the held frame and
    /// refreshes the access timestamp.
    pub fn acquire(&self, tag: &str) -> Option<FrameHandle> {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        let frame = state.slot.clone()?;

        let now = Instant::now();
        let record = state
            .consumers
            .entry(tag.to_string())
            .or_insert_with(|| ConsumerRecord {
                first_access: now,
                last_access: now,
                hits: 0,
                held: None,
            });
        record.last_access = now;
        record.hits += 1;
        record.held = Some(Arc::clone(&frame));

        Some(FrameHandle { frame })
    }

    /// Drop `tag`'s reference. A second release for the same tag is a
    /// no-op; the consumer record itself survives for the sweeper.
    pub fn release(&self, tag: &str) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        if let Some(record) = state.consumers.get_mut(tag) {
            record.last_access = Instant::now();
            record.held = None;
        }
    }

    /// Unregister consumer records idle past the session timeout.
    /// Returns how many were swept.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        let timeout = self.session_timeout;
        let before = state.consumers.len();
        state
            .consumers
            .retain(|tag, record| {
                let keep = record.last_access.elapsed() < timeout;
                if !keep {
                    debug!(tag, "sweeping idle cache consumer");
                }
                keep
            });
        before - state.consumers.len()
    }

    /// Capture time of the published frame, if any.
    pub fn latest_captured_at(&self) -> Option<Instant> {
        let state = self.state.lock().expect("cache mutex poisoned");
        state.slot.as_ref().map(|f| f.captured_at)
    }

    pub fn published_total(&self) -> u64 {
        self.state.lock().expect("cache mutex poisoned").published_total
    }

    pub fn consumer_stats(&self, tag: &str) -> Option<ConsumerStats> {
        let state = self.state.lock().expect("cache mutex poisoned");
        state.consumers.get(tag).map(|r| ConsumerStats {
            first_access: r.first_access,
            last_access: r.last_access,
            hits: r.hits,
        })
    }

    #[cfg(test)]
    fn consumer_count(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn test_frame(tag_byte: u8) -> Arc<Frame> {
        Arc::new(Frame::from_tight(
            2,
            2,
            PixelFormat::Bgra8,
            vec![tag_byte; 16],
        ))
    }

    #[test]
    fn test_acquire_returns_latest() {
        let cache = FrameCache::new();
        assert!(cache.acquire("test:a").is_none());

        cache.publish(test_frame(1));
        cache.publish(test_frame(2));
        let handle = cache.acquire("test:a").unwrap();
        assert_eq!(handle.row(0)[0], 2);
        assert_eq!(cache.published_total(), 2);
    }

    #[test]
    fn test_reader_keeps_superseded_frame_alive() {
        let cache = FrameCache::new();
        cache.publish(test_frame(1));
        let held = cache.acquire("test:a").unwrap();

        // Replacement must not invalidate the outstanding handle.
        cache.publish(test_frame(2));
        assert_eq!(held.row(0)[0], 1);

        // A fresh acquire sees the new frame.
        let fresh = cache.acquire("test:b").unwrap();
        assert_eq!(fresh.row(0)[0], 2);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let cache = FrameCache::new();
        cache.publish(test_frame(1));
        let _ = cache.acquire("test:a").unwrap();
        cache.release("test:a");
        cache.release("test:a");
        cache.release("test:never-acquired");
        assert!(cache.consumer_stats("test:a").is_some());
    }

    #[test]
    fn test_reacquire_updates_record() {
        let cache = FrameCache::new();
        cache.publish(test_frame(1));
        let _ = cache.acquire("test:a");
        let first = cache.consumer_stats("test:a").unwrap();
        let _ = cache.acquire("test:a");
        let second = cache.consumer_stats("test:a").unwrap();
        assert_eq!(second.hits, 2);
        assert_eq!(second.first_access, first.first_access);
        assert!(second.last_access >= first.last_access);
        assert_eq!(cache.consumer_count(), 1);
    }

    #[test]
    fn test_sweep_unregisters_idle_consumers() {
        let cache = FrameCache::with_session_timeout(Duration::from_millis(0));
        cache.publish(test_frame(1));
        let _ = cache.acquire("test:leaky");
        // Zero timeout: the record is immediately idle.
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.consumer_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_consumers() {
        let cache = FrameCache::with_session_timeout(Duration::from_secs(60));
        cache.publish(test_frame(1));
        let _ = cache.acquire("test:active");
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.consumer_count(), 1);
    }
}
