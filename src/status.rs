// Worker → shell status transport: a bounded latest-wins channel with
// one slot per event kind. The sender overwrites a pending event of
// the same kind instead of queuing, so the UI never lags behind
// reality and never back-pressures the worker. Among distinct kinds,
// delivery preserves emission order via a sequence number.
//
// Events are serde-serializable: the worker process writes them as
// JSON lines on its status pipe.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scanner::ScannerState;

/// Event kinds carried to the shell. One slot each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    StatusChanged {
        state: ScannerState,
    },
    Match {
        template_id: u64,
        center: (i32, i32),
        score: f32,
        scale: f32,
    },
    Click {
        screen: (i32, i32),
        client: (i32, i32),
    },
    Error {
        error_kind: String,
        detail: String,
    },
    PerfTick {
        fps: f32,
        cpu_percent: f32,
        mem_mb: f32,
    },
}

const KIND_COUNT: usize = 5;

fn kind_index(event: &StatusEvent) -> usize {
    match event {
        StatusEvent::StatusChanged { .. } => 0,
        StatusEvent::Match { .. } => 1,
        StatusEvent::Click { .. } => 2,
        StatusEvent::Error { .. } => 3,
        StatusEvent::PerfTick { .. } => 4,
    }
}

struct Slots {
    /// (sequence, event) per kind; sequence orders delivery across kinds.
    events: [Option<(u64, StatusEvent)>; KIND_COUNT],
    next_seq: u64,
    sender_alive: bool,
}

struct Shared {
    slots: Mutex<Slots>,
    available: Condvar,
}

/// Create a connected latest-wins sender/receiver pair.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let shared = Arc::new(Shared {
        slots: Mutex::new(Slots {
            events: Default::default(),
            next_seq: 0,
            sender_alive: true,
        }),
        available: Condvar::new(),
    });
    (
        StatusSender {
            shared: Arc::clone(&shared),
        },
        StatusReceiver { shared },
    )
}

#[derive(Clone)]
pub struct StatusSender {
    shared: Arc<Shared>,
}

impl StatusSender {
    /// Publish an event. Never blocks: a pending event of the same
    /// kind is overwritten.
    pub fn send(&self, event: StatusEvent) {
        let idx = kind_index(&event);
        let mut slots = self.shared.slots.lock().expect("status mutex poisoned");
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.events[idx] = Some((seq, event));
        drop(slots);
        self.shared.available.notify_one();
    }
}

impl Drop for StatusSender {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) <= 2 {
            // Last sender clone going away: unblock the receiver.
            let mut slots = self.shared.slots.lock().expect("status mutex poisoned");
            slots.sender_alive = false;
            drop(slots);
            self.shared.available.notify_all();
        }
    }
}

pub struct StatusReceiver {
    shared: Arc<Shared>,
}

impl StatusReceiver {
    /// Take the oldest pending event, if any.
    pub fn try_recv(&self) -> Option<StatusEvent> {
        let mut slots = self.shared.slots.lock().expect("status mutex poisoned");
        Self::take_oldest(&mut slots)
    }

    /// Wait up to `timeout` for an event. `None` on timeout or when
    /// every sender is gone with nothing pending.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StatusEvent> {
        let mut slots = self.shared.slots.lock().expect("status mutex poisoned");
        loop {
            if let Some(event) = Self::take_oldest(&mut slots) {
                return Some(event);
            }
            if !slots.sender_alive {
                return None;
            }
            let (guard, result) = self
                .shared
                .available
                .wait_timeout(slots, timeout)
                .expect("status mutex poisoned");
            slots = guard;
            if result.timed_out() {
                return Self::take_oldest(&mut slots);
            }
        }
    }

    fn take_oldest(slots: &mut Slots) -> Option<StatusEvent> {
        let idx = slots
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|(seq, _)| (*seq, i)))
            .min()
            .map(|(_, i)| i)?;
        slots.events[idx].take().map(|(_, event)| event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(fps: f32) -> StatusEvent {
        StatusEvent::PerfTick {
            fps,
            cpu_percent: 0.0,
            mem_mb: 0.0,
        }
    }

    #[test]
    fn test_same_kind_overwrites() {
        let (tx, rx) = status_channel();
        tx.send(perf(10.0));
        tx.send(perf(20.0));
        tx.send(perf(30.0));

        // Only the most recent PerfTick survives.
        assert_eq!(rx.try_recv(), Some(perf(30.0)));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_distinct_kinds_preserve_order() {
        let (tx, rx) = status_channel();
        tx.send(StatusEvent::StatusChanged {
            state: ScannerState::Scanning,
        });
        tx.send(StatusEvent::Match {
            template_id: 1,
            center: (10, 20),
            score: 0.95,
            scale: 1.0,
        });
        tx.send(StatusEvent::Click {
            screen: (110, 220),
            client: (100, 200),
        });

        assert!(matches!(
            rx.try_recv(),
            Some(StatusEvent::StatusChanged { .. })
        ));
        assert!(matches!(rx.try_recv(), Some(StatusEvent::Match { .. })));
        assert!(matches!(rx.try_recv(), Some(StatusEvent::Click { .. })));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_sender_never_blocks() {
        let (tx, rx) = status_channel();
        // An undrained receiver must not stall the worker.
        for i in 0..10_000 {
            tx.send(perf(i as f32));
        }
        assert_eq!(rx.try_recv(), Some(perf(9999.0)));
    }

    #[test]
    fn test_recv_timeout_times_out_empty() {
        let (_tx, rx) = status_channel();
        let start = std::time::Instant::now();
        assert_eq!(rx.recv_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_recv_returns_none_when_sender_dropped() {
        let (tx, rx) = status_channel();
        tx.send(perf(1.0));
        drop(tx);
        // Pending event still delivered, then a clean end-of-stream.
        assert_eq!(rx.try_recv(), Some(perf(1.0)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), None);
    }

    #[test]
    fn test_events_serialize_as_tagged_json() {
        let json = serde_json::to_string(&StatusEvent::Error {
            error_kind: "capture_unavailable".into(),
            detail: "minimized".into(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"error\""));
        let back: StatusEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, StatusEvent::Error { .. }));
    }
}
