use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use beryl_wire::Segment;

/// Invoked with the batch of timed-out segments; the enclosing engine
/// re-serializes and re-sends them. The window never touches the wire.
pub type RetransmitCallback = Arc<dyn Fn(Vec<WindowSegment>) + Send + Sync>;

/// An in-flight record for one admitted segment.
#[derive(Debug, Clone)]
pub struct WindowSegment {
    pub sequence_number: u64,
    pub data: Bytes,
    pub sent_time: Instant,
    pub acked: bool,
    pub original_segment: Segment,
}

struct WindowState {
    base: u64,
    next_seq: u64,
    segments: HashMap<u64, WindowSegment>,
}

struct Inner {
    window_size: u64,
    timeout: Duration,
    state: Mutex<WindowState>,
    // Lock order: timer before state, never both held at once in practice.
    timer: Mutex<Option<JoinHandle<()>>>,
    callback: Mutex<Option<RetransmitCallback>>,
    active: AtomicBool,
}

/// Sender-side sliding window with cumulative-ACK accounting and a
/// single timer-driven retransmission pass over the unacked range.
///
/// Invariant: `base <= next_seq <= base + window_size`, and `base`
/// never decreases.
#[derive(Clone)]
pub struct SlidingWindow {
    inner: Arc<Inner>,
}

impl SlidingWindow {
    /// Callers guarantee a positive window size and timeout; the config
    /// layer enforces both bounds before a window is ever built.
    pub fn new(window_size: u64, timeout: Duration) -> Self {
        assert!(window_size > 0, "window size must be positive");
        assert!(!timeout.is_zero(), "timeout must be positive");
        Self {
            inner: Arc::new(Inner {
                window_size,
                timeout,
                state: Mutex::new(WindowState {
                    base: 0,
                    next_seq: 0,
                    segments: HashMap::new(),
                }),
                timer: Mutex::new(None),
                callback: Mutex::new(None),
                active: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_retransmission_callback(&self, callback: RetransmitCallback) {
        *self.inner.callback.lock().unwrap() = Some(callback);
    }

    /// True iff the window has room for another segment.
    pub fn can_send(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.next_seq < state.base + self.inner.window_size
    }

    /// Admits a segment, assigning it the next window sequence number.
    /// Returns `None` when the window is full. Arms the retransmission
    /// timer if the admitted segment is the new base.
    pub fn add_segment(&self, segment: Segment) -> Option<u64> {
        let (seq, is_base) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.next_seq >= state.base + self.inner.window_size {
                return None;
            }
            let seq = state.next_seq;
            state.segments.insert(
                seq,
                WindowSegment {
                    sequence_number: seq,
                    data: segment.data.clone(),
                    sent_time: Instant::now(),
                    acked: false,
                    original_segment: segment,
                },
            );
            state.next_seq += 1;
            (seq, state.base == seq)
        };
        if is_base {
            self.inner.start_timer();
        }
        Some(seq)
    }

    /// Processes a cumulative ACK: every sequence in `[base, ack]` is
    /// acknowledged and removed, and the base advances. ACKs below the
    /// base or at/above `next_seq` are spurious and ignored, so
    /// duplicate and stale ACKs are no-ops.
    pub fn handle_ack(&self, ack: i64) {
        info!("Received ACK M{ack}");
        let (moved, in_flight) = {
            let mut state = self.inner.state.lock().unwrap();
            if ack < state.base as i64 || ack >= state.next_seq as i64 {
                warn!("Spurious ACK M{ack} ignored");
                return;
            }
            let ack = ack as u64;
            for seq in state.base..=ack {
                if let Some(segment) = state.segments.get_mut(&seq) {
                    segment.acked = true;
                }
            }
            let old_base = state.base;
            while state.base <= ack {
                let base = state.base;
                if !state.segments.get(&base).is_some_and(|segment| segment.acked) {
                    break;
                }
                state.segments.remove(&base);
                state.base += 1;
            }
            (state.base > old_base, state.base < state.next_seq)
        };
        if moved {
            self.inner.stop_timer();
            if in_flight {
                self.inner.start_timer();
            }
        }
    }

    /// True iff no segments remain in the window.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().segments.is_empty()
    }

    pub fn base(&self) -> u64 {
        self.inner.state.lock().unwrap().base
    }

    pub fn next_seq(&self) -> u64 {
        self.inner.state.lock().unwrap().next_seq
    }

    /// Snapshot of every unacknowledged segment in the window.
    pub fn unacked_segments(&self) -> Vec<WindowSegment> {
        let state = self.inner.state.lock().unwrap();
        let mut unacked: Vec<WindowSegment> = state
            .segments
            .values()
            .filter(|segment| !segment.acked)
            .cloned()
            .collect();
        unacked.sort_by_key(|segment| segment.sequence_number);
        unacked
    }

    /// Deactivates the window, cancels the timer, and drops all state.
    pub fn cleanup(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.stop_timer();
        self.inner.state.lock().unwrap().segments.clear();
    }
}

impl Inner {
    fn start_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap();
        if timer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            inner.on_timeout();
        }));
    }

    fn stop_timer(&self) {
        if let Some(task) = self.timer.lock().unwrap().take() {
            task.abort();
        }
    }

    fn on_timeout(self: &Arc<Self>) {
        // This timer has fired; clear the slot so a restart can arm a
        // fresh one.
        *self.timer.lock().unwrap() = None;

        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let expired = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let base = state.base;
            let end = (base + self.window_size).min(state.next_seq);
            let mut expired = Vec::new();
            for seq in base..end {
                if let Some(segment) = state.segments.get_mut(&seq) {
                    if !segment.acked && now.duration_since(segment.sent_time) >= self.timeout {
                        segment.sent_time = now;
                        expired.push(segment.clone());
                    }
                }
            }
            expired
        };

        if !expired.is_empty() {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(expired);
            }
        }

        let pending = {
            let state = self.state.lock().unwrap();
            state.segments.values().any(|segment| !segment.acked)
        };
        if pending {
            self.start_timer();
        }
    }
}
