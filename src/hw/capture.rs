//! Capture driver: edge intervals into the tick buffer
//!
//! The edge callback runs in trigger context and only appends; decoding
//! happens after `end_capture` returns. The handoff is a bounded SPSC
//! channel, so no locking is needed between the two contexts as long as
//! the buffer is only read after the window closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use tracing::{debug, trace};

use super::{EdgeCounter, TriggerMode};

/// Fixed tick buffer capacity per capture window.
pub const TICK_CAPACITY: usize = 1024;

/// Capture counters (atomic for cross-thread stats reads).
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub windows_opened: AtomicU64,
    pub edges_captured: AtomicU64,
    /// Edges arriving after the buffer filled; the window effectively
    /// ended early, which counts as a full capture.
    pub edges_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Owns the tick buffer and the counter peripheral for one reader.
pub struct CaptureDriver<C: EdgeCounter> {
    counter: C,
    ticks: Vec<u32>,
    rx: Option<Receiver<u32>>,
    active: bool,
    stats: Arc<CaptureStats>,
}

impl<C: EdgeCounter> CaptureDriver<C> {
    pub fn new(counter: C, stats: Arc<CaptureStats>) -> Self {
        Self {
            counter,
            ticks: Vec::with_capacity(TICK_CAPACITY),
            rx: None,
            active: false,
            stats,
        }
    }

    /// Arm the edge trigger and return immediately; edges accumulate
    /// until `end_capture`. Overlapping windows are a controller bug.
    pub fn begin_capture(&mut self, mode: TriggerMode) {
        assert!(!self.active, "begin_capture while a window is active");
        self.ticks.clear();

        let (tx, rx) = bounded::<u32>(TICK_CAPACITY);
        self.rx = Some(rx);

        let stats = self.stats.clone();
        let mut last: Option<u32> = None;
        self.counter.configure_trigger(mode);
        self.counter.set_edge_callback(Box::new(move |now: u32| {
            // Trigger context: compute the delta and hand it off, nothing else.
            let Some(prev) = last.replace(now) else {
                return;
            };
            let delta = now.wrapping_sub(prev);
            match tx.try_send(delta) {
                Ok(()) => {
                    stats.edges_captured.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    stats.edges_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }));

        self.stats.windows_opened.fetch_add(1, Ordering::Relaxed);
        self.active = true;
        self.counter.arm();
        trace!(?mode, "capture window armed");
    }

    /// Disarm the trigger and drain the handoff channel into the tick
    /// buffer. Returns the number of ticks captured; the caller decides
    /// whether that is enough to decode.
    pub fn end_capture(&mut self) -> usize {
        assert!(self.active, "end_capture without an active window");
        self.counter.disarm();
        self.active = false;

        if let Some(rx) = self.rx.take() {
            while let Ok(delta) = rx.try_recv() {
                if self.ticks.len() >= TICK_CAPACITY {
                    break;
                }
                self.ticks.push(delta);
            }
        }
        debug!(ticks = self.ticks.len(), "capture window closed");
        self.ticks.len()
    }

    /// Tick buffer of the last closed window, mutable so the glitch
    /// filter can rewrite it in place.
    pub fn ticks_mut(&mut self) -> &mut [u32] {
        assert!(!self.active, "tick buffer read during capture");
        &mut self.ticks
    }
}
