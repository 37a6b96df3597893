//! Simulated front-end: scripted edges for the binary and tests
//!
//! Stands in for the counter peripheral and the analog front-end.
//! `arm` replays the next scripted tick sequence for the active trigger
//! mode as a burst of edge timestamps, the way the real trigger fires
//! during a window. The synthesizers below build valid EM4100 and HID
//! tick streams for any supported card.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::{EdgeCallback, EdgeCounter, FrontendControl, TriggerMode};
use crate::decode::validate::{HID26_HEADER, HID35_HEADER, HID37_HEADER};

// Nominal tick durations emitted by the synthesizers, centered in the
// classifier windows (`decode::sync`).
pub const EM_HALF_TICKS: u32 = 1024;
pub const EM_FULL_TICKS: u32 = 2048;
pub const FSK_ZERO_TICKS: u32 = 320;
pub const FSK_ONE_TICKS: u32 = 256;

/// Per-mode script: explicit windows first, then an optional looping tail.
#[derive(Default)]
struct Script {
    windows: VecDeque<Vec<u32>>,
    looping: Option<Vec<u32>>,
}

impl Script {
    fn next_window(&mut self) -> Vec<u32> {
        self.windows
            .pop_front()
            .or_else(|| self.looping.clone())
            .unwrap_or_default()
    }
}

/// Scripted edge counter.
pub struct SimCounter {
    mode: TriggerMode,
    ask: Script,
    fsk: Script,
    callback: Option<EdgeCallback>,
    now: u32,
}

impl SimCounter {
    pub fn new() -> Self {
        Self {
            mode: TriggerMode::Fsk,
            ask: Script::default(),
            fsk: Script::default(),
            callback: None,
            now: 0x1000,
        }
    }

    /// Queue the tick sequence for one capture window of a mode.
    pub fn push_window(&mut self, mode: TriggerMode, ticks: Vec<u32>) {
        self.script_mut(mode).windows.push_back(ticks);
    }

    /// Ticks replayed for every window of a mode once the queue drains.
    pub fn loop_ticks(&mut self, mode: TriggerMode, ticks: Vec<u32>) {
        self.script_mut(mode).looping = Some(ticks);
    }

    fn script_mut(&mut self, mode: TriggerMode) -> &mut Script {
        match mode {
            TriggerMode::Ask => &mut self.ask,
            TriggerMode::Fsk => &mut self.fsk,
        }
    }

    /// Counter replaying built-in demo cards: an HID-26 tag on the FSK
    /// polarity and an EM4100 tag on the ASK polarity.
    pub fn demo_card() -> Self {
        let frame = em4100_frame(0x2A, 0x0012_3456);
        let mut sim = Self::new();
        sim.loop_ticks(TriggerMode::Ask, em4100_ticks(&frame, 6));
        sim.loop_ticks(TriggerMode::Fsk, hid_ticks(hid26_payload(12, 4567), 2));
        sim
    }

    /// Counter replaying a whitespace-separated tick dump on both modes.
    pub fn from_replay(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;
        let ticks = text
            .split_whitespace()
            .map(|w| {
                w.parse::<u32>()
                    .with_context(|| format!("bad tick value {w:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut sim = Self::new();
        sim.loop_ticks(TriggerMode::Ask, ticks.clone());
        sim.loop_ticks(TriggerMode::Fsk, ticks);
        Ok(sim)
    }
}

impl Default for SimCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeCounter for SimCounter {
    fn configure_trigger(&mut self, mode: TriggerMode) {
        self.mode = mode;
    }

    fn capture_now(&self) -> u32 {
        self.now
    }

    fn set_edge_callback(&mut self, cb: EdgeCallback) {
        self.callback = Some(cb);
    }

    fn arm(&mut self) {
        let ticks = match self.mode {
            TriggerMode::Ask => self.ask.next_window(),
            TriggerMode::Fsk => self.fsk.next_window(),
        };
        if ticks.is_empty() {
            return;
        }
        let Some(cb) = self.callback.as_mut() else {
            return;
        };
        // Reference edge first; the driver records it without a delta.
        let mut now = self.now.wrapping_add(5_000);
        cb(now);
        for t in ticks {
            now = now.wrapping_add(t);
            cb(now);
        }
        self.now = now;
    }

    fn disarm(&mut self) {}
}

/// Front-end state shared with tests: the reader owns the front-end, so
/// inspection goes through atomics.
#[derive(Debug)]
pub struct SimFrontendState {
    pub enabled: AtomicBool,
    pub clk_alive: AtomicBool,
    /// Number of standby transitions (one per power cycle).
    pub power_cycles: AtomicU32,
}

pub struct SimFrontend {
    state: Arc<SimFrontendState>,
}

impl SimFrontend {
    pub fn new() -> Self {
        Self::with_clock(true)
    }

    pub fn with_clock(alive: bool) -> Self {
        Self {
            state: Arc::new(SimFrontendState {
                enabled: AtomicBool::new(false),
                clk_alive: AtomicBool::new(alive),
                power_cycles: AtomicU32::new(0),
            }),
        }
    }

    pub fn state(&self) -> Arc<SimFrontendState> {
        self.state.clone()
    }
}

impl Default for SimFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendControl for SimFrontend {
    fn set_enable(&mut self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.state.power_cycles.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn clk_check(&mut self) -> bool {
        self.state.clk_alive.load(Ordering::SeqCst)
    }
}

/// Build a valid EM4100 frame from a version/customer byte and 32-bit
/// card data: 9-bit header, ten rows of four data bits plus even row
/// parity, four column parity bits, stop bit.
pub fn em4100_frame(version: u8, data: u32) -> [u8; 64] {
    let mut nibbles = [0u8; 10];
    nibbles[0] = version >> 4;
    nibbles[1] = version & 0xF;
    for (i, nib) in nibbles.iter_mut().skip(2).enumerate() {
        *nib = ((data >> (28 - 4 * i)) & 0xF) as u8;
    }

    let mut frame = [0u8; 64];
    for b in frame.iter_mut().take(9) {
        *b = 1;
    }
    for (r, nib) in nibbles.iter().enumerate() {
        let base = 9 + 5 * r;
        let mut parity = 0u8;
        for c in 0..4 {
            let bit = (nib >> (3 - c)) & 1;
            frame[base + c] = bit;
            parity ^= bit;
        }
        frame[base + 4] = parity;
    }
    for c in 0..4 {
        let mut parity = 0u8;
        for r in 0..10 {
            parity ^= frame[9 + 5 * r + c];
        }
        frame[59 + c] = parity;
    }
    frame[63] = 0;
    frame
}

/// Expand a frame into Manchester edge intervals: each bit is a pair of
/// opposite half-bit levels, and equal adjacent halves merge into one
/// full-bit interval. `repeats` back-to-back copies, as a tag streams
/// them.
pub fn em4100_ticks(frame: &[u8; 64], repeats: usize) -> Vec<u32> {
    let mut halves: Vec<u8> = Vec::with_capacity(repeats * 128);
    for _ in 0..repeats {
        for &b in frame {
            halves.push(b);
            halves.push(b ^ 1);
        }
    }
    let mut ticks = Vec::new();
    let mut i = 0;
    while i < halves.len() {
        if i + 1 < halves.len() && halves[i + 1] == halves[i] {
            ticks.push(EM_FULL_TICKS);
            i += 2;
        } else {
            ticks.push(EM_HALF_TICKS);
            i += 1;
        }
    }
    ticks
}

/// Compose a 26-bit HID payload (8-bit facility, 16-bit card number)
/// with even/odd parity halves and the 26-bit header constant.
pub fn hid26_payload(facility: u8, card: u16) -> u64 {
    let data = ((facility as u32) << 16) | card as u32;
    let mut w = data << 1;
    let even = ((w >> 13) & 0xFFF).count_ones() % 2;
    w |= even << 25;
    let odd = ((w >> 1) & 0xFFF).count_ones() % 2;
    w |= u32::from(odd == 0);
    (HID26_HEADER << 26) | w as u64
}

/// Compose a 35-bit HID payload (12-bit facility, 20-bit card number).
pub fn hid35_payload(facility: u16, card: u32) -> u64 {
    let mut w = ((facility as u64 & 0xFFF) << 21) | ((card as u64 & 0xF_FFFF) << 1);
    let even = ((w >> 18) & 0xFFFF).count_ones() % 2;
    w |= (even as u64) << 34;
    let odd = ((w >> 1) & 0x1_FFFF).count_ones() % 2;
    w |= u64::from(odd == 0);
    (HID35_HEADER << 35) | w
}

/// Compose a 37-bit HID payload (16-bit facility, 19-bit card number).
pub fn hid37_payload(facility: u16, card: u32) -> u64 {
    let mut w = ((facility as u64) << 20) | ((card as u64 & 0x7_FFFF) << 1);
    let even = ((w >> 19) & 0x1_FFFF).count_ones() % 2;
    w |= (even as u64) << 36;
    let odd = ((w >> 1) & 0x3_FFFF).count_ones() % 2;
    w |= u64::from(odd == 0);
    (HID37_HEADER << 37) | w
}

/// Expand a 44-bit payload into an FSK tick stream: the preamble (16
/// zero symbols, 14 one symbols), then each payload bit as a Manchester
/// pair of five-period tone runs. Adjacent equal runs merge in the
/// symbol stream; the decoder's run-doubling rule recovers them.
pub fn hid_ticks(payload: u64, repeats: usize) -> Vec<u32> {
    let mut ticks = Vec::new();
    for _ in 0..repeats {
        push_run(&mut ticks, 0, 16);
        push_run(&mut ticks, 1, 14);
        for k in (0..44).rev() {
            let bit = ((payload >> k) & 1) as u8;
            let (a, b) = if bit == 1 { (1, 0) } else { (0, 1) };
            push_run(&mut ticks, a, 5);
            push_run(&mut ticks, b, 5);
        }
    }
    ticks
}

fn push_run(ticks: &mut Vec<u32>, symbol: u8, periods: usize) {
    let t = if symbol == 0 {
        FSK_ZERO_TICKS
    } else {
        FSK_ONE_TICKS
    };
    ticks.extend(std::iter::repeat(t).take(periods));
}
