//! Receiver controller: mode dispatch, retry, and front-end recovery
//!
//! One poll cycle is strictly sequential: an FSK window first, then on
//! decode failure a fresh ASK window. Soft failures and "no card" look
//! identical to the caller; only a validated record is surfaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::decode::types::{CardRecord, DecodeError};
use crate::decode::validate::FrameValidator;
use crate::decode::{self, DecodeStats};
use crate::hw::capture::{CaptureDriver, CaptureStats};
use crate::hw::{EdgeCounter, FrontendControl, TriggerMode};

/// Consecutive failed front-end recoveries before the reader gives up.
const MAX_RECOVERIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("analog front-end unavailable after {attempts} recovery attempts")]
    HardwareUnavailable { attempts: u32 },
}

/// Outcome of a single capture/decode attempt on one trigger mode.
#[derive(Debug)]
enum AttemptOutcome {
    /// Too few edges; nothing in the field.
    NoCard,
    /// Edges captured but no valid frame; worth trying the other mode.
    Failed(DecodeError),
    Decoded(CardRecord),
    /// Zero edges and a dead clock line; the front-end needs a power
    /// cycle before the next attempt.
    FrontendStuck,
}

/// Timing knobs for the poll cycle.
#[derive(Debug, Clone)]
pub struct ReaderTiming {
    pub fsk_window: Duration,
    pub ask_window: Duration,
    pub poll_interval: Duration,
}

impl Default for ReaderTiming {
    fn default() -> Self {
        Self {
            fsk_window: Duration::from_millis(100),
            ask_window: Duration::from_millis(250),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Card reader instance: owns the capture driver, the front-end control
/// lines, and the validator history.
pub struct ProxReader<C: EdgeCounter, F: FrontendControl> {
    driver: CaptureDriver<C>,
    frontend: F,
    validator: FrameValidator,
    timing: ReaderTiming,
    reboot_pending: bool,
    failed_recoveries: u32,
    capture_stats: Arc<CaptureStats>,
    decode_stats: Arc<DecodeStats>,
}

impl<C: EdgeCounter, F: FrontendControl> ProxReader<C, F> {
    pub fn new(counter: C, frontend: F, timing: ReaderTiming) -> Self {
        let capture_stats = CaptureStats::new();
        Self {
            driver: CaptureDriver::new(counter, capture_stats.clone()),
            frontend,
            validator: FrameValidator::new(),
            timing,
            reboot_pending: false,
            failed_recoveries: 0,
            capture_stats,
            decode_stats: DecodeStats::new(),
        }
    }

    pub fn capture_stats(&self) -> Arc<CaptureStats> {
        self.capture_stats.clone()
    }

    pub fn decode_stats(&self) -> Arc<DecodeStats> {
        self.decode_stats.clone()
    }

    /// Wake the front-end and wait out the oscillator settle time.
    pub fn power_up(&mut self) {
        self.frontend.set_enable(true);
        thread::sleep(self.frontend.settle_delay());
    }

    /// One full Idle -> ... -> Idle poll cycle. Soft failures and "no
    /// card present" are both `Ok(None)`.
    pub fn receive_once(&mut self) -> Result<Option<CardRecord>, ReaderError> {
        if self.reboot_pending {
            self.recover()?;
        }

        match self.attempt(TriggerMode::Fsk) {
            AttemptOutcome::Decoded(record) => {
                self.failed_recoveries = 0;
                return Ok(Some(record));
            }
            AttemptOutcome::NoCard => return Ok(None),
            AttemptOutcome::FrontendStuck => {
                self.reboot_pending = true;
                return Ok(None);
            }
            AttemptOutcome::Failed(err) => {
                trace!(%err, "FSK attempt failed, falling back to ASK");
            }
        }

        match self.attempt(TriggerMode::Ask) {
            AttemptOutcome::Decoded(record) => {
                self.failed_recoveries = 0;
                Ok(Some(record))
            }
            AttemptOutcome::NoCard => Ok(None),
            AttemptOutcome::FrontendStuck => {
                self.reboot_pending = true;
                Ok(None)
            }
            AttemptOutcome::Failed(err) => {
                trace!(%err, "ASK attempt failed");
                Ok(None)
            }
        }
    }

    /// Open one capture window on the given mode and decode it.
    fn attempt(&mut self, mode: TriggerMode) -> AttemptOutcome {
        let window = match mode {
            TriggerMode::Fsk => self.timing.fsk_window,
            TriggerMode::Ask => self.timing.ask_window,
        };
        self.driver.begin_capture(mode);
        thread::sleep(window);
        let count = self.driver.end_capture();

        if count == 0 {
            // A live demodulator always produces carrier edges; check
            // the clock line before concluding "no card".
            if !self.frontend.clk_check() {
                warn!("demodulator clock line stuck");
                return AttemptOutcome::FrontendStuck;
            }
            return AttemptOutcome::NoCard;
        }
        if count < decode::MIN_VIABLE_TICKS {
            trace!(count, "capture below viable minimum");
            return AttemptOutcome::NoCard;
        }

        let ticks = self.driver.ticks_mut();
        let result = match mode {
            TriggerMode::Ask => {
                decode::decode_ask_attempt(ticks, &mut self.validator, &self.decode_stats)
            }
            TriggerMode::Fsk => {
                decode::decode_fsk_attempt(ticks, &mut self.validator, &self.decode_stats)
            }
        };
        match result {
            Ok(record) => AttemptOutcome::Decoded(record),
            Err(DecodeError::TooFewTicks(_)) => AttemptOutcome::NoCard,
            Err(err) => AttemptOutcome::Failed(err),
        }
    }

    /// Power-cycle the front-end through its enable line. Bounded: after
    /// `MAX_RECOVERIES` consecutive failures the reader reports the
    /// hardware unavailable instead of retrying forever.
    fn recover(&mut self) -> Result<(), ReaderError> {
        info!("power-cycling analog front-end");
        self.frontend.set_enable(false);
        thread::sleep(self.frontend.settle_delay());
        self.frontend.set_enable(true);
        thread::sleep(self.frontend.settle_delay());
        self.reboot_pending = false;

        if self.frontend.clk_check() {
            info!("front-end recovered");
            self.failed_recoveries = 0;
            Ok(())
        } else {
            self.failed_recoveries += 1;
            warn!(attempts = self.failed_recoveries, "front-end recovery failed");
            if self.failed_recoveries >= MAX_RECOVERIES {
                Err(ReaderError::HardwareUnavailable {
                    attempts: self.failed_recoveries,
                })
            } else {
                self.reboot_pending = true;
                Ok(())
            }
        }
    }
}

/// Handle to a running poll loop.
pub struct ReaderHandle {
    running: Arc<AtomicBool>,
    pub capture_stats: Arc<CaptureStats>,
    pub decode_stats: Arc<DecodeStats>,
}

impl ReaderHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: EdgeCounter + 'static, F: FrontendControl + 'static> ProxReader<C, F> {
    /// Spawn the poll loop on a dedicated thread; decoded cards arrive
    /// on the returned channel. The loop stops on `ReaderHandle::stop`,
    /// on a persistent hardware fault, or when the receiver is dropped.
    pub fn start(mut self) -> anyhow::Result<(ReaderHandle, mpsc::Receiver<CardRecord>)> {
        let (tx, rx) = mpsc::channel::<CardRecord>(64);
        let running = Arc::new(AtomicBool::new(true));
        let handle = ReaderHandle {
            running: running.clone(),
            capture_stats: self.capture_stats.clone(),
            decode_stats: self.decode_stats.clone(),
        };

        self.power_up();
        thread::Builder::new()
            .name("prox-poll".to_string())
            .spawn(move || {
                info!("card poll loop started");
                while running.load(Ordering::SeqCst) {
                    match self.receive_once() {
                        Ok(Some(record)) => {
                            if tx.blocking_send(record).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("reader stopped: {err}");
                            break;
                        }
                    }
                    thread::sleep(self.timing.poll_interval);
                }
                running.store(false, Ordering::SeqCst);
                info!("card poll loop stopped");
            })
            .context("failed to spawn poll thread")?;

        Ok((handle, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::types::CardFormat;
    use crate::hw::sim::{
        em4100_frame, em4100_ticks, hid26_payload, hid_ticks, SimCounter, SimFrontend,
    };

    fn fast_timing() -> ReaderTiming {
        ReaderTiming {
            fsk_window: Duration::ZERO,
            ask_window: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }

    fn reader_with(counter: SimCounter, frontend: SimFrontend) -> ProxReader<SimCounter, SimFrontend> {
        ProxReader::new(counter, frontend, fast_timing())
    }

    #[test]
    fn fsk_card_decoded_without_ask_fallback() {
        let mut counter = SimCounter::new();
        counter.push_window(TriggerMode::Fsk, hid_ticks(hid26_payload(12, 4567), 2));
        let mut reader = reader_with(counter, SimFrontend::new());

        let record = reader.receive_once().unwrap().unwrap();
        assert_eq!(record.format, CardFormat::Hid26);
        assert_eq!(record.code, 4567);
        // Only the FSK window was opened.
        assert_eq!(
            reader.capture_stats().windows_opened.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn ask_fallback_decodes_em4100() {
        let frame = em4100_frame(0x2A, 0x0012_3456);
        let ticks = em4100_ticks(&frame, 6);
        let mut counter = SimCounter::new();
        // The ASK carrier produces edges on the FSK polarity too; that
        // window decodes to nothing and triggers the fallback.
        counter.push_window(TriggerMode::Fsk, ticks.clone());
        counter.push_window(TriggerMode::Ask, ticks);
        let mut reader = reader_with(counter, SimFrontend::new());

        let record = reader.receive_once().unwrap().unwrap();
        assert_eq!(record.format, CardFormat::Em4100);
        assert_eq!(record.code, 0x2A_0012_3456);
        assert_eq!(
            reader.capture_stats().windows_opened.load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn unreadable_stream_yields_no_card_after_both_paths() {
        // All intervals classify Long on the ASK path and symbol 0 on
        // the FSK path; neither contains a header.
        let mut counter = SimCounter::new();
        counter.push_window(TriggerMode::Fsk, vec![2048; 600]);
        counter.push_window(TriggerMode::Ask, vec![2048; 600]);
        let mut reader = reader_with(counter, SimFrontend::new());

        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(
            reader.capture_stats().windows_opened.load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn below_minimum_capture_is_no_card_without_fallback() {
        let mut counter = SimCounter::new();
        counter.push_window(TriggerMode::Fsk, vec![320; 40]);
        let mut reader = reader_with(counter, SimFrontend::new());

        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(
            reader.capture_stats().windows_opened.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn duplicate_flag_set_on_second_read() {
        let frame = em4100_frame(0x2A, 0x0012_3456);
        let ticks = em4100_ticks(&frame, 6);
        let mut counter = SimCounter::new();
        counter.loop_ticks(TriggerMode::Fsk, ticks.clone());
        counter.loop_ticks(TriggerMode::Ask, ticks);
        let mut reader = reader_with(counter, SimFrontend::new());

        let first = reader.receive_once().unwrap().unwrap();
        let second = reader.receive_once().unwrap().unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
    }

    #[test]
    fn zero_edges_with_live_clock_is_no_card() {
        let counter = SimCounter::new();
        let frontend = SimFrontend::new();
        let state = frontend.state();
        let mut reader = reader_with(counter, frontend);

        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stuck_clock_power_cycles_then_gives_up() {
        let counter = SimCounter::new();
        let frontend = SimFrontend::with_clock(false);
        let state = frontend.state();
        let mut reader = reader_with(counter, frontend);
        reader.power_up();

        // First cycle flags the reboot; nothing is cycled yet.
        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 0);

        // Next cycles each power-cycle the front-end and fail.
        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 1);
        assert!(reader.receive_once().unwrap().is_none());
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 2);

        // The bounded recovery gives up on the third failure.
        let err = reader.receive_once().unwrap_err();
        assert!(matches!(
            err,
            ReaderError::HardwareUnavailable { attempts: 3 }
        ));
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn recovered_front_end_resumes_decoding() {
        let mut counter = SimCounter::new();
        counter.push_window(TriggerMode::Fsk, Vec::new());
        counter.push_window(TriggerMode::Fsk, hid_ticks(hid26_payload(7, 99), 2));
        let frontend = SimFrontend::with_clock(false);
        let state = frontend.state();
        let mut reader = reader_with(counter, frontend);
        reader.power_up();

        // Dead clock on the first cycle flags the reboot.
        assert!(reader.receive_once().unwrap().is_none());
        // The clock comes back before the next poll.
        state.clk_alive.store(true, Ordering::SeqCst);
        let record = reader.receive_once().unwrap().unwrap();
        assert_eq!(record.code, 99);
        assert_eq!(state.power_cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_loop_delivers_records() {
        let mut counter = SimCounter::new();
        counter.push_window(TriggerMode::Fsk, hid_ticks(hid26_payload(12, 4567), 2));
        let reader = reader_with(counter, SimFrontend::new());

        let (handle, mut cards) = reader.start().unwrap();
        let record = cards.recv().await.unwrap();
        assert_eq!(record.code, 4567);
        handle.stop();
    }
}
