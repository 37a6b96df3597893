//! Capture-to-card decode pipeline
//!
//! Stage order: glitch filter -> bit synchronizer -> format decoder ->
//! validator -> assembler. The entry points here run one attempt for one
//! trigger mode over a closed tick buffer; the receiver controller
//! decides what to do with the outcome.

pub mod assemble;
pub mod ask;
pub mod fsk;
pub mod glitch;
pub mod sync;
pub mod types;
pub mod validate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use types::{CardRecord, DecodeError};
use validate::FrameValidator;

use crate::hw::TICK_CAPACITY;

/// Captures below this are treated as "no card present" before any
/// symbol work happens.
pub const MIN_VIABLE_TICKS: usize = TICK_CAPACITY / 2;

/// Decode counters (atomic for cross-thread stats reads).
#[derive(Debug, Default)]
pub struct DecodeStats {
    pub attempts: AtomicU64,
    pub short_captures: AtomicU64,
    pub header_misses: AtomicU64,
    pub alignment_mismatches: AtomicU64,
    pub pairing_errors: AtomicU64,
    pub parity_rejects: AtomicU64,
    pub frames_accepted: AtomicU64,
}

impl DecodeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, result: &Result<CardRecord, DecodeError>) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(_) => &self.frames_accepted,
            Err(DecodeError::TooFewTicks(_)) => &self.short_captures,
            Err(DecodeError::HeaderNotFound | DecodeError::Truncated) => &self.header_misses,
            Err(DecodeError::AlignmentMismatch) => &self.alignment_mismatches,
            Err(DecodeError::BadPairing) => &self.pairing_errors,
            Err(DecodeError::ParityError) => &self.parity_rejects,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One EM4100 decode attempt over a closed tick buffer.
pub fn decode_ask_attempt(
    ticks: &mut [u32],
    validator: &mut FrameValidator,
    stats: &DecodeStats,
) -> Result<CardRecord, DecodeError> {
    let result = run_ask(ticks, validator);
    stats.record(&result);
    result
}

/// One HID decode attempt over a closed tick buffer.
pub fn decode_fsk_attempt(
    ticks: &mut [u32],
    validator: &mut FrameValidator,
    stats: &DecodeStats,
) -> Result<CardRecord, DecodeError> {
    let result = run_fsk(ticks, validator);
    stats.record(&result);
    result
}

fn run_ask(ticks: &mut [u32], validator: &mut FrameValidator) -> Result<CardRecord, DecodeError> {
    if ticks.len() < MIN_VIABLE_TICKS {
        return Err(DecodeError::TooFewTicks(ticks.len()));
    }
    glitch::clean(ticks);
    let symbols = sync::ask_symbols(ticks);
    // The validator settles between agreed alignments; the first frame
    // whose parity matrix checks out wins.
    let mut last = DecodeError::ParityError;
    for frame in ask::decode_frames(&symbols)? {
        match validator.accept_em4100(&frame) {
            Ok(record) => {
                debug!(code = record.code, "ASK attempt accepted");
                return Ok(record);
            }
            Err(err) => last = err,
        }
    }
    Err(last)
}

fn run_fsk(ticks: &mut [u32], validator: &mut FrameValidator) -> Result<CardRecord, DecodeError> {
    if ticks.len() < MIN_VIABLE_TICKS {
        return Err(DecodeError::TooFewTicks(ticks.len()));
    }
    glitch::clean(ticks);
    let symbols = sync::fsk_symbols(ticks);
    let start = sync::find_fsk_header(&symbols).ok_or(DecodeError::HeaderNotFound)?;
    let bits = fsk::decimate(&symbols, start);
    let payload = fsk::reduce_payload(&bits)?;
    let record = validator.accept_hid(payload)?;
    debug!(code = record.code, "FSK attempt accepted");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::types::{CardFormat, DecodeError};
    use super::*;
    use crate::hw::sim::{em4100_frame, em4100_ticks, hid26_payload, hid_ticks};

    #[test]
    fn em4100_round_trip_through_pipeline() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let mut ticks = em4100_ticks(&frame, 6);
        assert!(ticks.len() >= MIN_VIABLE_TICKS);

        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        let record = decode_ask_attempt(&mut ticks, &mut validator, &stats).unwrap();
        assert_eq!(record.format, CardFormat::Em4100);
        assert_eq!(record.code, 0x2A_1234_5678);
        assert_eq!(stats.frames_accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn hid26_round_trip_through_pipeline() {
        // Known 26-bit test vector: facility 12, card number 4567.
        let mut ticks = hid_ticks(hid26_payload(12, 4567), 2);
        assert!(ticks.len() >= MIN_VIABLE_TICKS);

        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        let record = decode_fsk_attempt(&mut ticks, &mut validator, &stats).unwrap();
        assert_eq!(record.format, CardFormat::Hid26);
        assert_eq!(record.code, 4567);
    }

    #[test]
    fn spurious_tick_absorbed_by_glitch_filter() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let clean_ticks = em4100_ticks(&frame, 6);

        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        for position in [3, 101, 257] {
            let mut noisy = clean_ticks.clone();
            noisy.insert(position, 120);
            let record = decode_ask_attempt(&mut noisy, &mut validator, &stats).unwrap();
            assert_eq!(record.code, 0x2A_1234_5678);
        }
    }

    #[test]
    fn short_capture_rejected_before_symbolization() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let mut ticks = em4100_ticks(&frame, 2);
        ticks.truncate(MIN_VIABLE_TICKS - 1);

        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        let len = ticks.len();
        assert_eq!(
            decode_ask_attempt(&mut ticks, &mut validator, &stats),
            Err(DecodeError::TooFewTicks(len))
        );
        assert_eq!(stats.short_captures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn parity_damage_rejected_end_to_end() {
        let mut frame = em4100_frame(0x2A, 0x1234_5678);
        frame[13] ^= 1; // break one row parity group
        let mut ticks = em4100_ticks(&frame, 6);

        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        assert_eq!(
            decode_ask_attempt(&mut ticks, &mut validator, &stats),
            Err(DecodeError::ParityError)
        );
        assert_eq!(stats.parity_rejects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fsk_stream_without_preamble_misses_header() {
        let mut ticks = vec![320u32; 600];
        let mut validator = FrameValidator::new();
        let stats = DecodeStats::new();
        assert_eq!(
            decode_fsk_attempt(&mut ticks, &mut validator, &stats),
            Err(DecodeError::HeaderNotFound)
        );
        assert_eq!(stats.header_misses.load(Ordering::Relaxed), 1);
    }
}
