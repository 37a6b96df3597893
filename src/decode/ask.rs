//! ASK/EM4100 decoder: biphase decode and frame alignment
//!
//! Two decode conventions run against the same symbol stream. The
//! primary pass turns Long/Short intervals into bits with the flip
//! rule; the alignment pass re-derives the frame from half-bit level
//! pairs. A frame survives only when both conventions agree; the
//! double check was tuned against real tag noise and is kept.

use tracing::trace;

use super::sync::AskSymbol;
use super::types::{DecodeError, Em4100Frame};

pub const EM4100_FRAME_BITS: usize = 64;
const HEADER_ONES: usize = 9;

/// Primary biphase decode: a Long interval flips the running bit value
/// and emits it; two consecutive Shorts emit the value unchanged; a lone
/// Short is held pending. An Invalid interval clears the pending half
/// without emitting or aborting. A Long that arrives with a half pending
/// is a phase slip; the pending half is dropped and the stream relocks.
pub fn primary_bits(symbols: &[AskSymbol]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(symbols.len() / 2 + 1);
    let mut cur = 1u8;
    let mut pending = false;
    for &s in symbols {
        match s {
            AskSymbol::Short => {
                if pending {
                    bits.push(cur);
                    pending = false;
                } else {
                    pending = true;
                }
            }
            AskSymbol::Long => {
                pending = false;
                cur ^= 1;
                bits.push(cur);
            }
            AskSymbol::Invalid => {
                pending = false;
            }
        }
    }
    bits
}

/// Decode the symbol stream into 64-bit frame candidates. The primary
/// decode proposes a frame at every header position it sees; the legacy
/// alignment pass must re-derive a frame from half-bit pairs for it to
/// survive. A header run longer than nine ones leaves more than one
/// agreed alignment, so the candidates are returned in scan order for
/// the validator to settle.
pub fn decode_frames(symbols: &[AskSymbol]) -> Result<Vec<Em4100Frame>, DecodeError> {
    let bits = primary_bits(symbols);
    let inverted: Vec<u8> = bits.iter().map(|b| b ^ 1).collect();
    let mut primaries = frames_at_headers(&bits);
    primaries.extend(frames_at_headers(&inverted));
    if primaries.is_empty() {
        return Err(DecodeError::HeaderNotFound);
    }

    let mut aligned = Vec::new();
    for candidate in alignment_candidates(symbols) {
        aligned.extend(frames_at_headers(&candidate));
    }
    let mut agreed: Vec<Em4100Frame> = Vec::new();
    for frame in &primaries {
        if aligned.contains(frame) && !agreed.contains(frame) {
            agreed.push(*frame);
        }
    }
    if agreed.is_empty() {
        trace!("alignment pass disagrees with primary decode");
        return Err(DecodeError::AlignmentMismatch);
    }
    Ok(agreed)
}

/// Collect a frame at every run of nine header ones with 55 more bits
/// after it.
fn frames_at_headers(bits: &[u8]) -> Vec<Em4100Frame> {
    let mut frames = Vec::new();
    if bits.len() < EM4100_FRAME_BITS {
        return frames;
    }
    for start in 0..=bits.len() - EM4100_FRAME_BITS {
        if bits[start..start + HEADER_ONES].iter().all(|&b| b == 1) {
            let mut frame = [0u8; EM4100_FRAME_BITS];
            frame.copy_from_slice(&bits[start..start + EM4100_FRAME_BITS]);
            frames.push(frame);
        }
    }
    frames
}

/// Expand intervals into half-bit levels (Short covers one half, Long
/// two) and pair them with the legacy rule. Invalid intervals split the
/// stream; each resulting segment contributes candidates for both
/// pairing phases and both level polarities.
fn alignment_candidates(symbols: &[AskSymbol]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut halves: Vec<u8> = Vec::new();
    let mut level = 1u8;
    for &s in symbols {
        match s {
            AskSymbol::Short => {
                halves.push(level);
                level ^= 1;
            }
            AskSymbol::Long => {
                halves.push(level);
                halves.push(level);
                level ^= 1;
            }
            AskSymbol::Invalid => {
                push_candidates(&halves, &mut out);
                halves.clear();
                level = 1;
            }
        }
    }
    push_candidates(&halves, &mut out);
    out
}

fn push_candidates(halves: &[u8], out: &mut Vec<Vec<u8>>) {
    if halves.len() < 2 * EM4100_FRAME_BITS {
        return;
    }
    for phase in 0..2usize {
        for polarity in 0..2u8 {
            if let Some(bits) = pair_halves(&halves[phase..], polarity) {
                out.push(bits);
            }
        }
    }
}

/// Legacy pairing: `(0,1) -> 0`, `(1,0) -> 1`; anything else aborts the
/// candidate.
fn pair_halves(halves: &[u8], polarity: u8) -> Option<Vec<u8>> {
    let mut bits = Vec::with_capacity(halves.len() / 2);
    for pair in halves.chunks_exact(2) {
        match (pair[0] ^ polarity, pair[1] ^ polarity) {
            (0, 1) => bits.push(0),
            (1, 0) => bits.push(1),
            _ => return None,
        }
    }
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::sync::ask_symbols;
    use crate::hw::sim::{em4100_frame, em4100_ticks};

    #[test]
    fn primary_rule_flips_and_pairs() {
        use AskSymbol::{Long, Short};
        // Two shorts repeat the value, a long flips it.
        let bits = primary_bits(&[Short, Short, Short, Short, Long, Long, Short, Short]);
        assert_eq!(bits, vec![1, 1, 0, 1, 1]);
    }

    #[test]
    fn invalid_symbol_clears_pending_half() {
        use AskSymbol::{Invalid, Short};
        // The pending short before the invalid must not pair with the
        // short after it.
        let bits = primary_bits(&[Short, Invalid, Short, Short]);
        assert_eq!(bits, vec![1]);
    }

    #[test]
    fn round_trip_recovers_frame() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let symbols = ask_symbols(&em4100_ticks(&frame, 3));
        assert!(decode_frames(&symbols).unwrap().contains(&frame));
    }

    #[test]
    fn long_header_run_keeps_true_alignment_in_candidates() {
        // Version 0xA5 makes the first data bit 1, so the apparent
        // header run is ten ones and a shifted alignment also agrees.
        let frame = em4100_frame(0xA5, 0xF2A6_FBE4);
        let symbols = ask_symbols(&em4100_ticks(&frame, 6));
        let agreed = decode_frames(&symbols).unwrap();
        assert!(agreed.len() > 1);
        assert!(agreed.contains(&frame));
    }

    #[test]
    fn corrupt_interval_splits_but_still_decodes() {
        let frame = em4100_frame(0x7F, 0xDEAD_BEEF);
        let mut ticks = em4100_ticks(&frame, 1);
        // Garbage between the first repeat and two clean ones.
        ticks.push(5_000);
        ticks.extend(em4100_ticks(&frame, 3));
        let symbols = ask_symbols(&ticks);
        assert!(decode_frames(&symbols).unwrap().contains(&frame));
    }

    #[test]
    fn all_long_stream_has_no_header() {
        let symbols = vec![AskSymbol::Long; 600];
        assert_eq!(decode_frames(&symbols), Err(DecodeError::HeaderNotFound));
    }

    #[test]
    fn too_short_stream_has_no_header() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let ticks = em4100_ticks(&frame, 1);
        // A single truncated repeat never yields 64 aligned bits.
        let symbols = ask_symbols(&ticks[..40]);
        assert!(decode_frames(&symbols).is_err());
    }
}
