//! Frame validator: parity matrices and duplicate tracking
//!
//! EM4100 frames carry a 9x5 parity matrix; HID payloads are checked
//! against the three Wiegand layouts in ascending bit-length order.
//! Validation either accepts a frame into a `CardRecord` or rejects the
//! attempt with no partial result.

use tracing::{debug, trace};

use super::assemble;
use super::types::{bits_to_u64, CardFormat, CardRecord, DecodeError, Em4100Frame};
use crate::hw::TriggerMode;

// Fixed header constants above each Wiegand frame within the 44-bit
// payload. Widths 18/9/7 keep the three formats mutually exclusive, and
// each begins with a zero bit so a valid payload never merges into the
// preamble's ones-run.
pub const HID26_HEADER: u64 = 0x00002;
pub const HID35_HEADER: u64 = 0x005;
pub const HID37_HEADER: u64 = 0x07;

/// One Wiegand format: header constant plus the parity split. The even
/// region covers the top `even_span` bits of the frame (parity bit
/// included) and must sum even; the odd region covers the remaining low
/// bits and must sum odd.
struct HidLayout {
    format: CardFormat,
    frame_bits: u32,
    header: u64,
    even_span: u32,
}

// Evaluated in ascending bit-length order; the first passing layout wins.
const HID_LAYOUTS: [HidLayout; 3] = [
    HidLayout {
        format: CardFormat::Hid26,
        frame_bits: 26,
        header: HID26_HEADER,
        even_span: 13,
    },
    HidLayout {
        format: CardFormat::Hid35,
        frame_bits: 35,
        header: HID35_HEADER,
        even_span: 17,
    },
    HidLayout {
        format: CardFormat::Hid37,
        frame_bits: 37,
        header: HID37_HEADER,
        even_span: 18,
    },
];

/// Check the EM4100 parity matrix: header ones, even row parity over
/// each 5-bit group, even column parity over the four data columns, and
/// a zero stop bit.
pub fn check_em4100(frame: &Em4100Frame) -> Result<(), DecodeError> {
    if frame[..9].iter().any(|&b| b != 1) {
        return Err(DecodeError::ParityError);
    }
    for r in 0..10 {
        let row = &frame[9 + 5 * r..9 + 5 * r + 5];
        if row.iter().sum::<u8>() % 2 != 0 {
            trace!(row = r, "EM4100 row parity failed");
            return Err(DecodeError::ParityError);
        }
    }
    for c in 0..4 {
        let mut sum = frame[59 + c];
        for r in 0..10 {
            sum += frame[9 + 5 * r + c];
        }
        if sum % 2 != 0 {
            trace!(column = c, "EM4100 column parity failed");
            return Err(DecodeError::ParityError);
        }
    }
    if frame[63] != 0 {
        return Err(DecodeError::ParityError);
    }
    Ok(())
}

/// Check one Wiegand layout against the payload. Returns the bare frame
/// on success.
fn check_hid(payload: u64, layout: &HidLayout) -> Option<u64> {
    if payload >> layout.frame_bits != layout.header {
        return None;
    }
    let frame = payload & ((1u64 << layout.frame_bits) - 1);
    let even = frame >> (layout.frame_bits - layout.even_span);
    let odd = frame & ((1u64 << (layout.frame_bits - layout.even_span)) - 1);
    if even.count_ones() % 2 != 0 {
        return None;
    }
    if odd.count_ones() % 2 != 1 {
        return None;
    }
    Some(frame)
}

/// Accepts frames into card records and tracks the previous code per
/// trigger mode for duplicate flagging.
#[derive(Debug, Default)]
pub struct FrameValidator {
    last_ask: Option<u64>,
    last_fsk: Option<u64>,
}

impl FrameValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_em4100(&mut self, frame: &Em4100Frame) -> Result<CardRecord, DecodeError> {
        check_em4100(frame)?;
        let code = assemble::em4100_code(frame);
        let duplicate = self.mark(TriggerMode::Ask, code);
        debug!(code, duplicate, "EM4100 frame validated");
        Ok(CardRecord {
            format: CardFormat::Em4100,
            code,
            raw: bits_to_u64(frame),
            duplicate,
        })
    }

    pub fn accept_hid(&mut self, payload: u64) -> Result<CardRecord, DecodeError> {
        for layout in &HID_LAYOUTS {
            if let Some(frame) = check_hid(payload, layout) {
                let code = assemble::hid_code(frame, layout.format);
                let duplicate = self.mark(TriggerMode::Fsk, code);
                debug!(format = layout.format.as_str(), code, duplicate, "HID frame validated");
                return Ok(CardRecord {
                    format: layout.format,
                    code,
                    raw: payload,
                    duplicate,
                });
            }
        }
        Err(DecodeError::ParityError)
    }

    /// Record the code and report whether it repeats the previous accept
    /// on the same trigger mode.
    fn mark(&mut self, mode: TriggerMode, code: u64) -> bool {
        let slot = match mode {
            TriggerMode::Ask => &mut self.last_ask,
            TriggerMode::Fsk => &mut self.last_fsk,
        };
        slot.replace(code) == Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{em4100_frame, hid26_payload, hid35_payload, hid37_payload};

    #[test]
    fn valid_em4100_accepted() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let mut v = FrameValidator::new();
        let record = v.accept_em4100(&frame).unwrap();
        assert_eq!(record.format, CardFormat::Em4100);
        assert_eq!(record.code, 0x2A_1234_5678);
        assert!(!record.duplicate);
    }

    #[test]
    fn any_single_bit_flip_rejects_em4100() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        for i in 0..64 {
            let mut bad = frame;
            bad[i] ^= 1;
            assert_eq!(check_em4100(&bad), Err(DecodeError::ParityError), "bit {i}");
        }
    }

    #[test]
    fn hid_formats_validated_with_codes() {
        let mut v = FrameValidator::new();

        let r = v.accept_hid(hid26_payload(12, 4567)).unwrap();
        assert_eq!(r.format, CardFormat::Hid26);
        assert_eq!(r.code, 4567);

        let r = v.accept_hid(hid35_payload(0x123, 987_654)).unwrap();
        assert_eq!(r.format, CardFormat::Hid35);
        assert_eq!(r.code, 987_654);

        let r = v.accept_hid(hid37_payload(0xBEEF, 0x5_1234)).unwrap();
        assert_eq!(r.format, CardFormat::Hid37);
        assert_eq!(r.code, 0x5_1234);
    }

    #[test]
    fn any_single_bit_flip_rejects_hid() {
        let payload = hid26_payload(12, 4567);
        let mut v = FrameValidator::new();
        for i in 0..44 {
            let bad = payload ^ (1u64 << i);
            assert!(v.accept_hid(bad).is_err(), "bit {i}");
        }
    }

    #[test]
    fn unknown_header_rejected() {
        let mut v = FrameValidator::new();
        assert_eq!(
            v.accept_hid(0xFFF_FFFF_FFFF),
            Err(DecodeError::ParityError)
        );
    }

    #[test]
    fn duplicate_flag_tracks_last_code_per_mode() {
        let frame = em4100_frame(0x2A, 0x1234_5678);
        let other = em4100_frame(0x11, 0x0000_0001);
        let mut v = FrameValidator::new();

        assert!(!v.accept_em4100(&frame).unwrap().duplicate);
        assert!(v.accept_em4100(&frame).unwrap().duplicate);
        assert!(!v.accept_em4100(&other).unwrap().duplicate);

        // FSK history is independent of ASK history.
        let payload = hid26_payload(12, 4567);
        assert!(!v.accept_hid(payload).unwrap().duplicate);
        assert!(v.accept_hid(payload).unwrap().duplicate);
    }
}
