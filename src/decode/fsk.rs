//! FSK/HID decoder: run-length decimation and payload extraction

use super::types::DecodeError;

/// Decimated bit cap; the payload needs 88 of these.
pub const FSK_MAX_BITS: usize = 90;
/// Wiegand payload width after pair reduction.
pub const HID_PAYLOAD_BITS: usize = 44;

// Run-length thresholds: one data bit spans about five tone periods;
// symbol doubling at tone transitions merges adjacent runs past eight.
const RUN_ONE_BIT: usize = 4;
const RUN_TWO_BITS: usize = 8;

/// Decimate runs of identical symbols into data bits, starting at the
/// frame offset located by the header search. Runs shorter than a bit
/// period are skipped as carrier noise.
pub fn decimate(symbols: &[u8], start: usize) -> Vec<u8> {
    let mut bits = Vec::with_capacity(FSK_MAX_BITS);
    let mut i = start;
    while i < symbols.len() && bits.len() < FSK_MAX_BITS {
        let v = symbols[i];
        let mut n = 1;
        while i + n < symbols.len() && symbols[i + n] == v {
            n += 1;
        }
        if n >= RUN_ONE_BIT {
            bits.push(v);
        }
        if n > RUN_TWO_BITS && bits.len() < FSK_MAX_BITS {
            bits.push(v);
        }
        i += n;
    }
    bits
}

/// Reduce decimated bits to the 44-bit payload. Consecutive pairs decode
/// `(0,1) -> 0` and `(1,0) -> 1`; any other pairing means the carrier
/// was misread and the whole attempt is discarded.
pub fn reduce_payload(bits: &[u8]) -> Result<u64, DecodeError> {
    if bits.len() < 2 * HID_PAYLOAD_BITS {
        return Err(DecodeError::Truncated);
    }
    let mut payload = 0u64;
    for k in 0..HID_PAYLOAD_BITS {
        let bit = match (bits[2 * k], bits[2 * k + 1]) {
            (0, 1) => 0u64,
            (1, 0) => 1u64,
            _ => return Err(DecodeError::BadPairing),
        };
        payload = (payload << 1) | bit;
    }
    Ok(payload)
}
