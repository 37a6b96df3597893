//! Card data model and decode error taxonomy

use serde::Serialize;
use thiserror::Error;

/// Wire format a card was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardFormat {
    Em4100,
    Hid26,
    Hid35,
    Hid37,
}

impl CardFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardFormat::Em4100 => "EM4100",
            CardFormat::Hid26 => "HID-26",
            CardFormat::Hid35 => "HID-35",
            CardFormat::Hid37 => "HID-37",
        }
    }
}

/// A 64-bit EM4100 frame as individual bits; index 0 is the first
/// header bit.
pub type Em4100Frame = [u8; 64];

/// Fold a bit slice (MSB first) into a word. Callers guarantee at most
/// 64 bits.
pub fn bits_to_u64(bits: &[u8]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | b as u64)
}

/// A validated card read. Immutable; produced once per accepted frame
/// and handed to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardRecord {
    pub format: CardFormat,
    /// Assembled numeric code.
    pub code: u64,
    /// Raw validated frame/payload bits, for diagnostics.
    pub raw: u64,
    /// True when the immediately preceding accepted read on the same
    /// trigger mode produced the same code.
    pub duplicate: bool,
}

impl CardRecord {
    pub fn raw_hex(&self) -> String {
        hex::encode(self.raw.to_be_bytes())
    }
}

/// Soft decode failures. Every variant is retryable on the next poll
/// cycle; none are surfaced past the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("too few edges captured ({0})")]
    TooFewTicks(usize),
    #[error("frame header not found")]
    HeaderNotFound,
    #[error("frame truncated before the payload completed")]
    Truncated,
    #[error("primary decode and alignment pass disagree")]
    AlignmentMismatch,
    #[error("invalid bit pairing in payload")]
    BadPairing,
    #[error("parity check failed")]
    ParityError,
}
