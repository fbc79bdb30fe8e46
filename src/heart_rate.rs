//! # Heart Rate Measurement Module
//!
//! Decodes the Bluetooth GATT Heart Rate Measurement characteristic into
//! `HeartRateSample`s. Works for any standard chest strap or watch that exposes
//! the Heart Rate Service, not only Polar devices.
//!
//! ## Payload Layout
//! ```text
//! byte 0      flags (bit 0: 0 = UINT8 bpm, 1 = UINT16 little-endian bpm)
//! byte 1..    bpm, followed by optional energy / RR fields we do not use
//! ```
//!
//! Short or empty payloads are malformed and yield `None`; the caller keeps the
//! last known bpm.

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE: u16 = 0x180D;
/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;

const FLAG_UINT16_BPM: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitWidth {
    Eight,
    Sixteen,
}

impl BitWidth {
    pub fn describe(&self) -> &'static str {
        match self {
            BitWidth::Eight => "8-bit (UINT8)",
            BitWidth::Sixteen => "16-bit (UINT16)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    pub timestamp_ms: i64,
    pub bpm: u16,
    pub bit_width: BitWidth,
}

impl HeartRateSample {
    /// Decode a raw characteristic value received at `timestamp_ms`.
    pub fn parse(data: &[u8], timestamp_ms: i64) -> Option<Self> {
        let flags = *data.first()?;

        let (bpm, bit_width) = if flags & FLAG_UINT16_BPM != 0 {
            let bytes = data.get(1..3)?;
            (u16::from_le_bytes([bytes[0], bytes[1]]), BitWidth::Sixteen)
        } else {
            (u16::from(*data.get(1)?), BitWidth::Eight)
        };

        Some(Self {
            timestamp_ms,
            bpm,
            bit_width,
        })
    }
}
