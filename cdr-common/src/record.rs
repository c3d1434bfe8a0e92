//! # Record
//!
//! Decoding of the fixed-length binary call-detail records found in a day's `.bil` file.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of every record in a source file.
pub const RECORD_LEN: usize = 118;

/// A nibble holding this value ends a packed-decimal phone field.
const PACKED_DECIMAL_TERMINATOR: u8 = 0x0f;

/// Bit of the billing-control byte marking a call as payable.
const PAYABLE_FLAG: u8 = 0x02;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record must be {RECORD_LEN} bytes long, got {0}")]
    InvalidLength(usize),
}

/// A decoded call-detail record.
///
/// Field names on the wire are the ones the collector has always received, hence the renames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Call fee in minor currency units.
    #[serde(rename = "Fee")]
    pub fee: u64,
    #[serde(rename = "IsPay")]
    pub is_payable: bool,
    #[serde(rename = "IsCheck")]
    pub is_checksum_valid: bool,
    #[serde(rename = "CType")]
    pub call_type: i8,
    #[serde(rename = "BType")]
    pub business_type: i8,
    #[serde(rename = "FPhone")]
    pub from_phone: String,
    #[serde(rename = "TPhone")]
    pub to_phone: String,
    /// Formatted as `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "BeginTime")]
    pub begin_time: String,
    #[serde(rename = "EndTime")]
    pub end_time: String,
    #[serde(rename = "Duration")]
    pub duration_seconds: u32,
    #[serde(rename = "TPhoneType")]
    pub to_phone_type: u8,
}

/// Decode a raw record into an `Event`.
///
/// A checksum mismatch does not fail decoding, it is only reported through
/// `Event::is_checksum_valid`.
pub fn decode(raw: &[u8]) -> Result<Event, DecodeError> {
    let raw: &[u8; RECORD_LEN] = raw
        .try_into()
        .map_err(|_| DecodeError::InvalidLength(raw.len()))?;

    let (call_type, business_type) = split_signed_nibbles(raw[67]);

    Ok(Event {
        fee: decode_uvarint(&raw[85..89]),
        is_payable: raw[6] & PAYABLE_FLAG == PAYABLE_FLAG,
        is_checksum_valid: checksum_matches(raw),
        call_type,
        business_type,
        from_phone: decode_packed_decimal(&raw[26..36]),
        to_phone: decode_packed_decimal(&raw[38..48]),
        begin_time: format_call_time(&raw[8..14]),
        end_time: format_call_time(&raw[14..20]),
        duration_seconds: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
        to_phone_type: raw[37],
    })
}

/// The byte at offset 5 holds the wrapping sum of every byte from offset 6 onwards.
fn checksum_matches(raw: &[u8; RECORD_LEN]) -> bool {
    let sum = raw[6..]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));

    sum == raw[5]
}

/// Six raw bytes: two-digit year (in the 2000s), month, day, hour, minute and second.
fn format_call_time(bytes: &[u8]) -> String {
    format!(
        "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Read digits high nibble first, stopping at the first terminator nibble even if it is the high
/// one of its byte.
fn decode_packed_decimal(bytes: &[u8]) -> String {
    let mut digits = String::with_capacity(bytes.len() * 2);

    for nibble in bytes.iter().flat_map(|byte| [byte >> 4, byte & 0x0f]) {
        if nibble == PACKED_DECIMAL_TERMINATOR {
            break;
        }
        digits.push_str(&nibble.to_string());
    }

    digits
}

/// Interpret each half of `byte` as a two's complement 4-bit integer.
fn split_signed_nibbles(byte: u8) -> (i8, i8) {
    let sign_extend = |nibble: u8| ((nibble << 4) as i8) >> 4;

    (sign_extend(byte >> 4), sign_extend(byte & 0x0f))
}

/// Little-endian base-128 decoding. Returns 0 when no byte terminates the value.
fn decode_uvarint(bytes: &[u8]) -> u64 {
    let mut value = 0u64;

    for (i, byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return value;
        }
    }

    0
}
