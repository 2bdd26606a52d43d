//! Checksum: 16-bit XOR over the serialized message, carried in field `c`.
//!
//! The checksum is computed over the buffer with the value of `c` replaced in
//! place by `0`. Buffers without a `c` field are local (checksum-free) traffic.

use crate::field::{self, FieldError};
use crate::protocol::key;
use crate::wire;

/// XOR of big-endian 2-byte chunks; an odd final byte goes in the high half.
pub fn checksum(buf: &[u8]) -> u16 {
    buf.chunks(2).fold(0u16, |acc, pair| {
        let hi = u16::from(pair[0]) << 8;
        let lo = pair.get(1).copied().map(u16::from).unwrap_or(0);
        acc ^ (hi | lo)
    })
}

/// Outcome of checking a received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// No `c` field (local mode).
    Absent,
    Valid(u16),
    /// `claimed` is `None` when `c` is present but not an integer.
    Invalid { claimed: Option<u64>, computed: u16 },
}

impl Verification {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Verification::Invalid { .. })
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Verification::Absent)
    }
}

fn compare(claimed: Option<u64>, computed: u16) -> Verification {
    match claimed {
        Some(c) if c == u64::from(computed) => Verification::Valid(computed),
        _ => Verification::Invalid { claimed, computed },
    }
}

fn claimed_value(buf: &[u8]) -> Option<u64> {
    match field::classify_value(buf, key::CHECKSUM) {
        field::FieldKind::Integer => Some(field::read_integer(buf, key::CHECKSUM)),
        _ => None,
    }
}

/// Check in place: zero the `c` digits on a scratch copy and XOR it.
pub fn verify(buf: &[u8]) -> Verification {
    if field::locate_colon(buf, key::CHECKSUM).is_none() {
        return Verification::Absent;
    }
    let claimed = claimed_value(buf);
    let mut scratch = buf.to_vec();
    if field::replace_integer(&mut scratch, key::CHECKSUM, 0).is_err() {
        return Verification::Invalid {
            claimed,
            computed: checksum(buf),
        };
    }
    compare(claimed, checksum(&scratch))
}

/// Check through a full decode, `c` set to 0, re-encode. Slower than
/// [`verify`]; agrees with it on every buffer [`wire::encode`] produces.
pub fn verify_decoded(buf: &[u8]) -> Verification {
    let Ok(mut message) = wire::decode(buf) else {
        return verify(buf);
    };
    let Some(claimed) = message.get(key::CHECKSUM).cloned() else {
        return Verification::Absent;
    };
    message.set(key::CHECKSUM, 0u64);
    match wire::encode(&message) {
        Ok(zeroed) => compare(claimed.as_integer(), checksum(&zeroed)),
        Err(_) => Verification::Invalid {
            claimed: claimed.as_integer(),
            computed: checksum(buf),
        },
    }
}

/// [`verify`], then drop the `c` field from the buffer.
pub fn verify_and_strip(buf: &mut Vec<u8>) -> Verification {
    let verification = verify(buf);
    if verification.is_present() {
        field::remove(buf, key::CHECKSUM);
    }
    verification
}

/// Write the checksum into `c`. An existing `c` is zeroed and rewritten at
/// its position; otherwise the field is appended before the closing brace.
pub fn stamp(buf: &mut Vec<u8>) -> Result<u16, FieldError> {
    if field::locate_colon(buf, key::CHECKSUM).is_some() {
        field::replace_integer(buf, key::CHECKSUM, 0)?;
    } else {
        field::set_integer(buf, key::CHECKSUM, 0)?;
    }
    let sum = checksum(buf);
    field::replace_integer(buf, key::CHECKSUM, u64::from(sum))?;
    Ok(sum)
}

/// Read and remove `c`. Undoes [`stamp`] on a buffer that had no `c`.
pub fn strip(buf: &mut Vec<u8>) -> Option<u16> {
    field::locate_colon(buf, key::CHECKSUM)?;
    let value = field::read_integer(buf, key::CHECKSUM);
    field::remove(buf, key::CHECKSUM);
    u16::try_from(value).ok()
}
