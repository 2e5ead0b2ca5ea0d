//! Run-length encoding of a bitfield window, as carried by the have
//! extension.
//!
//! The encoding is a sequence of unsigned LEB128 varints giving the lengths
//! of alternating runs, always starting with a run of unset bits (which may
//! be zero). Bits past the last run are unset. The decoded length is the
//! sum of all runs, so a trailing unset run records how far the window
//! reaches.

use super::Bitfield;

/// Upper bound on a decoded window. Larger windows are rejected rather than
/// trusted, since the length is peer-supplied.
pub const MAX_DECODED_LEN: u64 = 1 << 40;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RleError {
    #[error("truncated varint")]
    Truncated,
    #[error("varint overflows u64")]
    Overflow,
    #[error("decoded length exceeds {MAX_DECODED_LEN}")]
    TooLong,
}

/// Encodes the window `[start, start + len)` of `bits`.
pub fn encode(bits: &Bitfield, start: u64, len: u64) -> Vec<u8> {
    let end = start.saturating_add(len);
    let mut out = Vec::new();
    let mut cursor = start;
    for range in bits.ranges() {
        let s = range.start.max(start);
        let e = range.end.min(end);
        if s >= e {
            continue;
        }
        write_varint(&mut out, s - cursor);
        write_varint(&mut out, e - s);
        cursor = e;
    }
    if cursor < end {
        write_varint(&mut out, end - cursor);
    }
    out
}

/// Decodes a window. The returned bitfield is relative to the window start;
/// the second value is the window length.
pub fn decode(mut buf: &[u8]) -> Result<(Bitfield, u64), RleError> {
    let mut bits = Bitfield::new();
    let mut cursor: u64 = 0;
    let mut set = false;
    while !buf.is_empty() {
        let run = read_varint(&mut buf)?;
        let next = cursor.checked_add(run).ok_or(RleError::TooLong)?;
        if next > MAX_DECODED_LEN {
            return Err(RleError::TooLong);
        }
        if set {
            bits.set_range(cursor..next, true);
        }
        cursor = next;
        set = !set;
    }
    Ok((bits, cursor))
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &mut &[u8]) -> Result<u64, RleError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf.split_first().ok_or(RleError::Truncated)?;
        *buf = rest;
        if shift == 63 && byte > 1 {
            return Err(RleError::Overflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(RleError::Overflow);
        }
    }
}
