//! Integer codecs shared by all storage layouts.
//!
//! Every decode helper is a pure function over `(buffer, offset)` that
//! returns the value together with the offset just past it. Encoders append
//! to a byte vector. Three modes exist, matching the two bits of
//! compression mode in the strategy signature:
//!
//! - fixed: big-endian at an explicit width of 1..=8 bytes
//! - var1: 7 bits per byte, high bit set on all but the last byte
//! - var2: one count byte followed by the minimal big-endian bytes

use crate::error::{Error, Result};

/// Minimal fixed width (1..=8) able to hold `value`.
pub fn fixed_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Encoded length of `value` in var1 mode.
pub fn var1_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Encoded length of `value` in var2 mode.
pub fn var2_len(value: u64) -> usize {
    1 + fixed_width(value)
}

/// Append `value` as exactly `width` big-endian bytes.
pub fn write_fixed(buf: &mut Vec<u8>, value: u64, width: usize) {
    debug_assert!((1..=8).contains(&width));
    debug_assert!(width == 8 || value < 1u64 << (width * 8));
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[8 - width..]);
}

/// Read `width` big-endian bytes at `pos`.
pub fn read_fixed(buf: &[u8], pos: usize, width: usize) -> Result<(u64, usize)> {
    let end = pos + width;
    if end > buf.len() {
        return Err(Error::Decode(
            "fixed-width value",
            format!("need {} bytes at offset {}, have {}", width, pos, buf.len()),
        ));
    }
    let mut value = 0u64;
    for &b in &buf[pos..end] {
        value = (value << 8) | b as u64;
    }
    Ok((value, end))
}

/// Append `value` in var1 mode (7 bits per byte, continuation high bit).
pub fn write_var1(buf: &mut Vec<u8>, value: u64) {
    let len = var1_len(value);
    for i in (0..len).rev() {
        let mut b = ((value >> (7 * i)) & 0x7f) as u8;
        if i > 0 {
            b |= 0x80;
        }
        buf.push(b);
    }
}

/// Read a var1 value at `pos`.
pub fn read_var1(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut p = pos;
    loop {
        let b = *buf.get(p).ok_or_else(|| {
            Error::Decode("var1 value", format!("truncated at offset {}", p))
        })?;
        value = (value << 7) | (b & 0x7f) as u64;
        p += 1;
        if b & 0x80 == 0 {
            return Ok((value, p));
        }
        if p - pos > 10 {
            return Err(Error::Decode(
                "var1 value",
                format!("unterminated varint at offset {}", pos),
            ));
        }
    }
}

/// Append `value` in var2 mode (count byte, then minimal big-endian bytes).
pub fn write_var2(buf: &mut Vec<u8>, value: u64) {
    let width = fixed_width(value);
    buf.push(width as u8);
    write_fixed(buf, value, width);
}

/// Read a var2 value at `pos`.
pub fn read_var2(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    let width = *buf.get(pos).ok_or_else(|| {
        Error::Decode("var2 value", format!("truncated at offset {}", pos))
    })? as usize;
    if !(1..=8).contains(&width) {
        return Err(Error::Decode(
            "var2 value",
            format!("invalid width byte {} at offset {}", width, pos),
        ));
    }
    read_fixed(buf, pos + 1, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[u64] = &[
        0,
        1,
        127,
        128,
        255,
        256,
        16383,
        16384,
        u32::MAX as u64,
        1 << 40,
        u64::MAX,
    ];

    #[test]
    fn test_fixed_width() {
        assert_eq!(fixed_width(0), 1);
        assert_eq!(fixed_width(255), 1);
        assert_eq!(fixed_width(256), 2);
        assert_eq!(fixed_width(u64::MAX), 8);
    }

    #[test]
    fn test_fixed_roundtrip() {
        for &v in SAMPLES {
            for width in fixed_width(v)..=8 {
                let mut buf = Vec::new();
                write_fixed(&mut buf, v, width);
                assert_eq!(buf.len(), width);
                let (decoded, next) = read_fixed(&buf, 0, width).expect("Failed to decode");
                assert_eq!(decoded, v);
                assert_eq!(next, width);
            }
        }
    }

    #[test]
    fn test_var1_roundtrip() {
        for &v in SAMPLES {
            let mut buf = Vec::new();
            write_var1(&mut buf, v);
            assert_eq!(buf.len(), var1_len(v));
            let (decoded, next) = read_var1(&buf, 0).expect("Failed to decode");
            assert_eq!(decoded, v);
            assert_eq!(next, buf.len());
        }
    }

    #[test]
    fn test_var2_roundtrip() {
        for &v in SAMPLES {
            let mut buf = Vec::new();
            write_var2(&mut buf, v);
            assert_eq!(buf.len(), var2_len(v));
            let (decoded, next) = read_var2(&buf, 0).expect("Failed to decode");
            assert_eq!(decoded, v);
            assert_eq!(next, buf.len());
        }
    }

    #[test]
    fn test_var1_len_bounds() {
        assert_eq!(var1_len(0), 1);
        assert_eq!(var1_len(127), 1);
        assert_eq!(var1_len(128), 2);
        assert_eq!(var1_len(u64::MAX), 10);
    }

    #[test]
    fn test_truncated_reads() {
        assert!(read_fixed(&[1, 2], 0, 4).is_err());
        assert!(read_var1(&[0x80, 0x80], 0).is_err());
        assert!(read_var2(&[4, 0, 0], 0).is_err());
        assert!(read_var2(&[9], 0).is_err());
    }

    #[test]
    fn test_sequential_decode() {
        let mut buf = Vec::new();
        write_var1(&mut buf, 300);
        write_var2(&mut buf, 70000);
        write_fixed(&mut buf, 5, 2);

        let (a, pos) = read_var1(&buf, 0).expect("Failed to decode var1");
        let (b, pos) = read_var2(&buf, pos).expect("Failed to decode var2");
        let (c, pos) = read_fixed(&buf, pos, 2).expect("Failed to decode fixed");
        assert_eq!((a, b, c), (300, 70000, 5));
        assert_eq!(pos, buf.len());
    }
}
