//! # Changes-Stream Varint Encoding
//!
//! This module provides the `pack_uint` variable-length integer encoding
//! used by the changes stream that [`crate::table::Table`] can export at
//! commit time for a replication sink.
//!
//! ## Encoding Format
//!
//! Values are emitted seven bits at a time, least-significant group first.
//! Every byte except the last has its high bit set:
//!
//! ```text
//! 0          -> 00
//! 0x7F       -> 7F
//! 0x80       -> 80 01
//! 0x3FFF     -> FF 7F
//! 0x4000     -> 80 80 01
//! ```
//!
//! A `u32` therefore encodes in at most five bytes. Zero encodes as a single
//! zero byte, which doubles as the stream terminator.

use eyre::{bail, Result};

/// Appends the pack_uint encoding of `value` to `out`.
pub fn pack_uint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            b |= 0x80;
        }
        out.push(b);
        if value == 0 {
            return;
        }
    }
}

/// Decodes a pack_uint value from the front of `buf`, returning the value
/// and the number of bytes consumed.
pub fn unpack_uint(buf: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 32 || (shift == 28 && (b & 0x7f) > 0x0f) {
            bail!("pack_uint value overflows u32");
        }
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    bail!("truncated pack_uint value");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u32) -> usize {
        let mut buf = Vec::new();
        pack_uint(&mut buf, value);
        let (decoded, used) = unpack_uint(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, buf.len());
        buf.len()
    }

    #[test]
    fn pack_uint_zero_is_single_zero_byte() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 0);
        assert_eq!(buf, [0u8]);
    }

    #[test]
    fn pack_uint_group_boundaries() {
        assert_eq!(roundtrip(0x7f), 1);
        assert_eq!(roundtrip(0x80), 2);
        assert_eq!(roundtrip(0x3fff), 2);
        assert_eq!(roundtrip(0x4000), 3);
        assert_eq!(roundtrip(u32::MAX), 5);
    }

    #[test]
    fn unpack_uint_reports_consumed_length_in_a_stream() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 300);
        pack_uint(&mut buf, 2);
        let (v1, used) = unpack_uint(&buf).unwrap();
        assert_eq!(v1, 300);
        let (v2, _) = unpack_uint(&buf[used..]).unwrap();
        assert_eq!(v2, 2);
    }

    #[test]
    fn unpack_uint_rejects_truncation() {
        assert!(unpack_uint(&[0x80]).is_err());
        assert!(unpack_uint(&[]).is_err());
    }

    #[test]
    fn unpack_uint_rejects_overflow() {
        assert!(unpack_uint(&[0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
    }
}
