//! Primitive wire encodings.
//!
//! All multi-byte integers are big-endian. Variable-length integers use a
//! one byte prefix for larger values:
//!
//! ```text
//! value < 0xFD           -> 1 byte
//! value <= 0xFFFF        -> 0xFD + u16
//! value <= 0xFFFF_FFFF   -> 0xFE + u32
//! otherwise              -> 0xFF + u64
//! ```
//!
//! Decoding rejects encodings that are longer than necessary, so every value
//! has exactly one byte representation.

use crate::{CoreError, CoreResult};
use bytes::{Buf, BufMut, Bytes};

/// Ensure `buf` holds at least `needed` bytes.
pub fn ensure_remaining(buf: &impl Buf, needed: usize, what: &'static str) -> CoreResult<()> {
    if buf.remaining() < needed {
        return Err(CoreError::Truncated {
            what,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Write a varint.
pub fn put_varint(buf: &mut impl BufMut, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64(value);
        }
    }
}

/// Read a varint.
pub fn get_varint(buf: &mut impl Buf) -> CoreResult<u64> {
    ensure_remaining(buf, 1, "varint")?;
    let (value, min) = match buf.get_u8() {
        0xFD => {
            ensure_remaining(buf, 2, "varint")?;
            (buf.get_u16() as u64, 0xFD)
        }
        0xFE => {
            ensure_remaining(buf, 4, "varint")?;
            (buf.get_u32() as u64, 0x1_0000)
        }
        0xFF => {
            ensure_remaining(buf, 8, "varint")?;
            (buf.get_u64(), 0x1_0000_0000)
        }
        b => return Ok(b as u64),
    };
    if value < min {
        return Err(CoreError::NonMinimalVarint(value));
    }
    Ok(value)
}

/// Read a varint used as a length or count, bounded by `max`.
pub fn get_varint_bounded(buf: &mut impl Buf, max: u64, what: &'static str) -> CoreResult<u64> {
    let value = get_varint(buf)?;
    if value > max {
        return Err(CoreError::TooLarge {
            what,
            size: value,
            max,
        });
    }
    Ok(value)
}

/// Write a length-prefixed byte string.
pub fn put_var_bytes(buf: &mut impl BufMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read a length-prefixed byte string of at most `max` bytes.
pub fn get_var_bytes(buf: &mut impl Buf, max: usize, what: &'static str) -> CoreResult<Bytes> {
    let len = get_varint_bounded(buf, max as u64, what)? as usize;
    ensure_remaining(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

/// Write a length-prefixed string.
pub fn put_var_str(buf: &mut impl BufMut, value: &str) {
    put_var_bytes(buf, value.as_bytes());
}

/// Read a length-prefixed string. Invalid UTF-8 is replaced, not rejected.
pub fn get_var_str(buf: &mut impl Buf, max: usize, what: &'static str) -> CoreResult<String> {
    let bytes = get_var_bytes(buf, max, what)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write a count-prefixed list of varints.
pub fn put_var_int_list(buf: &mut impl BufMut, values: &[u64]) {
    put_varint(buf, values.len() as u64);
    for value in values {
        put_varint(buf, *value);
    }
}

/// Read a count-prefixed list of at most `max` varints.
pub fn get_var_int_list(buf: &mut impl Buf, max: usize, what: &'static str) -> CoreResult<Vec<u64>> {
    let count = get_varint_bounded(buf, max as u64, what)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_varint(buf)?);
    }
    Ok(values)
}

/// Read a fixed-size array.
pub fn get_array<const N: usize>(buf: &mut impl Buf, what: &'static str) -> CoreResult<[u8; N]> {
    ensure_remaining(buf, N, what)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];

        for &(value, len) in cases {
            let bytes = encode(value);
            assert_eq!(bytes.len(), len, "length for {value:#x}");
            assert_eq!(varint_len(value), len);
            let decoded = get_varint(&mut Bytes::from(bytes)).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_varint_prefixes() {
        assert_eq!(encode(0xFD), vec![0xFD, 0x00, 0xFD]);
        assert_eq!(encode(0x1_0000), vec![0xFE, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(encode(0x1_0000_0000)[0], 0xFF);
    }

    #[test]
    fn test_varint_rejects_non_minimal() {
        let mut bytes = Bytes::from_static(&[0xFD, 0x00, 0x10]);
        assert_eq!(get_varint(&mut bytes), Err(CoreError::NonMinimalVarint(0x10)));

        let mut bytes = Bytes::from_static(&[0xFE, 0x00, 0x00, 0xFF, 0xFF]);
        assert!(get_varint(&mut bytes).is_err());
    }

    #[test]
    fn test_varint_truncated() {
        let mut bytes = Bytes::from_static(&[0xFE, 0x00]);
        assert!(matches!(
            get_varint(&mut bytes),
            Err(CoreError::Truncated { what: "varint", .. })
        ));
    }

    #[test]
    fn test_var_str_and_list() {
        let mut buf = BytesMut::new();
        put_var_str(&mut buf, "/bm:0.1/");
        put_var_int_list(&mut buf, &[1, 2, 300]);

        let mut bytes = buf.freeze();
        assert_eq!(get_var_str(&mut bytes, 5000, "user agent").unwrap(), "/bm:0.1/");
        assert_eq!(get_var_int_list(&mut bytes, 160_000, "streams").unwrap(), vec![1, 2, 300]);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_var_bytes_bound() {
        let mut buf = BytesMut::new();
        put_var_bytes(&mut buf, &[0u8; 10]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            get_var_bytes(&mut bytes, 5, "blob"),
            Err(CoreError::TooLarge { size: 10, max: 5, .. })
        ));
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let bytes = encode(value);
            prop_assert_eq!(bytes.len(), varint_len(value));
            let mut bytes = Bytes::from(bytes);
            prop_assert_eq!(get_varint(&mut bytes).unwrap(), value);
            prop_assert!(!bytes.has_remaining());
        }
    }
}
