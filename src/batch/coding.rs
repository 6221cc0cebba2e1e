//! Fixed-width and varint primitives used by the batch wire format
//!
//! Fixed-width integers are little-endian. Varints are the usual base-128
//! encoding, low group first, continuation bit set on every byte but the last.
//! Readers take a `&mut &[u8]` cursor and only advance it on success.

/// Longest varint32 encoding
pub const MAX_VARINT32_LEN: usize = 5;

#[inline]
pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_le_bytes());
}

/// Overwrite four bytes at `offset`. Caller guarantees the range exists.
#[inline]
pub fn encode_fixed32(dst: &mut [u8], offset: usize, value: u32) {
    dst[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite eight bytes at `offset`. Caller guarantees the range exists.
#[inline]
pub fn encode_fixed64(dst: &mut [u8], offset: usize, value: u64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian u32 at `offset`, `None` if out of bounds
#[inline]
pub fn decode_fixed32(src: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = src.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Read a little-endian u64 at `offset`, `None` if out of bounds
#[inline]
pub fn decode_fixed64(src: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = src.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[inline]
pub fn put_varint32(dst: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Number of bytes `value` occupies as a varint
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decode a varint32, advancing `input` past it.
///
/// Fails on truncation and on encodings longer than five bytes or wider
/// than 32 bits.
pub fn get_varint32(input: &mut &[u8]) -> Option<u32> {
    let mut result = 0u32;
    for (i, &byte) in input.iter().enumerate().take(MAX_VARINT32_LEN) {
        let shift = 7 * i as u32;
        let bits = (byte & 0x7F) as u32;
        if shift == 28 && bits > 0x0F {
            return None;
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            *input = &input[i + 1..];
            return Some(result);
        }
    }
    None
}

#[inline]
pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, value: &[u8]) {
    put_varint32(dst, value.len() as u32);
    dst.extend_from_slice(value);
}

/// Write the concatenation of `parts` as one length-prefixed string
pub fn put_length_prefixed_slice_parts(dst: &mut Vec<u8>, parts: &[&[u8]]) {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    put_varint32(dst, total as u32);
    for part in parts {
        dst.extend_from_slice(part);
    }
}

/// Decode a length-prefixed string, advancing `input` past it.
///
/// Never reads past the end of `input`: a length that overruns the
/// remaining bytes is a failure and leaves `input` untouched.
pub fn get_length_prefixed_slice<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let mut cursor = *input;
    let len = get_varint32(&mut cursor)? as usize;
    if cursor.len() < len {
        return None;
    }
    let (value, rest) = cursor.split_at(len);
    *input = rest;
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_little_endian() {
        let mut buf = Vec::new();
        put_fixed64(&mut buf, 0x0102_0304_0506_0708);
        put_fixed32(&mut buf, 0x0A0B_0C0D);
        assert_eq!(&buf[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&buf[8..], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(decode_fixed64(&buf, 0), Some(0x0102_0304_0506_0708));
        assert_eq!(decode_fixed32(&buf, 8), Some(0x0A0B_0C0D));
        assert_eq!(decode_fixed32(&buf, 9), None);
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u32, 1, 127, 128, 16383, 16384, 1 << 21, 1 << 28, u32::MAX] {
            let mut buf = Vec::new();
            put_varint32(&mut buf, value);
            assert_eq!(buf.len(), varint_length(value as u64));
            let mut input = buf.as_slice();
            assert_eq!(get_varint32(&mut input), Some(value));
            assert!(input.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, 300);
        let mut input = &buf[..1];
        assert_eq!(get_varint32(&mut input), None);
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn test_varint_overflow() {
        let mut input: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        assert_eq!(get_varint32(&mut input), None);
        let mut input: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(get_varint32(&mut input), None);
    }

    #[test]
    fn test_length_prefixed_overrun_leaves_cursor() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello");
        let truncated = &buf[..4];
        let mut input = truncated;
        assert_eq!(get_length_prefixed_slice(&mut input), None);
        assert_eq!(input.len(), 4);
    }

    #[test]
    fn test_slice_parts_concatenate() {
        let mut buf = Vec::new();
        put_length_prefixed_slice_parts(&mut buf, &[b"ab", b"", b"cde"]);
        let mut input = buf.as_slice();
        assert_eq!(get_length_prefixed_slice(&mut input), Some(&b"abcde"[..]));
    }
}
