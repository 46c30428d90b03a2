//! BER tag-length-value primitives.
//!
//! Decoders take a buffer, the element length and the element position and check the
//! element bounds before touching the buffer. Encoders write into a caller provided
//! buffer that was sized beforehand with the matching `*_size` functions and return the
//! position after the written bytes.

use snafu::{ResultExt as _, Snafu, ensure};
use tracing::instrument;

use crate::mms::SpanTraceWrapper;

/// Largest length accepted by the decoder. Lengths are decoded into 31 bits.
pub const MAX_LENGTH: usize = i32::MAX as usize;

/// Decode a BER length starting at `pos`.
///
/// Returns the decoded length and the position of the first value byte. Fails if the
/// length octets run past `max_pos`, if the indefinite form is used or if more than four
/// length octets are present.
pub fn decode_length(buf: &[u8], pos: usize, max_pos: usize) -> Result<(usize, usize), BerError> {
    let max_pos = max_pos.min(buf.len());
    ensure!(pos < max_pos, Truncated { pos, needed: 1_usize });

    let first = buf[pos];
    let mut pos = pos + 1;

    if first & 0x80 == 0 {
        return Ok((usize::from(first), pos));
    }

    let count = usize::from(first & 0x7f);
    ensure!(count != 0, IndefiniteLength { pos });
    ensure!(count <= 4, LengthTooLong { pos, count });
    ensure!(pos + count <= max_pos, Truncated { pos, needed: count });

    let mut length = 0_usize;
    for byte in &buf[pos..pos + count] {
        length = (length << 8) | usize::from(*byte);
    }
    pos += count;

    ensure!(length <= MAX_LENGTH, LengthTooLong { pos, count });

    Ok((length, pos))
}

/// Check that `length` bytes starting at `pos` are inside the buffer.
#[inline]
pub fn check_bounds(buf: &[u8], pos: usize, length: usize) -> Result<(), BerError> {
    ensure!(
        pos.checked_add(length).is_some_and(|end| end <= buf.len()),
        Truncated { pos, needed: length }
    );
    Ok(())
}

/// Decode an unsigned integer of up to five bytes (a leading zero byte is allowed).
pub fn decode_uint32(buf: &[u8], length: usize, pos: usize) -> Result<u32, BerError> {
    check_bounds(buf, pos, length)?;
    let bytes = &buf[pos..pos + length];
    let bytes = match bytes {
        [0, rest @ ..] if rest.len() == 4 => rest,
        _ => bytes,
    };
    ensure!(bytes.len() <= 4, IntegerTooLarge { pos, length });
    Ok(bytes.iter().fold(0_u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Decode a two's complement signed integer of up to four bytes.
pub fn decode_int32(buf: &[u8], length: usize, pos: usize) -> Result<i32, BerError> {
    check_bounds(buf, pos, length)?;
    ensure!(length <= 4, IntegerTooLarge { pos, length });
    Ok(sign_extend(&buf[pos..pos + length]) as i32)
}

/// Decode a two's complement signed integer of up to eight bytes.
pub fn decode_int64(buf: &[u8], length: usize, pos: usize) -> Result<i64, BerError> {
    check_bounds(buf, pos, length)?;
    ensure!(length <= 8, IntegerTooLarge { pos, length });
    Ok(sign_extend(&buf[pos..pos + length]))
}

/// Sign extend a big endian two's complement byte slice of at most eight bytes.
fn sign_extend(bytes: &[u8]) -> i64 {
    let Some(first) = bytes.first() else {
        return 0;
    };
    let init: i64 = if first & 0x80 != 0 { -1 } else { 0 };
    bytes.iter().fold(init, |acc, b| (acc << 8) | i64::from(*b))
}

/// Decode a boolean. Any non zero octet is true.
pub fn decode_boolean(buf: &[u8], length: usize, pos: usize) -> Result<bool, BerError> {
    check_bounds(buf, pos, length)?;
    ensure!(length == 1, InvalidLength { pos, length, expected: 1_usize });
    Ok(buf[pos] != 0)
}

/// Decode an MMS floating point value with single precision.
///
/// The first octet is the exponent width, followed by the IEEE 754 value in network byte
/// order.
pub fn decode_float(buf: &[u8], length: usize, pos: usize) -> Result<f32, BerError> {
    check_bounds(buf, pos, length)?;
    ensure!(length == 5, InvalidLength { pos, length, expected: 5_usize });
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[pos + 1..pos + 5]);
    Ok(f32::from_be_bytes(bytes))
}

/// Decode an MMS floating point value with double precision.
pub fn decode_double(buf: &[u8], length: usize, pos: usize) -> Result<f64, BerError> {
    check_bounds(buf, pos, length)?;
    ensure!(length == 9, InvalidLength { pos, length, expected: 9_usize });
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[pos + 1..pos + 9]);
    Ok(f64::from_be_bytes(bytes))
}

/// Decode a string value. Invalid UTF-8 sequences are replaced.
pub fn decode_string(buf: &[u8], length: usize, pos: usize) -> Result<String, BerError> {
    check_bounds(buf, pos, length)?;
    Ok(String::from_utf8_lossy(&buf[pos..pos + length]).into_owned())
}

/// Decode an identifier. Identifiers must be valid UTF-8.
pub fn decode_identifier(buf: &[u8], length: usize, pos: usize) -> Result<String, BerError> {
    check_bounds(buf, pos, length)?;
    std::str::from_utf8(&buf[pos..pos + length]).map(str::to_owned).context(InvalidString { pos })
}

/// Number of octets needed to encode `length`.
#[must_use]
pub const fn determine_length_size(length: usize) -> usize {
    if length < 0x80 {
        1
    } else if length < 0x100 {
        2
    } else if length < 0x1_0000 {
        3
    } else if length < 0x100_0000 {
        4
    } else {
        5
    }
}

/// Size of a tag (one octet) plus the encoded length.
#[must_use]
pub const fn tl_size(length: usize) -> usize {
    1 + determine_length_size(length)
}

/// Complete encoded size of an element with a content of `length` bytes.
#[must_use]
pub const fn element_size(length: usize) -> usize {
    tl_size(length) + length
}

/// Encoded size of a string element with tag and length.
#[must_use]
pub const fn determine_encoded_string_size(value: &str) -> usize {
    element_size(value.len())
}

/// Minimum number of content octets for an unsigned value.
#[must_use]
pub const fn uint32_size(value: u32) -> usize {
    if value < 0x80 {
        1
    } else if value < 0x8000 {
        2
    } else if value < 0x80_0000 {
        3
    } else if value < 0x8000_0000 {
        4
    } else {
        5
    }
}

/// Minimum number of content octets for a signed value.
#[must_use]
pub fn int64_size(value: i64) -> usize {
    let bytes = value.to_be_bytes();
    compress_signed(&bytes).len()
}

/// Minimum number of content octets for a signed 32 bit value.
#[must_use]
pub fn int32_size(value: i32) -> usize {
    int64_size(i64::from(value))
}

/// Strip the redundant leading octets of a two's complement integer.
#[must_use]
pub fn compress_signed(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    while start + 1 < bytes.len() {
        let (curr, next) = (bytes[start], bytes[start + 1]);
        if (curr == 0x00 && next & 0x80 == 0) || (curr == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    &bytes[start..]
}

/// Encode a definite length at `pos`.
pub fn encode_length(length: usize, buf: &mut [u8], mut pos: usize) -> usize {
    let size = determine_length_size(length);
    if size == 1 {
        buf[pos] = length as u8;
        return pos + 1;
    }
    let count = size - 1;
    buf[pos] = 0x80 | count as u8;
    pos += 1;
    for i in (0..count).rev() {
        buf[pos] = (length >> (8 * i)) as u8;
        pos += 1;
    }
    pos
}

/// Encode a tag and a definite length.
pub fn encode_tl(tag: u8, length: usize, buf: &mut [u8], pos: usize) -> usize {
    buf[pos] = tag;
    encode_length(length, buf, pos + 1)
}

/// Encode a complete element with raw content bytes.
pub fn encode_octet_string_with_tag(tag: u8, value: &[u8], buf: &mut [u8], pos: usize) -> usize {
    let pos = encode_tl(tag, value.len(), buf, pos);
    buf[pos..pos + value.len()].copy_from_slice(value);
    pos + value.len()
}

/// Encode a string element.
pub fn encode_string_with_tag(tag: u8, value: &str, buf: &mut [u8], pos: usize) -> usize {
    encode_octet_string_with_tag(tag, value.as_bytes(), buf, pos)
}

/// Encode an unsigned value with tag and length using the minimal number of octets.
pub fn encode_uint32_with_tl(tag: u8, value: u32, buf: &mut [u8], pos: usize) -> usize {
    let size = uint32_size(value);
    let pos = encode_tl(tag, size, buf, pos);
    encode_uint32(value, size, buf, pos)
}

/// Encode the content octets of an unsigned value.
fn encode_uint32(value: u32, size: usize, buf: &mut [u8], mut pos: usize) -> usize {
    let bytes = u64::from(value).to_be_bytes();
    buf[pos..pos + size].copy_from_slice(&bytes[8 - size..]);
    pos += size;
    pos
}

/// Encode a signed value with tag and length using the minimal number of octets.
pub fn encode_int32_with_tl(tag: u8, value: i32, buf: &mut [u8], pos: usize) -> usize {
    encode_int64_with_tl(tag, i64::from(value), buf, pos)
}

/// Encode a signed 64 bit value with tag and length.
pub fn encode_int64_with_tl(tag: u8, value: i64, buf: &mut [u8], pos: usize) -> usize {
    let bytes = value.to_be_bytes();
    encode_octet_string_with_tag(tag, compress_signed(&bytes), buf, pos)
}

/// Encode a boolean element.
pub fn encode_boolean(tag: u8, value: bool, buf: &mut [u8], pos: usize) -> usize {
    let pos = encode_tl(tag, 1, buf, pos);
    buf[pos] = if value { 0xff } else { 0x00 };
    pos + 1
}

/// Encoded size of a bit string of `bit_count` bits.
#[must_use]
pub const fn bit_string_size(bit_count: usize) -> usize {
    element_size(bit_count.div_ceil(8) + 1)
}

/// Encode a bit string. The first content octet is the number of unused bits.
///
/// Missing octets of `bytes` are written as zero.
pub fn encode_bit_string(
    tag: u8,
    bit_count: usize,
    bytes: &[u8],
    buf: &mut [u8],
    pos: usize,
) -> usize {
    let byte_count = bit_count.div_ceil(8);
    let padding = byte_count * 8 - bit_count;
    let pos = encode_tl(tag, byte_count + 1, buf, pos);
    buf[pos] = padding as u8;
    let pos = pos + 1;
    let available = byte_count.min(bytes.len());
    buf[pos..pos + available].copy_from_slice(&bytes[..available]);
    buf[pos + available..pos + byte_count].fill(0);
    if byte_count > 0 && padding > 0 {
        // Unused bits are zero.
        buf[pos + byte_count - 1] &= 0xff << padding;
    }
    pos + byte_count
}

/// Encode a floating point value with its exponent width octet.
pub fn encode_float(
    tag: u8,
    exponent_width: u8,
    value: &[u8],
    buf: &mut [u8],
    pos: usize,
) -> usize {
    let pos = encode_tl(tag, value.len() + 1, buf, pos);
    buf[pos] = exponent_width;
    buf[pos + 1..pos + 1 + value.len()].copy_from_slice(value);
    pos + 1 + value.len()
}

/// Encode into a new buffer of exactly `size` bytes.
///
/// `size` comes from the `encoded_size` of what `encode` writes.
#[must_use]
pub fn encode_to_vec(size: usize, encode: impl FnOnce(&mut [u8], usize) -> usize) -> Vec<u8> {
    let mut buf = vec![0; size];
    let end = encode(&mut buf, 0);
    debug_assert_eq!(end, size, "encoded size mismatch");
    buf
}

/// One decoded tag-length-value element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// The tag octet.
    pub tag: u8,
    /// The content octets.
    pub value: &'a [u8],
    /// Offset of the content inside the buffer it was read from.
    pub offset: usize,
}

impl Tlv<'_> {
    /// True if the tag has the constructed bit set.
    #[must_use]
    pub const fn is_constructed(&self) -> bool {
        self.tag & 0x20 != 0
    }
}

/// Read the element starting at `pos`. Returns the element and the position after it.
#[instrument(level = "trace", skip(buf))]
pub fn read_tlv(buf: &[u8], pos: usize) -> Result<(Tlv<'_>, usize), BerError> {
    check_bounds(buf, pos, 1)?;
    let tag = buf[pos];
    ensure!(tag & 0x1f != 0x1f, UnsupportedTag { pos, tag });
    let (length, value_pos) = decode_length(buf, pos + 1, buf.len())?;
    check_bounds(buf, value_pos, length)?;
    Ok((
        Tlv { tag, value: &buf[value_pos..value_pos + length], offset: value_pos },
        value_pos + length,
    ))
}

/// Cursor over consecutive elements of a buffer.
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    /// The buffer being read.
    buf: &'a [u8],
    /// Current position.
    pos: usize,
}

impl<'a> BerReader<'a> {
    /// Create a reader over the whole buffer.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// True if every element was consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Look at the tag of the next element without consuming it.
    #[must_use]
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Read the next element, failing at the end of the buffer.
    pub fn read(&mut self) -> Result<Tlv<'a>, BerError> {
        let (tlv, next) = read_tlv(self.buf, self.pos)?;
        self.pos = next;
        Ok(tlv)
    }

    /// Read the next element and require it to carry `tag`.
    pub fn expect(&mut self, tag: u8) -> Result<Tlv<'a>, BerError> {
        let pos = self.pos;
        let tlv = self.read()?;
        ensure!(tlv.tag == tag, UnexpectedTag { pos, tag: tlv.tag, expected: tag });
        Ok(tlv)
    }

    /// Read the next element if it carries `tag`.
    pub fn read_optional(&mut self, tag: u8) -> Result<Option<Tlv<'a>>, BerError> {
        if self.peek_tag() == Some(tag) {
            self.read().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<'a> Iterator for BerReader<'a> {
    type Item = Result<Tlv<'a>, BerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_empty() {
            return None;
        }
        let item = self.read();
        if item.is_err() {
            // Stop after the first error.
            self.pos = self.buf.len();
        }
        Some(item)
    }
}

/// Helpers decoding the content of an element read through [`BerReader`].
impl<'a> Tlv<'a> {
    /// Decode the content as an unsigned 32 bit integer.
    pub fn as_u32(&self) -> Result<u32, BerError> {
        decode_uint32(self.value, self.value.len(), 0)
    }

    /// Decode the content as a signed 32 bit integer.
    pub fn as_i32(&self) -> Result<i32, BerError> {
        decode_int32(self.value, self.value.len(), 0)
    }

    /// Decode the content as a boolean.
    pub fn as_bool(&self) -> Result<bool, BerError> {
        decode_boolean(self.value, self.value.len(), 0)
    }

    /// Decode the content as an identifier.
    pub fn as_identifier(&self) -> Result<String, BerError> {
        decode_identifier(self.value, self.value.len(), 0)
    }

    /// A reader over the content of a constructed element.
    #[must_use]
    pub const fn children(&self) -> BerReader<'a> {
        BerReader::new(self.value)
    }
}

/// Growable writer building PDUs in tests, where the nested lengths are only known
/// after the content.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct BerWriter {
    /// The encoded bytes.
    buf: Vec<u8>,
}

#[cfg(test)]
impl BerWriter {
    /// An empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// The encoded bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Write a constructed element whose content is produced by `content`.
    pub fn constructed(&mut self, tag: u8, content: impl FnOnce(&mut Self)) -> &mut Self {
        let mut inner = Self::new();
        content(&mut inner);
        self.primitive(tag, &inner.buf)
    }

    /// Write a primitive element with raw content.
    pub fn primitive(&mut self, tag: u8, value: &[u8]) -> &mut Self {
        let start = self.buf.len();
        self.buf.resize(start + element_size(value.len()), 0);
        encode_octet_string_with_tag(tag, value, &mut self.buf, start);
        self
    }

    /// Write a string element.
    pub fn string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.primitive(tag, value.as_bytes())
    }

    /// Write an unsigned integer element with the minimal number of octets.
    pub fn uint(&mut self, tag: u8, value: u32) -> &mut Self {
        let size = uint32_size(value);
        let bytes = u64::from(value).to_be_bytes();
        self.primitive(tag, &bytes[8 - size..])
    }

    /// Write a signed integer element with the minimal number of octets.
    pub fn int(&mut self, tag: u8, value: i64) -> &mut Self {
        let bytes = value.to_be_bytes();
        self.primitive(tag, compress_signed(&bytes))
    }

    /// Write a boolean element.
    pub fn boolean(&mut self, tag: u8, value: bool) -> &mut Self {
        self.primitive(tag, &[if value { 0xff } else { 0x00 }])
    }
}

#[allow(missing_docs)]
/// Errors of the BER codec.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum BerError {
    #[snafu(display("Buffer too short at {pos}: {needed} more bytes needed"))]
    Truncated {
        pos: usize,
        needed: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Indefinite length at {pos} is not supported"))]
    IndefiniteLength {
        pos: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Length at {pos} uses {count} octets"))]
    LengthTooLong {
        pos: usize,
        count: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Integer at {pos} with {length} octets does not fit"))]
    IntegerTooLarge {
        pos: usize,
        length: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Element at {pos} has length {length}, expected {expected}"))]
    InvalidLength {
        pos: usize,
        length: usize,
        expected: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unexpected tag {tag:#04x} at {pos}, expected {expected:#04x}"))]
    UnexpectedTag {
        pos: usize,
        tag: u8,
        expected: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Multi octet tag {tag:#04x} at {pos} is not supported"))]
    UnsupportedTag {
        pos: usize,
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid string at {pos}"))]
    InvalidString {
        pos: usize,
        source: std::str::Utf8Error,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl BerError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Truncated { context, .. }
            | Self::IndefiniteLength { context, .. }
            | Self::LengthTooLong { context, .. }
            | Self::IntegerTooLarge { context, .. }
            | Self::InvalidLength { context, .. }
            | Self::UnexpectedTag { context, .. }
            | Self::UnsupportedTag { context, .. }
            | Self::InvalidString { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_length_to_vec(length: usize) -> Vec<u8> {
        let mut buf = vec![0; determine_length_size(length)];
        let end = encode_length(length, &mut buf, 0);
        assert_eq!(end, buf.len());
        buf
    }

    #[test]
    fn test_length_round_trip() {
        let samples = [0, 1, 0x7f, 0x80, 0xff, 0x100, 0xffff, 0x1_0000, 0xff_ffff, 0x100_0000];
        for length in samples.into_iter().chain([MAX_LENGTH - 1, MAX_LENGTH]) {
            let buf = encode_length_to_vec(length);
            let (decoded, pos) = decode_length(&buf, 0, buf.len()).unwrap();
            assert_eq!(decoded, length);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_length_short_and_long_form() {
        assert_eq!(encode_length_to_vec(0x7f), vec![0x7f]);
        assert_eq!(encode_length_to_vec(0x80), vec![0x81, 0x80]);
        assert_eq!(encode_length_to_vec(0x1234), vec![0x82, 0x12, 0x34]);
    }

    #[test]
    fn test_length_rejects_overrun() {
        // Long form announcing two octets with only one present.
        let buf = [0x82, 0x01];
        assert!(decode_length(&buf, 0, buf.len()).is_err());
        // max_pos is honoured even when the buffer is longer.
        let buf = [0x82, 0x01, 0x00];
        assert!(decode_length(&buf, 0, 2).is_err());
        assert!(decode_length(&[], 0, 0).is_err());
    }

    #[test]
    fn test_length_rejects_indefinite_and_oversized() {
        assert!(decode_length(&[0x80], 0, 1).is_err());
        assert!(decode_length(&[0x85, 1, 2, 3, 4, 5], 0, 6).is_err());
        assert!(decode_length(&[0x84, 0xff, 0xff, 0xff, 0xff], 0, 5).is_err());
    }

    #[test]
    fn test_uint32() {
        for value in [0, 1, 0x7f, 0x80, 0xffff, 0x8000_0000, u32::MAX] {
            let mut buf = vec![0; element_size(uint32_size(value))];
            let end = encode_uint32_with_tl(0x02, value, &mut buf, 0);
            assert_eq!(end, buf.len());
            let (tlv, _) = read_tlv(&buf, 0).unwrap();
            assert_eq!(tlv.as_u32().unwrap(), value);
        }
        // 0x80 needs a leading zero to stay positive.
        let mut buf = vec![0; 4];
        encode_uint32_with_tl(0x02, 0x80, &mut buf, 0);
        assert_eq!(buf, vec![0x02, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn test_int32() {
        for value in [0, -1, 127, 128, -128, -129, i32::MIN, i32::MAX] {
            let mut buf = vec![0; element_size(int32_size(value))];
            encode_int32_with_tl(0x85, value, &mut buf, 0);
            let (tlv, _) = read_tlv(&buf, 0).unwrap();
            assert_eq!(tlv.as_i32().unwrap(), value);
        }
        assert_eq!(int32_size(-1), 1);
        assert_eq!(int32_size(128), 2);
    }

    #[test]
    fn test_decoders_check_bounds() {
        let buf = [0x01, 0x02];
        assert!(decode_uint32(&buf, 4, 0).is_err());
        assert!(decode_int32(&buf, 3, 1).is_err());
        assert!(decode_boolean(&buf, 1, 2).is_err());
        assert!(decode_float(&buf, 5, 0).is_err());
        assert!(decode_string(&buf, 3, 0).is_err());
        assert!(decode_uint32(&buf, usize::MAX, 1).is_err());
    }

    #[test]
    fn test_boolean() {
        let mut buf = [0; 3];
        encode_boolean(0x83, true, &mut buf, 0);
        assert_eq!(buf, [0x83, 0x01, 0xff]);
        assert!(decode_boolean(&buf, 1, 2).unwrap());
    }

    #[test]
    fn test_float() {
        let value = 12.5_f32.to_be_bytes();
        let mut buf = [0; 7];
        encode_float(0x87, 8, &value, &mut buf, 0);
        assert_eq!(buf[..3], [0x87, 0x05, 0x08]);
        assert!((decode_float(&buf, 5, 2).unwrap() - 12.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_bit_string() {
        let mut buf = vec![0; bit_string_size(10)];
        encode_bit_string(0x84, 10, &[0xff, 0xff], &mut buf, 0);
        assert_eq!(buf, vec![0x84, 0x03, 0x06, 0xff, 0xc0]);

        // Short input is padded with zero octets.
        let mut buf = vec![0xaa; bit_string_size(11)];
        encode_bit_string(0x81, 11, &[0xf1], &mut buf, 0);
        assert_eq!(buf, vec![0x81, 0x03, 0x05, 0xf1, 0x00]);
    }

    #[test]
    fn test_encode_to_vec() {
        let buf = encode_to_vec(element_size(3), |buf, pos| {
            let pos = encode_tl(0xa0, 3, buf, pos);
            encode_boolean(0x80, true, buf, pos)
        });
        assert_eq!(buf, vec![0xa0, 0x03, 0x80, 0x01, 0xff]);
    }

    #[test]
    fn test_reader() {
        let buf = [0x80, 0x01, 0x05, 0xa1, 0x03, 0x1a, 0x01, b'x'];
        let mut reader = BerReader::new(&buf);
        assert_eq!(reader.expect(0x80).unwrap().as_u32().unwrap(), 5);
        assert!(reader.read_optional(0x82).unwrap().is_none());
        let inner = reader.expect(0xa1).unwrap();
        assert!(inner.is_constructed());
        let mut children = inner.children();
        assert_eq!(children.expect(0x1a).unwrap().as_identifier().unwrap(), "x");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reader_rejects_truncated_element() {
        let buf = [0x80, 0x05, 0x01];
        let mut reader = BerReader::new(&buf);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_writer_nested_lengths() {
        let mut writer = BerWriter::new();
        writer.constructed(0xa0, |w| {
            w.uint(0x02, 1);
            w.constructed(0xa1, |w| {
                w.string(0x1a, &"x".repeat(200));
            });
        });
        let buf = writer.into_vec();
        assert_eq!(&buf[..3], &[0xa0, 0x81, 0xd1]);
        assert_eq!(&buf[3..6], &[0x02, 0x01, 0x01]);
        assert_eq!(&buf[6..9], &[0xa1, 0x81, 0xcb]);
        assert_eq!(&buf[9..12], &[0x1a, 0x81, 0xc8]);
        assert_eq!(buf.len(), 212);
    }
}
