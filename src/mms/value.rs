//! The MMS data value.
//!
//! [`MmsValue`] is the tree shaped value carried by read, write and report PDUs and kept
//! in the server value cache. The BER form is the `Data` CHOICE of ISO 9506.

use std::fmt;

use snafu::{ResultExt as _, Snafu, ensure};
use time::OffsetDateTime;
use tracing::instrument;

use crate::mms::{
    SpanTraceWrapper,
    ber::{self, BerError, BerReader, Tlv},
};

/// Milliseconds between 1970-01-01 and the MMS epoch 1984-01-01.
pub const MMS_TO_UNIX_EPOCH_OFFSET: u64 = 441_763_200_000;
/// Milliseconds per day.
pub const MILLISECONDS_PER_DAY: u64 = 86_400_000;
/// Quality written by [`MmsValue::set_utc_time_ms`]: 10 bits of time accuracy.
pub const UTC_TIME_DEFAULT_QUALITY: u8 = 0x0a;
/// Maximum nesting of arrays and structures accepted by the decoder.
pub const MAX_DECODE_NESTING: usize = 32;

/// Data CHOICE tags.
pub mod tag {
    /// Failure branch of an AccessResult.
    pub const ACCESS_ERROR: u8 = 0x80;
    /// Array of values.
    pub const ARRAY: u8 = 0xa1;
    /// Structure of values.
    pub const STRUCTURE: u8 = 0xa2;
    /// Boolean.
    pub const BOOLEAN: u8 = 0x83;
    /// Bit string.
    pub const BIT_STRING: u8 = 0x84;
    /// Signed integer.
    pub const INTEGER: u8 = 0x85;
    /// Unsigned integer.
    pub const UNSIGNED: u8 = 0x86;
    /// Floating point.
    pub const FLOAT: u8 = 0x87;
    /// Octet string.
    pub const OCTET_STRING: u8 = 0x89;
    /// Visible string.
    pub const VISIBLE_STRING: u8 = 0x8a;
    /// Binary time.
    pub const BINARY_TIME: u8 = 0x8c;
    /// MMS (unicode) string.
    pub const MMS_STRING: u8 = 0x90;
    /// UTC time.
    pub const UTC_TIME: u8 = 0x91;
}

/// An MMS data access error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataAccessError {
    /// object-invalidated
    ObjectInvalidated,
    /// hardware-fault
    HardwareFault,
    /// temporarily-unavailable
    TemporarilyUnavailable,
    /// object-access-denied
    ObjectAccessDenied,
    /// object-undefined
    ObjectUndefined,
    /// invalid-address
    InvalidAddress,
    /// type-unsupported
    TypeUnsupported,
    /// type-inconsistent
    TypeInconsistent,
    /// object-attribute-inconsistent
    ObjectAttributeInconsistent,
    /// object-access-unsupported
    ObjectAccessUnsupported,
    /// object-non-existent
    ObjectNonExistent,
    /// object-value-invalid
    ObjectValueInvalid,
    /// A code outside of the standard range.
    Unknown(u32),
}

impl DataAccessError {
    /// The code used on the wire.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::ObjectInvalidated => 0,
            Self::HardwareFault => 1,
            Self::TemporarilyUnavailable => 2,
            Self::ObjectAccessDenied => 3,
            Self::ObjectUndefined => 4,
            Self::InvalidAddress => 5,
            Self::TypeUnsupported => 6,
            Self::TypeInconsistent => 7,
            Self::ObjectAttributeInconsistent => 8,
            Self::ObjectAccessUnsupported => 9,
            Self::ObjectNonExistent => 10,
            Self::ObjectValueInvalid => 11,
            Self::Unknown(code) => code,
        }
    }

    /// Map a wire code to the error.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::ObjectInvalidated,
            1 => Self::HardwareFault,
            2 => Self::TemporarilyUnavailable,
            3 => Self::ObjectAccessDenied,
            4 => Self::ObjectUndefined,
            5 => Self::InvalidAddress,
            6 => Self::TypeUnsupported,
            7 => Self::TypeInconsistent,
            8 => Self::ObjectAttributeInconsistent,
            9 => Self::ObjectAccessUnsupported,
            10 => Self::ObjectNonExistent,
            11 => Self::ObjectValueInvalid,
            code => Self::Unknown(code),
        }
    }
}

impl fmt::Display for DataAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// A signed integer with its maximum width in octets. Equality only looks at the value.
#[derive(Debug, Clone, Copy, Eq)]
pub struct MmsInteger {
    /// The value.
    pub value: i64,
    /// Maximum number of octets the value may use (4 or 8).
    pub max_size: usize,
}

/// An unsigned integer with its maximum width in octets. Equality only looks at the value.
#[derive(Debug, Clone, Copy, Eq)]
pub struct MmsUnsigned {
    /// The value.
    pub value: u64,
    /// Maximum number of octets the value may use, excluding a leading zero octet.
    pub max_size: usize,
}

impl PartialEq for MmsInteger {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialEq for MmsUnsigned {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

/// A floating point value of 32 or 64 bits.
#[derive(Debug, Clone, Copy)]
pub enum MmsFloat {
    /// Single precision.
    Single(f32),
    /// Double precision.
    Double(f64),
}

impl MmsFloat {
    /// The format width in bits.
    #[must_use]
    pub const fn format_width(&self) -> u8 {
        match self {
            Self::Single(_) => 32,
            Self::Double(_) => 64,
        }
    }

    /// The exponent width in bits, as sent in the first octet on the wire.
    #[must_use]
    pub const fn exponent_width(&self) -> u8 {
        match self {
            Self::Single(_) => 8,
            Self::Double(_) => 11,
        }
    }
}

impl PartialEq for MmsFloat {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Single(a), Self::Single(b)) => a.to_bits() == b.to_bits(),
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

/// A bit string. Bit 0 is the most significant bit of the first octet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitString {
    /// Number of bits.
    pub size: usize,
    /// Packed bits, `ceil(size / 8)` octets.
    pub buf: Vec<u8>,
}

/// An octet string with its maximum size. Equality only looks at the content.
#[derive(Debug, Clone, Eq)]
pub struct OctetString {
    /// Current content.
    pub buf: Vec<u8>,
    /// Maximum number of octets.
    pub max_size: usize,
}

impl PartialEq for OctetString {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

/// Binary time as time of day with an optional day count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryTime {
    /// Milliseconds since midnight followed by the days since 1984-01-01.
    pub buf: [u8; 6],
    /// True for the six octet form that carries the date.
    pub with_date: bool,
}

impl BinaryTime {
    /// The octets sent on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        if self.with_date {
            &self.buf
        } else {
            &self.buf[..4]
        }
    }
}

/// An MMS data value.
#[derive(Debug, Clone, PartialEq)]
pub enum MmsValue {
    /// Array of values of the same type.
    Array(Vec<MmsValue>),
    /// Structure of named components, in declaration order.
    Structure(Vec<MmsValue>),
    /// Boolean.
    Boolean(bool),
    /// Signed integer.
    Integer(MmsInteger),
    /// Unsigned integer.
    Unsigned(MmsUnsigned),
    /// Floating point.
    Float(MmsFloat),
    /// Bit string.
    BitString(BitString),
    /// Octet string.
    OctetString(OctetString),
    /// Visible string. `None` is a null string.
    VisibleString(Option<String>),
    /// Unicode string. `None` is a null string.
    MmsString(Option<String>),
    /// UTC time: seconds (big endian), fraction of second and quality.
    UtcTime([u8; 8]),
    /// Binary time.
    BinaryTime(BinaryTime),
    /// Access error in place of a value.
    DataAccessError(DataAccessError),
}

/// The kind of a value, without its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MmsType {
    Array,
    Structure,
    Boolean,
    Integer,
    Unsigned,
    Float,
    BitString,
    OctetString,
    VisibleString,
    MmsString,
    UtcTime,
    BinaryTime,
    DataAccessError,
}

impl MmsValue {
    /// A boolean value.
    #[must_use]
    pub const fn new_boolean(value: bool) -> Self {
        Self::Boolean(value)
    }

    /// A signed integer with a maximum width of `bits` (up to 64).
    #[must_use]
    pub const fn new_integer(value: i64, bits: usize) -> Self {
        Self::Integer(MmsInteger { value, max_size: if bits <= 32 { 4 } else { 8 } })
    }

    /// A 32 bit signed integer.
    #[must_use]
    pub const fn new_i32(value: i32) -> Self {
        Self::Integer(MmsInteger { value: value as i64, max_size: 4 })
    }

    /// An unsigned integer with a maximum width of `bits` (up to 64).
    #[must_use]
    pub const fn new_unsigned(value: u64, bits: usize) -> Self {
        Self::Unsigned(MmsUnsigned { value, max_size: if bits <= 32 { 4 } else { 8 } })
    }

    /// A 32 bit unsigned integer.
    #[must_use]
    pub const fn new_u32(value: u32) -> Self {
        Self::Unsigned(MmsUnsigned { value: value as u64, max_size: 4 })
    }

    /// A single precision float.
    #[must_use]
    pub const fn new_float(value: f32) -> Self {
        Self::Float(MmsFloat::Single(value))
    }

    /// A double precision float.
    #[must_use]
    pub const fn new_double(value: f64) -> Self {
        Self::Float(MmsFloat::Double(value))
    }

    /// A bit string of `size` cleared bits.
    #[must_use]
    pub fn new_bit_string(size: usize) -> Self {
        Self::BitString(BitString { size, buf: vec![0; size.div_ceil(8)] })
    }

    /// An octet string with `size` zero octets that may grow up to `max_size`.
    #[must_use]
    pub fn new_octet_string(size: usize, max_size: usize) -> Self {
        Self::OctetString(OctetString { buf: vec![0; size.min(max_size)], max_size })
    }

    /// A visible string.
    #[must_use]
    pub fn new_visible_string(value: impl Into<String>) -> Self {
        Self::VisibleString(Some(value.into()))
    }

    /// A unicode string.
    #[must_use]
    pub fn new_mms_string(value: impl Into<String>) -> Self {
        Self::MmsString(Some(value.into()))
    }

    /// A UTC time set to `seconds` since the unix epoch.
    #[must_use]
    pub fn new_utc_time(seconds: u32) -> Self {
        let mut value = Self::UtcTime([0; 8]);
        value.set_utc_time(seconds);
        value
    }

    /// A zeroed binary time, with or without the date part.
    #[must_use]
    pub const fn new_binary_time(with_date: bool) -> Self {
        Self::BinaryTime(BinaryTime { buf: [0; 6], with_date })
    }

    /// An array of `size` copies of `element`.
    #[must_use]
    pub fn new_array(element: &Self, size: usize) -> Self {
        Self::Array(vec![element.clone(); size])
    }

    /// A structure made of `components`.
    #[must_use]
    pub const fn new_structure(components: Vec<Self>) -> Self {
        Self::Structure(components)
    }

    /// A data access error.
    #[must_use]
    pub const fn new_data_access_error(error: DataAccessError) -> Self {
        Self::DataAccessError(error)
    }

    /// The kind of this value.
    #[must_use]
    pub const fn get_type(&self) -> MmsType {
        match self {
            Self::Array(_) => MmsType::Array,
            Self::Structure(_) => MmsType::Structure,
            Self::Boolean(_) => MmsType::Boolean,
            Self::Integer(_) => MmsType::Integer,
            Self::Unsigned(_) => MmsType::Unsigned,
            Self::Float(_) => MmsType::Float,
            Self::BitString(_) => MmsType::BitString,
            Self::OctetString(_) => MmsType::OctetString,
            Self::VisibleString(_) => MmsType::VisibleString,
            Self::MmsString(_) => MmsType::MmsString,
            Self::UtcTime(_) => MmsType::UtcTime,
            Self::BinaryTime(_) => MmsType::BinaryTime,
            Self::DataAccessError(_) => MmsType::DataAccessError,
        }
    }

    /// Structural equality.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self == other
    }

    /// Replace the content of `self` with the content of `source`.
    ///
    /// Fails without touching `self` if the types differ, if bit string sizes differ, if
    /// the octet string capacities differ, if the float widths differ or if the source
    /// does not fit.
    #[must_use]
    pub fn update(&mut self, source: &Self) -> bool {
        if !self.is_update_compatible(source) {
            return false;
        }
        match (self, source) {
            (Self::Array(dst), Self::Array(src)) | (Self::Structure(dst), Self::Structure(src)) => {
                for (d, s) in dst.iter_mut().zip(src) {
                    // Compatibility of every child was checked above.
                    let _ = d.update(s);
                }
            }
            (Self::Integer(dst), Self::Integer(src)) => dst.value = src.value,
            (Self::Unsigned(dst), Self::Unsigned(src)) => dst.value = src.value,
            (Self::OctetString(dst), Self::OctetString(src)) => dst.buf.clone_from(&src.buf),
            (dst, src) => *dst = src.clone(),
        }
        true
    }

    /// Check that [`Self::update`] would succeed.
    fn is_update_compatible(&self, source: &Self) -> bool {
        match (self, source) {
            (Self::Array(dst), Self::Array(src)) | (Self::Structure(dst), Self::Structure(src)) => {
                dst.len() == src.len()
                    && dst.iter().zip(src).all(|(d, s)| d.is_update_compatible(s))
            }
            (Self::Integer(dst), Self::Integer(src)) => {
                ber::int64_size(src.value) <= dst.max_size
            }
            (Self::Unsigned(dst), Self::Unsigned(src)) => {
                unsigned_content_size(src.value) <= dst.max_size
            }
            (Self::Float(dst), Self::Float(src)) => dst.format_width() == src.format_width(),
            (Self::BitString(dst), Self::BitString(src)) => dst.size == src.size,
            (Self::OctetString(dst), Self::OctetString(src)) => {
                dst.max_size == src.max_size && src.buf.len() <= dst.max_size
            }
            (Self::BinaryTime(dst), Self::BinaryTime(src)) => dst.with_date == src.with_date,
            (dst, src) => dst.get_type() == src.get_type(),
        }
    }

    /// Number of elements of an array or structure, zero otherwise.
    #[must_use]
    pub fn element_count(&self) -> usize {
        match self {
            Self::Array(elements) | Self::Structure(elements) => elements.len(),
            _ => 0,
        }
    }

    /// Element `index` of an array or structure.
    #[must_use]
    pub fn get_element(&self, index: usize) -> Option<&Self> {
        match self {
            Self::Array(elements) | Self::Structure(elements) => elements.get(index),
            _ => None,
        }
    }

    /// Mutable element `index` of an array or structure.
    pub fn get_element_mut(&mut self, index: usize) -> Option<&mut Self> {
        match self {
            Self::Array(elements) | Self::Structure(elements) => elements.get_mut(index),
            _ => None,
        }
    }

    /// Replace element `index`. Out of range indices are ignored.
    pub fn set_element(&mut self, index: usize, value: Self) {
        if let Some(element) = self.get_element_mut(index) {
            *element = value;
        }
    }

    /// Read bit `index` of a bit string. Out of range bits read as false.
    #[must_use]
    pub fn get_bit(&self, index: usize) -> bool {
        match self {
            Self::BitString(bits) if index < bits.size => {
                bits.buf[index / 8] & (0x80 >> (index % 8)) != 0
            }
            _ => false,
        }
    }

    /// Set bit `index` of a bit string. Out of range bits are ignored.
    pub fn set_bit(&mut self, index: usize, value: bool) {
        if let Self::BitString(bits) = self
            && index < bits.size
        {
            let mask = 0x80 >> (index % 8);
            if value {
                bits.buf[index / 8] |= mask;
            } else {
                bits.buf[index / 8] &= !mask;
            }
        }
    }

    /// Number of bits of a bit string.
    #[must_use]
    pub const fn bit_string_size(&self) -> usize {
        match self {
            Self::BitString(bits) => bits.size,
            _ => 0,
        }
    }

    /// Set the bits of a bit string from an integer. Bit 0 receives the least significant
    /// bit.
    pub fn set_bit_string_from_integer(&mut self, value: u32) {
        for i in 0..self.bit_string_size().min(32) {
            self.set_bit(i, (value >> i) & 1 == 1);
        }
    }

    /// Read a bit string as an integer. Bit 0 becomes the least significant bit.
    #[must_use]
    pub fn bit_string_to_integer(&self) -> u32 {
        (0..self.bit_string_size().min(32))
            .filter(|i| self.get_bit(*i))
            .fold(0, |acc, i| acc | (1 << i))
    }

    /// Boolean content.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer or unsigned content as i64.
    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(int) => Some(int.value),
            Self::Unsigned(uint) => i64::try_from(uint.value).ok(),
            _ => None,
        }
    }

    /// Integer or unsigned content as i32.
    #[must_use]
    pub fn to_i32(&self) -> Option<i32> {
        self.to_i64().and_then(|value| i32::try_from(value).ok())
    }

    /// Integer or unsigned content as u32.
    #[must_use]
    pub fn to_u32(&self) -> Option<u32> {
        match self {
            Self::Unsigned(uint) => u32::try_from(uint.value).ok(),
            Self::Integer(int) => u32::try_from(int.value).ok(),
            _ => None,
        }
    }

    /// Set the value of an integer. Returns false for other types or if the value does
    /// not fit.
    #[must_use]
    pub fn set_i64(&mut self, value: i64) -> bool {
        match self {
            Self::Integer(int) if ber::int64_size(value) <= int.max_size => {
                int.value = value;
                true
            }
            _ => false,
        }
    }

    /// Set the value of an integer.
    #[must_use]
    pub fn set_i32(&mut self, value: i32) -> bool {
        self.set_i64(i64::from(value))
    }

    /// Set the value of an unsigned integer.
    #[must_use]
    pub fn set_u32(&mut self, value: u32) -> bool {
        match self {
            Self::Unsigned(uint) if unsigned_content_size(u64::from(value)) <= uint.max_size => {
                uint.value = u64::from(value);
                true
            }
            _ => false,
        }
    }

    /// Float content as f32.
    #[must_use]
    pub fn to_f32(&self) -> Option<f32> {
        match self {
            Self::Float(MmsFloat::Single(value)) => Some(*value),
            Self::Float(MmsFloat::Double(value)) => Some(*value as f32),
            _ => None,
        }
    }

    /// Float content as f64.
    #[must_use]
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Float(MmsFloat::Single(value)) => Some(f64::from(*value)),
            Self::Float(MmsFloat::Double(value)) => Some(*value),
            _ => None,
        }
    }

    /// Set a float, keeping its format width.
    pub fn set_f32(&mut self, value: f32) {
        match self {
            Self::Float(MmsFloat::Single(v)) => *v = value,
            Self::Float(MmsFloat::Double(v)) => *v = f64::from(value),
            _ => {}
        }
    }

    /// Set a float, keeping its format width.
    pub fn set_f64(&mut self, value: f64) {
        match self {
            Self::Float(MmsFloat::Single(v)) => *v = value as f32,
            Self::Float(MmsFloat::Double(v)) => *v = value,
            _ => {}
        }
    }

    /// String content of a visible or unicode string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::VisibleString(value) | Self::MmsString(value) => value.as_deref(),
            _ => None,
        }
    }

    /// Octets of an octet string.
    #[must_use]
    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Self::OctetString(octets) => Some(&octets.buf),
            _ => None,
        }
    }

    /// Replace the content of an octet string. Fails if `value` exceeds the maximum size.
    #[must_use]
    pub fn set_octet_string(&mut self, value: &[u8]) -> bool {
        match self {
            Self::OctetString(octets) if value.len() <= octets.max_size => {
                octets.buf = value.to_vec();
                true
            }
            _ => false,
        }
    }

    /// Set a UTC time to whole seconds since the unix epoch.
    pub fn set_utc_time(&mut self, seconds: u32) {
        if let Self::UtcTime(buf) = self {
            buf[..4].copy_from_slice(&seconds.to_be_bytes());
            buf[4..].fill(0);
        }
    }

    /// Set a UTC time to milliseconds since the unix epoch.
    pub fn set_utc_time_ms(&mut self, milliseconds: u64) {
        if let Self::UtcTime(buf) = self {
            let seconds = (milliseconds / 1000) as u32;
            let ms = (milliseconds % 1000) as u32;
            let fraction = ms * 16777 + (ms * 216) / 1000;
            buf[..4].copy_from_slice(&seconds.to_be_bytes());
            buf[4..7].copy_from_slice(&fraction.to_be_bytes()[1..]);
            buf[7] = UTC_TIME_DEFAULT_QUALITY;
        }
    }

    /// Copy a UTC time from its wire representation.
    pub fn set_utc_time_by_buffer(&mut self, value: &[u8; 8]) {
        if let Self::UtcTime(buf) = self {
            *buf = *value;
        }
    }

    /// Seconds of a UTC time.
    #[must_use]
    pub fn utc_time_seconds(&self) -> Option<u32> {
        match self {
            Self::UtcTime(buf) => Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
            _ => None,
        }
    }

    /// Milliseconds since the unix epoch of a UTC time.
    #[must_use]
    pub fn utc_time_in_ms(&self) -> Option<u64> {
        match self {
            Self::UtcTime(buf) => {
                let seconds = u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                let fraction = u64::from(u32::from_be_bytes([0, buf[4], buf[5], buf[6]]));
                Some(seconds * 1000 + fraction / 16777)
            }
            _ => None,
        }
    }

    /// Quality octet of a UTC time.
    #[must_use]
    pub const fn utc_time_quality(&self) -> Option<u8> {
        match self {
            Self::UtcTime(buf) => Some(buf[7]),
            _ => None,
        }
    }

    /// Set a binary time to milliseconds since the unix epoch.
    pub fn set_binary_time_ms(&mut self, milliseconds: u64) {
        if let Self::BinaryTime(time) = self {
            let mms_time = milliseconds.saturating_sub(MMS_TO_UNIX_EPOCH_OFFSET);
            let ms_of_day = (mms_time % MILLISECONDS_PER_DAY) as u32;
            time.buf[..4].copy_from_slice(&ms_of_day.to_be_bytes());
            let days = (mms_time / MILLISECONDS_PER_DAY) as u16;
            time.buf[4..].copy_from_slice(&days.to_be_bytes());
            if !time.with_date {
                time.buf[4..].fill(0);
            }
        }
    }

    /// Milliseconds since the unix epoch of a binary time.
    ///
    /// The four octet form only carries the time of day and yields the milliseconds since
    /// midnight.
    #[must_use]
    pub fn binary_time_in_ms(&self) -> Option<u64> {
        match self {
            Self::BinaryTime(time) => {
                let b = &time.buf;
                let ms_of_day = u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                if time.with_date {
                    let days = u64::from(u16::from_be_bytes([b[4], b[5]]));
                    Some(days * MILLISECONDS_PER_DAY + MMS_TO_UNIX_EPOCH_OFFSET + ms_of_day)
                } else {
                    Some(ms_of_day)
                }
            }
            _ => None,
        }
    }

    /// UTC time or binary time (with date) as a date time.
    #[must_use]
    pub fn to_date_time(&self) -> Option<OffsetDateTime> {
        let ms = match self {
            Self::UtcTime(_) => self.utc_time_in_ms()?,
            Self::BinaryTime(time) if time.with_date => self.binary_time_in_ms()?,
            _ => return None,
        };
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
    }

    /// Set a UTC time or binary time from a date time. Times before the epoch are clamped.
    pub fn set_date_time(&mut self, value: OffsetDateTime) {
        let ms = u64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or_default();
        match self {
            Self::UtcTime(_) => self.set_utc_time_ms(ms),
            Self::BinaryTime(_) => self.set_binary_time_ms(ms),
            _ => {}
        }
    }

    /// Encoded size of this value, including tag and length.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Size of the content octets.
    fn content_size(&self) -> usize {
        match self {
            Self::Array(elements) | Self::Structure(elements) => {
                elements.iter().map(Self::encoded_size).sum()
            }
            Self::Boolean(_) => 1,
            Self::Integer(int) => ber::int64_size(int.value),
            Self::Unsigned(uint) => unsigned_encoded_len(uint.value),
            Self::Float(MmsFloat::Single(_)) => 5,
            Self::Float(MmsFloat::Double(_)) => 9,
            Self::BitString(bits) => bits.size.div_ceil(8) + 1,
            Self::OctetString(octets) => octets.buf.len(),
            Self::VisibleString(value) | Self::MmsString(value) => {
                value.as_ref().map_or(0, String::len)
            }
            Self::UtcTime(_) => 8,
            Self::BinaryTime(time) => time.as_bytes().len(),
            Self::DataAccessError(error) => ber::uint32_size(error.code()),
        }
    }

    /// Encode this value at `pos` of a buffer sized with [`Self::encoded_size`].
    ///
    /// A data access error is written as the failure branch of an AccessResult.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        match self {
            Self::Array(elements) | Self::Structure(elements) => {
                let tag = if matches!(self, Self::Array(_)) {
                    tag::ARRAY
                } else {
                    tag::STRUCTURE
                };
                let mut pos = ber::encode_tl(tag, self.content_size(), buf, pos);
                for element in elements {
                    pos = element.encode(buf, pos);
                }
                pos
            }
            Self::Boolean(value) => ber::encode_boolean(tag::BOOLEAN, *value, buf, pos),
            Self::Integer(int) => ber::encode_int64_with_tl(tag::INTEGER, int.value, buf, pos),
            Self::Unsigned(uint) => {
                let bytes = uint.value.to_be_bytes();
                let len = unsigned_encoded_len(uint.value);
                let mut padded = [0_u8; 9];
                padded[1..].copy_from_slice(&bytes);
                ber::encode_octet_string_with_tag(tag::UNSIGNED, &padded[9 - len..], buf, pos)
            }
            Self::Float(float @ MmsFloat::Single(value)) => {
                let exponent_width = float.exponent_width();
                ber::encode_float(tag::FLOAT, exponent_width, &value.to_be_bytes(), buf, pos)
            }
            Self::Float(float @ MmsFloat::Double(value)) => {
                let exponent_width = float.exponent_width();
                ber::encode_float(tag::FLOAT, exponent_width, &value.to_be_bytes(), buf, pos)
            }
            Self::BitString(bits) => {
                ber::encode_bit_string(tag::BIT_STRING, bits.size, &bits.buf, buf, pos)
            }
            Self::OctetString(octets) => {
                ber::encode_octet_string_with_tag(tag::OCTET_STRING, &octets.buf, buf, pos)
            }
            Self::VisibleString(value) => ber::encode_string_with_tag(
                tag::VISIBLE_STRING,
                value.as_deref().unwrap_or_default(),
                buf,
                pos,
            ),
            Self::MmsString(value) => ber::encode_string_with_tag(
                tag::MMS_STRING,
                value.as_deref().unwrap_or_default(),
                buf,
                pos,
            ),
            Self::UtcTime(time) => ber::encode_octet_string_with_tag(tag::UTC_TIME, time, buf, pos),
            Self::BinaryTime(time) => {
                ber::encode_octet_string_with_tag(tag::BINARY_TIME, time.as_bytes(), buf, pos)
            }
            Self::DataAccessError(error) => {
                ber::encode_uint32_with_tl(tag::ACCESS_ERROR, error.code(), buf, pos)
            }
        }
    }

    /// Encode this value into a new buffer.
    #[must_use]
    pub fn to_ber(&self) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_size()];
        self.encode(&mut buf, 0);
        buf
    }

    /// Decode a value (or an access error) starting at `pos`.
    ///
    /// Returns the value and the position after it.
    #[instrument(level = "debug", skip(buf))]
    pub fn decode(buf: &[u8], pos: usize) -> Result<(Self, usize), ValueError> {
        let (tlv, next) = ber::read_tlv(buf, pos).context(Ber)?;
        Ok((Self::from_tlv(&tlv)?, next))
    }

    /// Decode a value from an element already split by a [`BerReader`].
    pub fn from_tlv(tlv: &Tlv<'_>) -> Result<Self, ValueError> {
        decode_data(tlv, 0)
    }

    /// Decode every element of `buf` as a value.
    pub fn decode_list(buf: &[u8]) -> Result<Vec<Self>, ValueError> {
        BerReader::new(buf).map(|tlv| Self::from_tlv(&tlv.context(Ber)?)).collect()
    }
}

/// Number of content octets of an unsigned value including the sign octet.
fn unsigned_encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    // One extra bit keeps the value positive.
    (bits + 1).div_ceil(8).max(1)
}

/// Number of content octets of an unsigned value without the sign octet.
fn unsigned_content_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Decode one Data element.
fn decode_data(tlv: &Tlv<'_>, depth: usize) -> Result<MmsValue, ValueError> {
    let value = tlv.value;
    let len = value.len();
    Ok(match tlv.tag {
        tag::ARRAY | tag::STRUCTURE => {
            ensure!(depth < MAX_DECODE_NESTING, NestingTooDeep { depth });
            let elements = tlv
                .children()
                .map(|child| decode_data(&child.context(Ber)?, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            if tlv.tag == tag::ARRAY {
                MmsValue::Array(elements)
            } else {
                MmsValue::Structure(elements)
            }
        }
        tag::BOOLEAN => MmsValue::Boolean(ber::decode_boolean(value, len, 0).context(Ber)?),
        tag::BIT_STRING => {
            ensure!(len >= 1, InvalidEncoding { tag: tlv.tag });
            let padding = usize::from(value[0]);
            ensure!(padding < 8 && (len > 1 || padding == 0), InvalidEncoding { tag: tlv.tag });
            MmsValue::BitString(BitString {
                size: 8 * (len - 1) - padding,
                buf: value[1..].to_vec(),
            })
        }
        tag::INTEGER => {
            ensure!(len >= 1, InvalidEncoding { tag: tlv.tag });
            let int = ber::decode_int64(value, len, 0).context(Ber)?;
            MmsValue::Integer(MmsInteger { value: int, max_size: if len <= 4 { 4 } else { 8 } })
        }
        tag::UNSIGNED => {
            ensure!((1..=9).contains(&len), InvalidEncoding { tag: tlv.tag });
            ensure!(len < 9 || value[0] == 0, InvalidEncoding { tag: tlv.tag });
            let uint = value.iter().fold(0_u64, |acc, b| (acc << 8) | u64::from(*b));
            let size = unsigned_content_size(uint);
            MmsValue::Unsigned(MmsUnsigned { value: uint, max_size: if size <= 4 { 4 } else { 8 } })
        }
        tag::FLOAT => match len {
            5 => MmsValue::Float(MmsFloat::Single(ber::decode_float(value, len, 0).context(Ber)?)),
            9 => MmsValue::Float(MmsFloat::Double(ber::decode_double(value, len, 0).context(Ber)?)),
            _ => return InvalidEncoding { tag: tlv.tag }.fail(),
        },
        tag::OCTET_STRING => {
            MmsValue::OctetString(OctetString { buf: value.to_vec(), max_size: len })
        }
        tag::VISIBLE_STRING => {
            MmsValue::VisibleString(Some(ber::decode_string(value, len, 0).context(Ber)?))
        }
        tag::MMS_STRING => {
            MmsValue::MmsString(Some(ber::decode_string(value, len, 0).context(Ber)?))
        }
        tag::UTC_TIME => {
            let Ok(time) = <[u8; 8]>::try_from(value) else {
                return InvalidEncoding { tag: tlv.tag }.fail();
            };
            MmsValue::UtcTime(time)
        }
        tag::BINARY_TIME => {
            ensure!(len == 4 || len == 6, InvalidEncoding { tag: tlv.tag });
            let mut buf = [0_u8; 6];
            buf[..len].copy_from_slice(value);
            MmsValue::BinaryTime(BinaryTime { buf, with_date: len == 6 })
        }
        tag::ACCESS_ERROR => MmsValue::DataAccessError(DataAccessError::from_code(
            ber::decode_uint32(value, len, 0).context(Ber)?,
        )),
        tag => return UnsupportedDataTag { tag }.fail(),
    })
}

impl fmt::Display for MmsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(elements) | Self::Structure(elements) => {
                let (open, close) = if matches!(self, Self::Array(_)) {
                    ('[', ']')
                } else {
                    ('{', '}')
                };
                write!(f, "{open}")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "{close}")
            }
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Integer(int) => write!(f, "{}", int.value),
            Self::Unsigned(uint) => write!(f, "{}", uint.value),
            Self::Float(MmsFloat::Single(value)) => write!(f, "{value}"),
            Self::Float(MmsFloat::Double(value)) => write!(f, "{value}"),
            Self::BitString(bits) => {
                for i in 0..bits.size {
                    write!(f, "{}", u8::from(self.get_bit(i)))?;
                }
                Ok(())
            }
            Self::OctetString(octets) => {
                for byte in &octets.buf {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::VisibleString(value) | Self::MmsString(value) => {
                write!(f, "{}", value.as_deref().unwrap_or_default())
            }
            Self::UtcTime(_) => write!(f, "{}", self.utc_time_in_ms().unwrap_or_default()),
            Self::BinaryTime(_) => write!(f, "{}", self.binary_time_in_ms().unwrap_or_default()),
            Self::DataAccessError(error) => write!(f, "error: {error}"),
        }
    }
}

#[allow(missing_docs)]
/// Errors decoding values.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum ValueError {
    #[snafu(display("Malformed data element"))]
    Ber {
        source: BerError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unsupported data tag {tag:#04x}"))]
    UnsupportedDataTag {
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid encoding of data tag {tag:#04x}"))]
    InvalidEncoding {
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Data nested deeper than {depth} levels"))]
    NestingTooDeep {
        depth: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl ValueError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Ber { context, .. }
            | Self::UnsupportedDataTag { context, .. }
            | Self::InvalidEncoding { context, .. }
            | Self::NestingTooDeep { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::format_description::well_known::Rfc3339;

    use super::*;

    fn sample_values() -> Vec<MmsValue> {
        let mut bits = MmsValue::new_bit_string(13);
        bits.set_bit(0, true);
        bits.set_bit(12, true);
        let mut utc = MmsValue::new_utc_time(0);
        utc.set_utc_time_ms(1_705_329_045_123);
        let mut binary = MmsValue::new_binary_time(true);
        binary.set_binary_time_ms(1_705_329_045_123);
        vec![
            MmsValue::new_boolean(true),
            MmsValue::new_i32(-42),
            MmsValue::new_integer(i64::MIN, 64),
            MmsValue::new_u32(u32::MAX),
            MmsValue::new_unsigned(u64::MAX, 64),
            MmsValue::new_float(1.5),
            MmsValue::new_double(-2.25),
            bits,
            MmsValue::new_octet_string(3, 8),
            MmsValue::new_visible_string("LLN0"),
            MmsValue::new_mms_string("Zähler"),
            utc,
            binary,
            MmsValue::new_binary_time(false),
            MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent),
        ]
    }

    #[test]
    fn test_clone_is_equal_and_independent() {
        let leaves = sample_values();
        let mut all = leaves.clone();
        all.push(MmsValue::new_structure(leaves.clone()));
        all.push(MmsValue::new_array(&MmsValue::new_structure(leaves), 3));
        for value in all {
            let mut copy = value.clone();
            assert!(value.equals(&copy));
            match &mut copy {
                MmsValue::Structure(elements) | MmsValue::Array(elements) => {
                    elements.clear();
                }
                MmsValue::Boolean(b) => *b = !*b,
                other => *other = MmsValue::new_i32(7),
            }
            if value != MmsValue::new_i32(7) {
                assert!(!value.equals(&copy), "mutating the clone changed {value}");
            }
        }
    }

    #[test]
    fn test_encode_decode() {
        let leaves = sample_values();
        let value = MmsValue::new_structure(vec![
            MmsValue::new_array(&MmsValue::new_i32(3), 2),
            MmsValue::new_structure(leaves),
        ]);
        let buf = value.to_ber();
        let (decoded, end) = MmsValue::decode(&buf, 0).unwrap();
        assert_eq!(end, buf.len());
        assert!(decoded.equals(&value));
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(MmsValue::new_boolean(true).to_ber(), vec![0x83, 0x01, 0xff]);
        assert_eq!(MmsValue::new_i32(42).to_ber(), vec![0x85, 0x01, 0x2a]);
        assert_eq!(MmsValue::new_u32(200).to_ber(), vec![0x86, 0x02, 0x00, 0xc8]);
        assert_eq!(
            MmsValue::new_float(1.0).to_ber(),
            vec![0x87, 0x05, 0x08, 0x3f, 0x80, 0x00, 0x00]
        );
        assert_eq!(MmsValue::new_visible_string("ab").to_ber(), vec![0x8a, 0x02, b'a', b'b']);
        assert_eq!(
            MmsValue::new_data_access_error(DataAccessError::ObjectAccessDenied).to_ber(),
            vec![0x80, 0x01, 0x03]
        );
    }

    #[test]
    fn test_update_type_mismatch_leaves_value_unchanged() {
        let mut value = MmsValue::new_i32(5);
        assert!(!value.update(&MmsValue::new_boolean(true)));
        assert_eq!(value, MmsValue::new_i32(5));

        let mut bits = MmsValue::new_bit_string(8);
        assert!(!bits.update(&MmsValue::new_bit_string(9)));

        let mut octets = MmsValue::new_octet_string(0, 8);
        assert!(!octets.update(&MmsValue::new_octet_string(0, 16)));

        let mut float = MmsValue::new_float(1.0);
        assert!(!float.update(&MmsValue::new_double(1.0)));
        assert_eq!(float, MmsValue::new_float(1.0));

        let mut narrow = MmsValue::new_i32(0);
        assert!(!narrow.update(&MmsValue::new_integer(i64::MAX, 64)));
    }

    #[test]
    fn test_update_structure() {
        let mut value =
            MmsValue::new_structure(vec![MmsValue::new_i32(1), MmsValue::new_boolean(false)]);
        let source =
            MmsValue::new_structure(vec![MmsValue::new_i32(2), MmsValue::new_boolean(true)]);
        assert!(value.update(&source));
        assert!(value.equals(&source));

        // A mismatch deep inside leaves everything untouched.
        let bad = MmsValue::new_structure(vec![MmsValue::new_i32(9), MmsValue::new_i32(9)]);
        assert!(!value.update(&bad));
        assert!(value.equals(&source));
    }

    #[test]
    fn test_bit_operations() {
        let size = 21;
        let mut value = MmsValue::new_bit_string(size);
        for i in 0..size {
            value.set_bit(i, true);
            assert!(value.get_bit(i));
        }
        value.set_bit(size, true);
        assert!(!value.get_bit(size));
        assert!(!value.get_bit(size + 100));

        let mut value = MmsValue::new_bit_string(8);
        value.set_bit(0, true);
        assert_eq!(value.to_ber(), vec![0x84, 0x02, 0x00, 0x80]);
        value.set_bit(0, false);
        assert!(!value.get_bit(0));
    }

    #[test]
    fn test_bit_string_integer() {
        let mut value = MmsValue::new_bit_string(6);
        value.set_bit_string_from_integer(0b10_0101);
        assert!(value.get_bit(0));
        assert!(!value.get_bit(1));
        assert!(value.get_bit(5));
        assert_eq!(value.bit_string_to_integer(), 0b10_0101);
    }

    #[test]
    fn test_utc_time_ms_round_trip() {
        let mut value = MmsValue::new_utc_time(0);
        for ms in [0, 1, 999, 1000, 1_705_329_045_123, 4_294_967_295_999] {
            value.set_utc_time_ms(ms);
            assert_eq!(value.utc_time_in_ms(), Some(ms));
            assert_eq!(value.utc_time_quality(), Some(UTC_TIME_DEFAULT_QUALITY));
        }
    }

    #[test]
    fn test_utc_time_is_big_endian() {
        let value = MmsValue::new_utc_time(0x0102_0304);
        let MmsValue::UtcTime(buf) = value else { panic!("not a utc time") };
        assert_eq!(buf[..4], [1, 2, 3, 4]);
    }

    #[test]
    fn test_binary_time() {
        let mut value = MmsValue::new_binary_time(true);
        value.set_date_time(OffsetDateTime::parse("2025-11-14T14:29:14.054Z", &Rfc3339).unwrap());
        let MmsValue::BinaryTime(time) = value else { panic!("not a binary time") };
        assert_eq!(time.as_bytes(), [0x03, 0x1b, 0xce, 0xc6, 0x3b, 0xbd]);
        assert_eq!(
            value.to_date_time(),
            Some(OffsetDateTime::parse("2025-11-14T14:29:14.054Z", &Rfc3339).unwrap())
        );

        let mut time_of_day = MmsValue::new_binary_time(false);
        time_of_day.set_binary_time_ms(MMS_TO_UNIX_EPOCH_OFFSET + 5 * MILLISECONDS_PER_DAY + 1234);
        assert_eq!(time_of_day.binary_time_in_ms(), Some(1234));
        assert_eq!(time_of_day.encoded_size(), 6);
    }

    #[test]
    fn test_elements_are_bounds_checked() {
        let mut value = MmsValue::new_array(&MmsValue::new_i32(0), 2);
        assert!(value.get_element(2).is_none());
        value.set_element(5, MmsValue::new_i32(1));
        value.set_element(1, MmsValue::new_i32(1));
        assert_eq!(value.get_element(1), Some(&MmsValue::new_i32(1)));
        assert_eq!(value.element_count(), 2);
        assert!(MmsValue::new_i32(0).get_element(0).is_none());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Bit string with padding of 8.
        assert!(MmsValue::decode(&[0x84, 0x02, 0x08, 0x00], 0).is_err());
        // Float with invalid length.
        assert!(MmsValue::decode(&[0x87, 0x02, 0x08, 0x00], 0).is_err());
        // Structure announcing more content than available.
        assert!(MmsValue::decode(&[0xa2, 0x05, 0x83, 0x01, 0x00], 0).is_err());
        // Unknown tag.
        assert!(MmsValue::decode(&[0x8f, 0x00], 0).is_err());
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let mut buf = vec![0x83, 0x01, 0x00];
        for _ in 0..=MAX_DECODE_NESTING {
            let mut outer = vec![0xa2];
            let mut length = vec![0; ber::determine_length_size(buf.len())];
            ber::encode_length(buf.len(), &mut length, 0);
            outer.extend(length);
            outer.extend(buf);
            buf = outer;
        }
        assert!(MmsValue::decode(&buf, 0).is_err());
    }
}
