//! Type specifications of MMS named variables.
//!
//! A [`MmsTypeSpec`] describes the shape of a value. The server uses it to build the
//! initial cache values, to check written values and to resolve `$` separated
//! component paths. The BER form is the `TypeSpecification` CHOICE returned by
//! GetVariableAccessAttributes.

use snafu::{ResultExt as _, Snafu, ensure};
use tracing::instrument;

use crate::mms::{
    SpanTraceWrapper,
    ber::{self, BerError, BerReader, Tlv},
    value::{
        BinaryTime, BitString, MAX_DECODE_NESTING, MmsFloat, MmsInteger, MmsUnsigned, MmsValue,
        OctetString,
    },
};

/// Separator of component names inside an MMS item name.
pub const COMPONENT_SEPARATOR: char = '$';

/// Tags of the TypeSpecification CHOICE.
pub mod tag {
    /// Array type.
    pub const ARRAY: u8 = 0xa1;
    /// Structure type.
    pub const STRUCTURE: u8 = 0xa2;
    /// Boolean.
    pub const BOOLEAN: u8 = 0x83;
    /// Bit string with its size.
    pub const BIT_STRING: u8 = 0x84;
    /// Integer with its width in bits.
    pub const INTEGER: u8 = 0x85;
    /// Unsigned with its width in bits.
    pub const UNSIGNED: u8 = 0x86;
    /// Floating point with format and exponent widths.
    pub const FLOAT: u8 = 0xa7;
    /// Octet string with its size.
    pub const OCTET_STRING: u8 = 0x89;
    /// Visible string with its size.
    pub const VISIBLE_STRING: u8 = 0x8a;
    /// Binary time, true when the date is included.
    pub const BINARY_TIME: u8 = 0x8c;
    /// Unicode string with its size.
    pub const MMS_STRING: u8 = 0x90;
    /// UTC time.
    pub const UTC_TIME: u8 = 0x91;
}

/// The kind of a type specification.
///
/// Sizes of strings are signed. A negative size is a variable size whose absolute value
/// is the maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed size array of elements of the same type.
    Array {
        /// Number of elements.
        element_count: u32,
        /// Type of every element.
        element: Box<MmsTypeSpec>,
    },
    /// Structure of named components.
    Structure(Vec<MmsTypeSpec>),
    /// Boolean.
    Boolean,
    /// Signed integer of the given width in bits.
    Integer(u8),
    /// Unsigned integer of the given width in bits.
    Unsigned(u8),
    /// Floating point.
    Float {
        /// Total width in bits, 32 or 64.
        format_width: u8,
        /// Exponent width in bits.
        exponent_width: u8,
    },
    /// Bit string.
    BitString(i32),
    /// Octet string.
    OctetString(i32),
    /// Visible string.
    VisibleString(i32),
    /// Unicode string.
    MmsString(i32),
    /// UTC time.
    UtcTime,
    /// Binary time.
    BinaryTime {
        /// True for the six octet form.
        with_date: bool,
    },
}

/// A named type specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmsTypeSpec {
    /// Name of the variable or component. Array elements have an empty name.
    pub name: String,
    /// The type.
    pub kind: TypeKind,
}

impl MmsTypeSpec {
    /// A type specification named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self { name: name.into(), kind }
    }

    /// A structure of `children`.
    #[must_use]
    pub fn structure(name: impl Into<String>, children: Vec<Self>) -> Self {
        Self::new(name, TypeKind::Structure(children))
    }

    /// An array of `element_count` elements of type `element`.
    #[must_use]
    pub fn array(name: impl Into<String>, element_count: u32, element: Self) -> Self {
        Self::new(name, TypeKind::Array { element_count, element: Box::new(element) })
    }

    /// A boolean.
    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Boolean)
    }

    /// A signed integer of `bits` bits.
    #[must_use]
    pub fn integer(name: impl Into<String>, bits: u8) -> Self {
        Self::new(name, TypeKind::Integer(bits))
    }

    /// An unsigned integer of `bits` bits.
    #[must_use]
    pub fn unsigned(name: impl Into<String>, bits: u8) -> Self {
        Self::new(name, TypeKind::Unsigned(bits))
    }

    /// A single precision float.
    #[must_use]
    pub fn float32(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Float { format_width: 32, exponent_width: 8 })
    }

    /// A double precision float.
    #[must_use]
    pub fn float64(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Float { format_width: 64, exponent_width: 11 })
    }

    /// A bit string of `size` bits, variable if negative.
    #[must_use]
    pub fn bit_string(name: impl Into<String>, size: i32) -> Self {
        Self::new(name, TypeKind::BitString(size))
    }

    /// An octet string of `size` octets, variable if negative.
    #[must_use]
    pub fn octet_string(name: impl Into<String>, size: i32) -> Self {
        Self::new(name, TypeKind::OctetString(size))
    }

    /// A visible string of at most `size` characters.
    #[must_use]
    pub fn visible_string(name: impl Into<String>, size: i32) -> Self {
        Self::new(name, TypeKind::VisibleString(size))
    }

    /// A unicode string of at most `size` characters.
    #[must_use]
    pub fn mms_string(name: impl Into<String>, size: i32) -> Self {
        Self::new(name, TypeKind::MmsString(size))
    }

    /// A UTC time.
    #[must_use]
    pub fn utc_time(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::UtcTime)
    }

    /// A binary time.
    #[must_use]
    pub fn binary_time(name: impl Into<String>, with_date: bool) -> Self {
        Self::new(name, TypeKind::BinaryTime { with_date })
    }

    /// Components of a structure. Empty for every other kind.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        match &self.kind {
            TypeKind::Structure(children) => children,
            _ => &[],
        }
    }

    /// The direct structure component named `name`.
    #[must_use]
    pub fn get_child(&self, name: &str) -> Option<&Self> {
        self.children().iter().find(|child| child.name == name)
    }

    /// Position of the direct structure component named `name`.
    #[must_use]
    pub fn child_index(&self, name: &str) -> Option<usize> {
        self.children().iter().position(|child| child.name == name)
    }

    /// Resolve a `$` separated path relative to this type.
    ///
    /// Structure components are matched by exact name. An array is passed through to
    /// its element type. A numeric segment right after an array is taken as the
    /// element index and skipped. An empty path resolves to `self`.
    #[must_use]
    pub fn get_named_sub(&self, path: &str) -> Option<&Self> {
        if path.is_empty() {
            return Some(self);
        }
        let mut spec = self;
        for segment in path.split(COMPONENT_SEPARATOR) {
            if let TypeKind::Array { element, .. } = &spec.kind {
                spec = element;
                if is_index(segment) {
                    continue;
                }
            }
            spec = spec.get_child(segment)?;
        }
        Some(spec)
    }

    /// The part of `value` (a value of this type) selected by a `$` separated path.
    ///
    /// Array elements are addressed by a numeric segment.
    #[must_use]
    pub fn get_child_value<'a>(&self, value: &'a MmsValue, path: &str) -> Option<&'a MmsValue> {
        let mut spec = self;
        let mut value = value;
        if path.is_empty() {
            return Some(value);
        }
        for segment in path.split(COMPONENT_SEPARATOR) {
            let (index, next) = spec.step(segment)?;
            value = value.get_element(index)?;
            spec = next;
        }
        Some(value)
    }

    /// Mutable variant of [`Self::get_child_value`].
    #[must_use]
    pub fn get_child_value_mut<'a>(
        &self,
        value: &'a mut MmsValue,
        path: &str,
    ) -> Option<&'a mut MmsValue> {
        let mut spec = self;
        let mut value = value;
        if path.is_empty() {
            return Some(value);
        }
        for segment in path.split(COMPONENT_SEPARATOR) {
            let (index, next) = spec.step(segment)?;
            value = value.get_element_mut(index)?;
            spec = next;
        }
        Some(value)
    }

    /// One path step: the element index inside the value and the type of that element.
    fn step(&self, segment: &str) -> Option<(usize, &Self)> {
        match &self.kind {
            TypeKind::Array { element_count, element } => {
                let index = segment.parse::<usize>().ok()?;
                (index < *element_count as usize).then_some((index, element.as_ref()))
            }
            TypeKind::Structure(children) => {
                let index = self.child_index(segment)?;
                Some((index, &children[index]))
            }
            _ => None,
        }
    }

    /// Names of every structure component below this type, depth first, prefixed with
    /// `prefix` and joined with `$`.
    pub fn collect_component_names(&self, prefix: &str, names: &mut Vec<String>) {
        for child in self.children() {
            let name = format!("{prefix}{COMPONENT_SEPARATOR}{}", child.name);
            names.push(name.clone());
            child.collect_component_names(&name, names);
        }
    }

    /// True if `value` has the shape of this type and fits its size limits.
    #[must_use]
    pub fn is_value_of_type(&self, value: &MmsValue) -> bool {
        match (&self.kind, value) {
            (TypeKind::Array { element_count, element }, MmsValue::Array(elements)) => {
                elements.len() == *element_count as usize
                    && elements.iter().all(|e| element.is_value_of_type(e))
            }
            (TypeKind::Structure(children), MmsValue::Structure(components)) => {
                children.len() == components.len()
                    && children.iter().zip(components).all(|(c, v)| c.is_value_of_type(v))
            }
            (TypeKind::Boolean, MmsValue::Boolean(_))
            | (TypeKind::UtcTime, MmsValue::UtcTime(_)) => true,
            (TypeKind::Integer(bits), MmsValue::Integer(int)) => fits_signed(int.value, *bits),
            (TypeKind::Unsigned(bits), MmsValue::Unsigned(uint)) => {
                fits_unsigned(uint.value, *bits)
            }
            (TypeKind::Float { format_width, .. }, MmsValue::Float(float)) => {
                float.format_width() == *format_width
            }
            (TypeKind::BitString(size), MmsValue::BitString(bits)) => fits_size(bits.size, *size),
            (TypeKind::OctetString(size), MmsValue::OctetString(octets)) => {
                fits_size(octets.buf.len(), *size)
            }
            (TypeKind::VisibleString(size), MmsValue::VisibleString(text))
            | (TypeKind::MmsString(size), MmsValue::MmsString(text)) => {
                *size == 0 || text.as_ref().is_none_or(|t| t.len() <= size.unsigned_abs() as usize)
            }
            (TypeKind::BinaryTime { with_date }, MmsValue::BinaryTime(time)) => {
                time.with_date == *with_date
            }
            _ => false,
        }
    }

    /// A copy of `value` carrying the size limits of this type.
    ///
    /// Decoded values only know their own size. The copy can be applied to a value
    /// built with [`MmsValue::default_for`] through [`MmsValue::update`]. Returns `None`
    /// if the value is not of this type.
    #[must_use]
    pub fn conform(&self, value: &MmsValue) -> Option<MmsValue> {
        if !self.is_value_of_type(value) {
            return None;
        }
        Some(self.conform_unchecked(value))
    }

    fn conform_unchecked(&self, value: &MmsValue) -> MmsValue {
        match (&self.kind, value) {
            (TypeKind::Array { element, .. }, MmsValue::Array(elements)) => {
                MmsValue::Array(elements.iter().map(|e| element.conform_unchecked(e)).collect())
            }
            (TypeKind::Structure(children), MmsValue::Structure(components)) => MmsValue::Structure(
                children.iter().zip(components).map(|(c, v)| c.conform_unchecked(v)).collect(),
            ),
            (TypeKind::Integer(bits), MmsValue::Integer(int)) => {
                MmsValue::new_integer(int.value, usize::from(*bits))
            }
            (TypeKind::Unsigned(bits), MmsValue::Unsigned(uint)) => {
                MmsValue::new_unsigned(uint.value, usize::from(*bits))
            }
            (TypeKind::OctetString(size), MmsValue::OctetString(octets)) => {
                MmsValue::OctetString(OctetString {
                    buf: octets.buf.clone(),
                    max_size: size.unsigned_abs() as usize,
                })
            }
            _ => value.clone(),
        }
    }

    /// Encoded size of the TypeSpecification, including tag and length.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    fn content_size(&self) -> usize {
        match &self.kind {
            TypeKind::Array { element_count, element } => {
                ber::element_size(ber::uint32_size(*element_count))
                    + ber::element_size(element.encoded_size())
            }
            TypeKind::Structure(children) => ber::element_size(components_size(children)),
            TypeKind::Boolean | TypeKind::UtcTime => 0,
            TypeKind::Integer(bits) | TypeKind::Unsigned(bits) => {
                ber::uint32_size(u32::from(*bits))
            }
            TypeKind::Float { format_width, exponent_width } => {
                ber::element_size(ber::uint32_size(u32::from(*format_width)))
                    + ber::element_size(ber::uint32_size(u32::from(*exponent_width)))
            }
            TypeKind::BitString(size)
            | TypeKind::OctetString(size)
            | TypeKind::VisibleString(size)
            | TypeKind::MmsString(size) => ber::int32_size(*size),
            TypeKind::BinaryTime { .. } => 1,
        }
    }

    /// Encode the TypeSpecification at `pos`. The name of `self` is not encoded.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        match &self.kind {
            TypeKind::Array { element_count, element } => {
                let mut pos = ber::encode_tl(tag::ARRAY, self.content_size(), buf, pos);
                pos = ber::encode_uint32_with_tl(0x81, *element_count, buf, pos);
                pos = ber::encode_tl(0xa2, element.encoded_size(), buf, pos);
                element.encode(buf, pos)
            }
            TypeKind::Structure(children) => {
                let mut pos = ber::encode_tl(tag::STRUCTURE, self.content_size(), buf, pos);
                pos = ber::encode_tl(0xa1, components_size(children), buf, pos);
                for child in children {
                    pos = ber::encode_tl(0x30, component_content_size(child), buf, pos);
                    pos = ber::encode_string_with_tag(0x80, &child.name, buf, pos);
                    pos = ber::encode_tl(0xa1, child.encoded_size(), buf, pos);
                    pos = child.encode(buf, pos);
                }
                pos
            }
            TypeKind::Boolean => ber::encode_tl(tag::BOOLEAN, 0, buf, pos),
            TypeKind::Integer(bits) => {
                ber::encode_uint32_with_tl(tag::INTEGER, u32::from(*bits), buf, pos)
            }
            TypeKind::Unsigned(bits) => {
                ber::encode_uint32_with_tl(tag::UNSIGNED, u32::from(*bits), buf, pos)
            }
            TypeKind::Float { format_width, exponent_width } => {
                let pos = ber::encode_tl(tag::FLOAT, self.content_size(), buf, pos);
                let pos = ber::encode_uint32_with_tl(0x02, u32::from(*format_width), buf, pos);
                ber::encode_uint32_with_tl(0x02, u32::from(*exponent_width), buf, pos)
            }
            TypeKind::BitString(size) => {
                ber::encode_int32_with_tl(tag::BIT_STRING, *size, buf, pos)
            }
            TypeKind::OctetString(size) => {
                ber::encode_int32_with_tl(tag::OCTET_STRING, *size, buf, pos)
            }
            TypeKind::VisibleString(size) => {
                ber::encode_int32_with_tl(tag::VISIBLE_STRING, *size, buf, pos)
            }
            TypeKind::MmsString(size) => {
                ber::encode_int32_with_tl(tag::MMS_STRING, *size, buf, pos)
            }
            TypeKind::UtcTime => ber::encode_tl(tag::UTC_TIME, 0, buf, pos),
            TypeKind::BinaryTime { with_date } => {
                ber::encode_boolean(tag::BINARY_TIME, *with_date, buf, pos)
            }
        }
    }

    /// Encode the TypeSpecification into a new buffer.
    #[must_use]
    pub fn to_ber(&self) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_size()];
        self.encode(&mut buf, 0);
        buf
    }

    /// Decode a TypeSpecification element and give it the name `name`.
    #[instrument(level = "debug", skip(tlv))]
    pub fn from_tlv(name: &str, tlv: &Tlv<'_>) -> Result<Self, TypeSpecError> {
        decode_type(name, tlv, 0)
    }
}

impl MmsValue {
    /// The initial value of a variable of type `spec`.
    ///
    /// Numbers are zero, booleans false, strings empty and times cleared. Variable size
    /// octet strings and bit strings start empty.
    #[must_use]
    pub fn default_for(spec: &MmsTypeSpec) -> Self {
        match &spec.kind {
            TypeKind::Array { element_count, element } => {
                Self::new_array(&Self::default_for(element), *element_count as usize)
            }
            TypeKind::Structure(children) => {
                Self::new_structure(children.iter().map(Self::default_for).collect())
            }
            TypeKind::Boolean => Self::new_boolean(false),
            TypeKind::Integer(bits) => {
                Self::Integer(MmsInteger { value: 0, max_size: width_octets(*bits) })
            }
            TypeKind::Unsigned(bits) => {
                Self::Unsigned(MmsUnsigned { value: 0, max_size: width_octets(*bits) })
            }
            TypeKind::Float { format_width, .. } => {
                if *format_width == 64 {
                    Self::Float(MmsFloat::Double(0.0))
                } else {
                    Self::Float(MmsFloat::Single(0.0))
                }
            }
            TypeKind::BitString(size) => {
                let bits = if *size < 0 {
                    0
                } else {
                    size.unsigned_abs() as usize
                };
                Self::BitString(BitString { size: bits, buf: vec![0; bits.div_ceil(8)] })
            }
            TypeKind::OctetString(size) => {
                let max_size = size.unsigned_abs() as usize;
                let len = if *size < 0 { 0 } else { max_size };
                Self::new_octet_string(len, max_size)
            }
            TypeKind::VisibleString(_) => Self::VisibleString(Some(String::new())),
            TypeKind::MmsString(_) => Self::MmsString(Some(String::new())),
            TypeKind::UtcTime => Self::UtcTime([0; 8]),
            TypeKind::BinaryTime { with_date } => {
                Self::BinaryTime(BinaryTime { buf: [0; 6], with_date: *with_date })
            }
        }
    }
}

/// True for an array index segment.
fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Maximum octets of an integer of `bits` bits.
const fn width_octets(bits: u8) -> usize {
    if bits <= 32 { 4 } else { 8 }
}

fn fits_signed(value: i64, bits: u8) -> bool {
    if bits == 0 || bits >= 64 {
        return true;
    }
    let limit = 1_i64 << (bits - 1);
    (-limit..limit).contains(&value)
}

fn fits_unsigned(value: u64, bits: u8) -> bool {
    bits == 0 || bits >= 64 || value >> bits == 0
}

/// Fixed sizes must match exactly, variable sizes are a maximum.
fn fits_size(actual: usize, size: i32) -> bool {
    if size < 0 {
        actual <= size.unsigned_abs() as usize
    } else {
        actual == size as usize
    }
}

/// Content size of one `SEQUENCE { componentName, componentType }`.
fn component_content_size(child: &MmsTypeSpec) -> usize {
    ber::determine_encoded_string_size(&child.name) + ber::element_size(child.encoded_size())
}

/// Content size of the components list.
fn components_size(children: &[MmsTypeSpec]) -> usize {
    children.iter().map(|child| ber::element_size(component_content_size(child))).sum()
}

fn decode_type(name: &str, tlv: &Tlv<'_>, depth: usize) -> Result<MmsTypeSpec, TypeSpecError> {
    let kind = match tlv.tag {
        tag::ARRAY => {
            ensure!(depth < MAX_DECODE_NESTING, NestingTooDeep { depth });
            let mut reader = tlv.children();
            // packed is optional and ignored
            reader.read_optional(0x80).context(Ber)?;
            let element_count = reader.expect(0x81).context(Ber)?.as_u32().context(Ber)?;
            let element_tlv = reader.expect(0xa2).context(Ber)?;
            let inner = element_tlv.children().read().context(Ber)?;
            TypeKind::Array {
                element_count,
                element: Box::new(decode_type("", &inner, depth + 1)?),
            }
        }
        tag::STRUCTURE => {
            ensure!(depth < MAX_DECODE_NESTING, NestingTooDeep { depth });
            let mut reader = tlv.children();
            reader.read_optional(0x80).context(Ber)?;
            let components = reader.expect(0xa1).context(Ber)?;
            let mut children = Vec::new();
            for component in components.children() {
                let component = component.context(Ber)?;
                ensure!(component.tag == 0x30, InvalidTypeSpec { tag: component.tag });
                let mut fields = component.children();
                let child_name = match fields.read_optional(0x80).context(Ber)? {
                    Some(field) => field.as_identifier().context(Ber)?,
                    None => String::new(),
                };
                let type_tlv = fields.expect(0xa1).context(Ber)?;
                let inner = type_tlv.children().read().context(Ber)?;
                children.push(decode_type(&child_name, &inner, depth + 1)?);
            }
            TypeKind::Structure(children)
        }
        tag::BOOLEAN => TypeKind::Boolean,
        tag::INTEGER => TypeKind::Integer(small_width(tlv)?),
        tag::UNSIGNED => TypeKind::Unsigned(small_width(tlv)?),
        tag::FLOAT => {
            let mut reader = tlv.children();
            let format_width = reader.expect(0x02).context(Ber)?.as_u32().context(Ber)?;
            let exponent_width = reader.expect(0x02).context(Ber)?.as_u32().context(Ber)?;
            let (Ok(format), Ok(exponent)) =
                (u8::try_from(format_width), u8::try_from(exponent_width))
            else {
                return InvalidTypeSpec { tag: tlv.tag }.fail();
            };
            ensure!(
                (format == 32 || format == 64) && exponent < format,
                InvalidTypeSpec { tag: tlv.tag }
            );
            TypeKind::Float { format_width: format, exponent_width: exponent }
        }
        tag::BIT_STRING => TypeKind::BitString(tlv.as_i32().context(Ber)?),
        tag::OCTET_STRING => TypeKind::OctetString(tlv.as_i32().context(Ber)?),
        tag::VISIBLE_STRING => TypeKind::VisibleString(tlv.as_i32().context(Ber)?),
        tag::MMS_STRING => TypeKind::MmsString(tlv.as_i32().context(Ber)?),
        tag::UTC_TIME => TypeKind::UtcTime,
        tag::BINARY_TIME => TypeKind::BinaryTime { with_date: tlv.as_bool().context(Ber)? },
        tag => return UnsupportedTypeTag { tag }.fail(),
    };
    Ok(MmsTypeSpec::new(name, kind))
}

/// Decode an Unsigned8 width.
fn small_width(tlv: &Tlv<'_>) -> Result<u8, TypeSpecError> {
    let width = tlv.as_u32().context(Ber)?;
    let Ok(width) = u8::try_from(width) else {
        return InvalidTypeSpec { tag: tlv.tag }.fail();
    };
    Ok(width)
}

/// Decode a TypeSpecification from the start of `buf`.
pub fn decode_type_spec(name: &str, buf: &[u8]) -> Result<MmsTypeSpec, TypeSpecError> {
    let tlv = BerReader::new(buf).read().context(Ber)?;
    MmsTypeSpec::from_tlv(name, &tlv)
}

#[allow(missing_docs)]
/// Errors decoding type specifications.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum TypeSpecError {
    #[snafu(display("Malformed type specification"))]
    Ber {
        source: BerError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unsupported type specification tag {tag:#04x}"))]
    UnsupportedTypeTag {
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid type specification element {tag:#04x}"))]
    InvalidTypeSpec {
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Type specification nested deeper than {depth} levels"))]
    NestingTooDeep {
        depth: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl TypeSpecError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Ber { context, .. }
            | Self::UnsupportedTypeTag { context, .. }
            | Self::InvalidTypeSpec { context, .. }
            | Self::NestingTooDeep { context, .. } => context,
        }
    }
}
