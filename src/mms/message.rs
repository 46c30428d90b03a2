//! MMS PDUs as defined by ISO 9506-2.
//!
//! This module holds the types and codecs shared by both sides of an association:
//! object names, variable access specifications, initiate, conclude, reject,
//! confirmed error and information report PDUs. Confirmed service requests are encoded
//! in [`client`] and decoded in [`server`], confirmed responses the other way round.
//!
//! Every PDU is encoded in two passes: `encoded_size` computes the exact size, then
//! `encode` writes into a buffer of that size.

use snafu::{ResultExt as _, Snafu, ensure};
use tracing::instrument;

use crate::mms::{
    SpanTraceWrapper,
    ber::{self, BerError, BerReader, Tlv},
    device::NamedVariableListEntry,
    type_spec::{MmsTypeSpec, TypeSpecError},
    value::{DataAccessError, MmsValue, ValueError},
};

pub mod client;
pub mod server;

/// Tags of the top level MMS PDU CHOICE.
pub mod pdu {
    /// confirmed-RequestPDU
    pub const CONFIRMED_REQUEST: u8 = 0xa0;
    /// confirmed-ResponsePDU
    pub const CONFIRMED_RESPONSE: u8 = 0xa1;
    /// confirmed-ErrorPDU
    pub const CONFIRMED_ERROR: u8 = 0xa2;
    /// unconfirmed-PDU
    pub const UNCONFIRMED: u8 = 0xa3;
    /// rejectPDU
    pub const REJECT: u8 = 0xa4;
    /// initiate-RequestPDU
    pub const INITIATE_REQUEST: u8 = 0xa8;
    /// initiate-ResponsePDU
    pub const INITIATE_RESPONSE: u8 = 0xa9;
    /// initiate-ErrorPDU
    pub const INITIATE_ERROR: u8 = 0xaa;
    /// conclude-RequestPDU
    pub const CONCLUDE_REQUEST: u8 = 0x8b;
    /// conclude-ResponsePDU
    pub const CONCLUDE_RESPONSE: u8 = 0x8c;
}

/// Tags of the confirmed service request and response CHOICEs.
pub mod service {
    /// getNameList
    pub const GET_NAME_LIST: u8 = 0xa1;
    /// identify
    pub const IDENTIFY: u8 = 0x82;
    /// identify response
    pub const IDENTIFY_RESPONSE: u8 = 0xa2;
    /// read
    pub const READ: u8 = 0xa4;
    /// write
    pub const WRITE: u8 = 0xa5;
    /// getVariableAccessAttributes
    pub const GET_VARIABLE_ACCESS_ATTRIBUTES: u8 = 0xa6;
    /// defineNamedVariableList
    pub const DEFINE_NAMED_VARIABLE_LIST: u8 = 0xab;
    /// defineNamedVariableList response
    pub const DEFINE_NAMED_VARIABLE_LIST_RESPONSE: u8 = 0x8b;
    /// getNamedVariableListAttributes
    pub const GET_NAMED_VARIABLE_LIST_ATTRIBUTES: u8 = 0xac;
    /// deleteNamedVariableList
    pub const DELETE_NAMED_VARIABLE_LIST: u8 = 0xad;
}

/// Invoke id tag inside confirmed requests and responses.
const INVOKE_ID: u8 = 0x02;

/// Tag of an Identifier.
const IDENTIFIER: u8 = 0x1a;

/// Bits of the parameter CBB bit string.
pub const PARAMETER_CBB_BITS: usize = 11;

/// Bits of the services supported bit string.
pub const SERVICES_SUPPORTED_BITS: usize = 85;

/// Parameter CBB proposed by the client and answered by the server: str1, str2, vnam,
/// valt and vlis.
pub const PARAMETER_CBB: [u8; 2] = [0xf1, 0x00];

/// Name of an MMS object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectName {
    /// Name in the VMD scope.
    VmdSpecific(String),
    /// Name inside a domain.
    DomainSpecific {
        /// The domain.
        domain_id: String,
        /// The item.
        item_id: String,
    },
    /// Name in the scope of the association.
    AaSpecific(String),
}

impl ObjectName {
    /// A domain specific name.
    #[must_use]
    pub fn domain(domain_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::DomainSpecific { domain_id: domain_id.into(), item_id: item_id.into() }
    }

    /// The item part of the name.
    #[must_use]
    pub fn item_id(&self) -> &str {
        match self {
            Self::VmdSpecific(item) | Self::AaSpecific(item) => item,
            Self::DomainSpecific { item_id, .. } => item_id,
        }
    }

    /// Encoded size of the ObjectName CHOICE.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::VmdSpecific(item) | Self::AaSpecific(item) => {
                ber::determine_encoded_string_size(item)
            }
            Self::DomainSpecific { domain_id, item_id } => {
                ber::element_size(domain_specific_size(domain_id, item_id))
            }
        }
    }

    /// Encode the ObjectName CHOICE at `pos`.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        match self {
            Self::VmdSpecific(item) => ber::encode_string_with_tag(0x80, item, buf, pos),
            Self::DomainSpecific { domain_id, item_id } => {
                let pos = ber::encode_tl(0xa1, domain_specific_size(domain_id, item_id), buf, pos);
                let pos = ber::encode_string_with_tag(IDENTIFIER, domain_id, buf, pos);
                ber::encode_string_with_tag(IDENTIFIER, item_id, buf, pos)
            }
            Self::AaSpecific(item) => ber::encode_string_with_tag(0x82, item, buf, pos),
        }
    }

    /// Decode the ObjectName CHOICE.
    pub fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        match tlv.tag {
            0x80 => Ok(Self::VmdSpecific(tlv.as_identifier().context(Ber)?)),
            0xa1 => {
                let mut reader = tlv.children();
                let domain_id =
                    reader.expect(IDENTIFIER).context(Ber)?.as_identifier().context(Ber)?;
                let item_id =
                    reader.expect(IDENTIFIER).context(Ber)?.as_identifier().context(Ber)?;
                Ok(Self::DomainSpecific { domain_id, item_id })
            }
            0x82 => Ok(Self::AaSpecific(tlv.as_identifier().context(Ber)?)),
            tag => UnexpectedTag { tag, element: "ObjectName" }.fail(),
        }
    }
}

/// Content size of a domain specific name.
const fn domain_specific_size(domain_id: &str, item_id: &str) -> usize {
    ber::determine_encoded_string_size(domain_id) + ber::determine_encoded_string_size(item_id)
}

/// Encoded size of an unsigned element.
pub(crate) const fn uint_size(value: u32) -> usize {
    ber::element_size(ber::uint32_size(value))
}

/// Classes of objects listed by GetNameList.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Named variables.
    NamedVariable,
    /// Named variable lists (data sets).
    NamedVariableList,
    /// Journals (logs).
    Journal,
    /// Domains.
    Domain,
}

impl ObjectClass {
    /// The basicObjectClass code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::NamedVariable => 0,
            Self::NamedVariableList => 2,
            Self::Journal => 8,
            Self::Domain => 9,
        }
    }

    /// Map a basicObjectClass code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::NamedVariable),
            2 => Some(Self::NamedVariableList),
            8 => Some(Self::Journal),
            9 => Some(Self::Domain),
            _ => None,
        }
    }
}

/// Scope of a GetNameList request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectScope {
    /// The whole VMD.
    Vmd,
    /// One domain.
    Domain(String),
    /// The current association.
    Association,
}

/// Alternate access to part of an array variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AlternateAccess {
    /// One element.
    Index(u32),
    /// `count` elements starting at `low`.
    IndexRange {
        /// First element.
        low: u32,
        /// Number of elements.
        count: u32,
    },
    /// A component of one element.
    IndexComponent {
        /// The element.
        index: u32,
        /// The component name.
        component: String,
    },
}

impl AlternateAccess {
    /// Size of the selection inside the `[5] AlternateAccess` element.
    fn selection_size(&self) -> usize {
        match self {
            Self::Index(index) => uint_size(*index),
            Self::IndexRange { low, count } => {
                ber::element_size(uint_size(*low) + uint_size(*count))
            }
            Self::IndexComponent { index, component } => {
                let component_size = ber::determine_encoded_string_size(component);
                ber::element_size(uint_size(*index) + ber::element_size(component_size))
            }
        }
    }

    /// Encoded size of the `[5] AlternateAccess` element.
    fn encoded_size(&self) -> usize {
        ber::element_size(self.selection_size())
    }

    /// Encode the `[5] AlternateAccess` element.
    fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let pos = ber::encode_tl(0xa5, self.selection_size(), buf, pos);
        match self {
            Self::Index(index) => ber::encode_uint32_with_tl(0x82, *index, buf, pos),
            Self::IndexRange { low, count } => {
                let pos = ber::encode_tl(0xa3, uint_size(*low) + uint_size(*count), buf, pos);
                let pos = ber::encode_uint32_with_tl(0x80, *low, buf, pos);
                ber::encode_uint32_with_tl(0x81, *count, buf, pos)
            }
            Self::IndexComponent { index, component } => {
                let component_size = ber::determine_encoded_string_size(component);
                let length = uint_size(*index) + ber::element_size(component_size);
                let pos = ber::encode_tl(0xa0, length, buf, pos);
                let pos = ber::encode_uint32_with_tl(0x81, *index, buf, pos);
                let pos = ber::encode_tl(0x30, component_size, buf, pos);
                ber::encode_string_with_tag(0x81, component, buf, pos)
            }
        }
    }

    /// Decode the content of the `[5] AlternateAccess` element.
    fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        let selection = tlv.children().read().context(Ber)?;
        match selection.tag {
            0x82 => Ok(Self::Index(selection.as_u32().context(Ber)?)),
            0xa3 => {
                let mut reader = selection.children();
                let low = reader.expect(0x80).context(Ber)?.as_u32().context(Ber)?;
                let count = reader.expect(0x81).context(Ber)?.as_u32().context(Ber)?;
                Ok(Self::IndexRange { low, count })
            }
            0xa0 => {
                let mut reader = selection.children();
                let index = reader.expect(0x81).context(Ber)?.as_u32().context(Ber)?;
                let nested = reader.expect(0x30).context(Ber)?;
                let component =
                    nested.children().expect(0x81).context(Ber)?.as_identifier().context(Ber)?;
                Ok(Self::IndexComponent { index, component })
            }
            tag => UnexpectedTag { tag, element: "AlternateAccess" }.fail(),
        }
    }
}

/// One entry of a listOfVariable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableAccessItem {
    /// The variable.
    pub name: ObjectName,
    /// Optional part of the variable.
    pub alternate_access: Option<AlternateAccess>,
}

impl VariableAccessItem {
    /// An item naming a whole variable.
    #[must_use]
    pub const fn new(name: ObjectName) -> Self {
        Self { name, alternate_access: None }
    }

    fn content_size(&self) -> usize {
        ber::element_size(self.name.encoded_size())
            + self.alternate_access.as_ref().map_or(0, AlternateAccess::encoded_size)
    }

    /// Encoded size of the SEQUENCE.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Encode the item as a SEQUENCE.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let pos = ber::encode_tl(0x30, self.content_size(), buf, pos);
        let pos = ber::encode_tl(0xa0, self.name.encoded_size(), buf, pos);
        let pos = self.name.encode(buf, pos);
        match &self.alternate_access {
            Some(access) => access.encode(buf, pos),
            None => pos,
        }
    }

    /// Decode one SEQUENCE of a listOfVariable.
    pub fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        ensure!(tlv.tag == 0x30, UnexpectedTag { tag: tlv.tag, element: "listOfVariable" });
        let mut reader = tlv.children();
        let specification = reader.read().context(Ber)?;
        ensure!(
            specification.tag == 0xa0,
            UnexpectedTag { tag: specification.tag, element: "VariableSpecification" }
        );
        let name = ObjectName::decode(&specification.children().read().context(Ber)?)?;
        let alternate_access = match reader.read_optional(0xa5).context(Ber)? {
            Some(access) => Some(AlternateAccess::decode(&access)?),
            None => None,
        };
        Ok(Self { name, alternate_access })
    }
}

impl From<&NamedVariableListEntry> for VariableAccessItem {
    fn from(entry: &NamedVariableListEntry) -> Self {
        let name = if entry.domain_id.is_empty() {
            ObjectName::VmdSpecific(entry.item_id.clone())
        } else {
            ObjectName::domain(entry.domain_id.clone(), entry.item_id.clone())
        };
        let alternate_access = entry.array_index.map(|index| match &entry.component_name {
            Some(component) => {
                AlternateAccess::IndexComponent { index, component: component.clone() }
            }
            None => AlternateAccess::Index(index),
        });
        Self { name, alternate_access }
    }
}

impl TryFrom<&VariableAccessItem> for NamedVariableListEntry {
    type Error = MessageError;

    fn try_from(item: &VariableAccessItem) -> Result<Self, Self::Error> {
        let (domain_id, item_id) = match &item.name {
            ObjectName::VmdSpecific(item) => (String::new(), item.clone()),
            ObjectName::DomainSpecific { domain_id, item_id } => {
                (domain_id.clone(), item_id.clone())
            }
            ObjectName::AaSpecific(_) => {
                return InvalidPdu { what: "association specific variable in a list" }.fail();
            }
        };
        let (array_index, component_name) = match &item.alternate_access {
            None => (None, None),
            Some(AlternateAccess::Index(index)) => (Some(*index), None),
            Some(AlternateAccess::IndexComponent { index, component }) => {
                (Some(*index), Some(component.clone()))
            }
            Some(AlternateAccess::IndexRange { .. }) => {
                return InvalidPdu { what: "index range in a list entry" }.fail();
            }
        };
        Ok(Self { domain_id, item_id, array_index, component_name })
    }
}

/// Content size of a list of variable access items.
fn items_size(items: &[VariableAccessItem]) -> usize {
    items.iter().map(VariableAccessItem::encoded_size).sum()
}

/// Encode a list of variable access items under `tag`.
fn encode_items(tag: u8, items: &[VariableAccessItem], buf: &mut [u8], pos: usize) -> usize {
    let mut pos = ber::encode_tl(tag, items_size(items), buf, pos);
    for item in items {
        pos = item.encode(buf, pos);
    }
    pos
}

/// The variables a read, write or report refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableAccessSpecification {
    /// An explicit list of variables.
    ListOfVariable(Vec<VariableAccessItem>),
    /// A named variable list.
    VariableListName(ObjectName),
}

impl VariableAccessSpecification {
    /// Encoded size of the VariableAccessSpecification CHOICE.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::ListOfVariable(items) => ber::element_size(items_size(items)),
            Self::VariableListName(name) => ber::element_size(name.encoded_size()),
        }
    }

    /// Encode the VariableAccessSpecification CHOICE.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        match self {
            Self::ListOfVariable(items) => encode_items(0xa0, items, buf, pos),
            Self::VariableListName(name) => {
                let pos = ber::encode_tl(0xa1, name.encoded_size(), buf, pos);
                name.encode(buf, pos)
            }
        }
    }

    /// Decode the VariableAccessSpecification CHOICE.
    pub fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        match tlv.tag {
            0xa0 => Ok(Self::ListOfVariable(
                tlv.children()
                    .map(|item| VariableAccessItem::decode(&item.context(Ber)?))
                    .collect::<Result<_, _>>()?,
            )),
            0xa1 => Ok(Self::VariableListName(ObjectName::decode(
                &tlv.children().read().context(Ber)?,
            )?)),
            tag => UnexpectedTag { tag, element: "VariableAccessSpecification" }.fail(),
        }
    }
}

/// Classes of the ServiceError.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorClass {
    VmdState,
    ApplicationReference,
    Definition,
    Resource,
    Service,
    ServicePreempt,
    TimeResolution,
    Access,
    Initiate,
    Conclude,
    Cancel,
    File,
    Others,
}

impl ErrorClass {
    /// Context tag number of the class.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::VmdState => 0,
            Self::ApplicationReference => 1,
            Self::Definition => 2,
            Self::Resource => 3,
            Self::Service => 4,
            Self::ServicePreempt => 5,
            Self::TimeResolution => 6,
            Self::Access => 7,
            Self::Initiate => 8,
            Self::Conclude => 9,
            Self::Cancel => 10,
            Self::File => 11,
            Self::Others => 12,
        }
    }

    /// The class of a context tag number.
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        Some(match number {
            0 => Self::VmdState,
            1 => Self::ApplicationReference,
            2 => Self::Definition,
            3 => Self::Resource,
            4 => Self::Service,
            5 => Self::ServicePreempt,
            6 => Self::TimeResolution,
            7 => Self::Access,
            8 => Self::Initiate,
            9 => Self::Conclude,
            10 => Self::Cancel,
            11 => Self::File,
            12 => Self::Others,
            _ => return None,
        })
    }
}

/// An MMS ServiceError: an error class and the code inside the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceError {
    /// The class.
    pub class: ErrorClass,
    /// The code inside the class.
    pub code: u32,
}

impl ServiceError {
    /// access / object-access-unsupported
    pub const ACCESS_OBJECT_ACCESS_UNSUPPORTED: Self = Self::new(ErrorClass::Access, 1);
    /// access / object-non-existent
    pub const ACCESS_OBJECT_NON_EXISTENT: Self = Self::new(ErrorClass::Access, 2);
    /// access / object-access-denied
    pub const ACCESS_OBJECT_ACCESS_DENIED: Self = Self::new(ErrorClass::Access, 3);
    /// definition / object-exists
    pub const DEFINITION_OBJECT_EXISTS: Self = Self::new(ErrorClass::Definition, 5);
    /// definition / object-undefined
    pub const DEFINITION_OBJECT_UNDEFINED: Self = Self::new(ErrorClass::Definition, 1);
    /// resource / memory-unavailable
    pub const RESOURCE_MEMORY_UNAVAILABLE: Self = Self::new(ErrorClass::Resource, 1);
    /// resource / capability-unavailable
    pub const RESOURCE_CAPABILITY_UNAVAILABLE: Self = Self::new(ErrorClass::Resource, 4);
    /// service / other
    pub const SERVICE_OTHER: Self = Self::new(ErrorClass::Service, 0);
    /// initiate / other
    pub const INITIATE_OTHER: Self = Self::new(ErrorClass::Initiate, 0);

    /// An error of `class` with `code`.
    #[must_use]
    pub const fn new(class: ErrorClass, code: u32) -> Self {
        Self { class, code }
    }

    /// Size of the content of a ServiceError.
    const fn content_size(self) -> usize {
        ber::element_size(uint_size(self.code))
    }

    /// Encode the content of a ServiceError: `errorClass [0] CHOICE`.
    fn encode_content(self, buf: &mut [u8], pos: usize) -> usize {
        let pos = ber::encode_tl(0xa0, uint_size(self.code), buf, pos);
        ber::encode_uint32_with_tl(0x80 | self.class.number(), self.code, buf, pos)
    }

    /// Decode the content of a ServiceError.
    fn decode_content(buf: &[u8]) -> Result<Self, MessageError> {
        let mut reader = BerReader::new(buf);
        let class = reader.expect(0xa0).context(Ber)?;
        let code = class.children().read().context(Ber)?;
        let Some(error_class) = ErrorClass::from_number(code.tag & 0x1f) else {
            return UnexpectedTag { tag: code.tag, element: "errorClass" }.fail();
        };
        Ok(Self::new(error_class, code.as_u32().context(Ber)?))
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} error {}", self.class, self.code)
    }
}

/// Reason of a reject PDU: the kind of PDU that was rejected and the problem code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RejectReason {
    /// Context tag number of the rejectReason CHOICE.
    pub kind: u8,
    /// The problem code.
    pub code: u32,
}

impl RejectReason {
    /// confirmed-requestPDU / other
    pub const REQUEST_OTHER: Self = Self { kind: 1, code: 0 };
    /// confirmed-requestPDU / unrecognized-service
    pub const UNRECOGNIZED_SERVICE: Self = Self { kind: 1, code: 1 };
    /// confirmed-requestPDU / invalid-argument
    pub const INVALID_ARGUMENT: Self = Self { kind: 1, code: 4 };
    /// pdu-error / unknown-pdu-type
    pub const UNKNOWN_PDU_TYPE: Self = Self { kind: 5, code: 0 };
    /// pdu-error / invalid-pdu
    pub const INVALID_PDU: Self = Self { kind: 5, code: 1 };
}

/// A reject PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reject {
    /// Invoke id of the rejected request, if known.
    pub invoke_id: Option<u32>,
    /// Why the PDU was rejected.
    pub reason: RejectReason,
}

impl Reject {
    fn content_size(&self) -> usize {
        self.invoke_id.map_or(0, uint_size) + uint_size(self.reason.code)
    }

    /// Encoded size of the reject PDU.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Encode the reject PDU at `pos`.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let mut pos = ber::encode_tl(pdu::REJECT, self.content_size(), buf, pos);
        if let Some(invoke_id) = self.invoke_id {
            pos = ber::encode_uint32_with_tl(0x80, invoke_id, buf, pos);
        }
        ber::encode_uint32_with_tl(0x80 | self.reason.kind, self.reason.code, buf, pos)
    }

    /// Encode the reject PDU into a new buffer.
    #[must_use]
    pub fn to_ber(&self) -> Vec<u8> {
        ber::encode_to_vec(self.encoded_size(), |buf, pos| self.encode(buf, pos))
    }

    /// Decode the content of a reject PDU.
    pub fn decode_content(buf: &[u8]) -> Result<Self, MessageError> {
        let mut reader = BerReader::new(buf);
        let invoke_id = match reader.read_optional(0x80).context(Ber)? {
            Some(tlv) => Some(tlv.as_u32().context(Ber)?),
            None => None,
        };
        let reason = reader.read().context(Ber)?;
        Ok(Self {
            invoke_id,
            reason: RejectReason { kind: reason.tag & 0x1f, code: reason.as_u32().context(Ber)? },
        })
    }
}

/// Parameters exchanged by the initiate request and response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateParameters {
    /// Maximum PDU size, proposed or negotiated.
    pub local_detail: Option<u32>,
    /// Outstanding requests of the calling side.
    pub max_serv_outstanding_calling: u32,
    /// Outstanding requests of the called side.
    pub max_serv_outstanding_called: u32,
    /// Maximum nesting of structured data.
    pub data_structure_nesting_level: Option<u32>,
    /// Protocol version.
    pub version: u32,
    /// Parameter CBB bits.
    pub parameter_cbb: Vec<u8>,
    /// Services supported bits.
    pub services_supported: Vec<u8>,
}

impl InitiateParameters {
    /// Size of the `initRequestDetail` / `initResponseDetail` content.
    const fn detail_size(&self) -> usize {
        uint_size(self.version)
            + ber::bit_string_size(PARAMETER_CBB_BITS)
            + ber::bit_string_size(SERVICES_SUPPORTED_BITS)
    }

    fn content_size(&self) -> usize {
        self.local_detail.map_or(0, uint_size)
            + uint_size(self.max_serv_outstanding_calling)
            + uint_size(self.max_serv_outstanding_called)
            + self.data_structure_nesting_level.map_or(0, uint_size)
            + ber::element_size(self.detail_size())
    }

    /// Encoded size of the initiate request or response.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Encode an initiate request (`pdu::INITIATE_REQUEST`) or response
    /// (`pdu::INITIATE_RESPONSE`) at `pos`. Both carry the same fields.
    pub fn encode(&self, tag: u8, buf: &mut [u8], pos: usize) -> usize {
        let mut pos = ber::encode_tl(tag, self.content_size(), buf, pos);
        if let Some(local_detail) = self.local_detail {
            pos = ber::encode_uint32_with_tl(0x80, local_detail, buf, pos);
        }
        pos = ber::encode_uint32_with_tl(0x81, self.max_serv_outstanding_calling, buf, pos);
        pos = ber::encode_uint32_with_tl(0x82, self.max_serv_outstanding_called, buf, pos);
        if let Some(nesting) = self.data_structure_nesting_level {
            pos = ber::encode_uint32_with_tl(0x83, nesting, buf, pos);
        }
        pos = ber::encode_tl(0xa4, self.detail_size(), buf, pos);
        pos = ber::encode_uint32_with_tl(0x80, self.version, buf, pos);
        pos = ber::encode_bit_string(0x81, PARAMETER_CBB_BITS, &self.parameter_cbb, buf, pos);
        ber::encode_bit_string(0x82, SERVICES_SUPPORTED_BITS, &self.services_supported, buf, pos)
    }

    /// Encode an initiate request or response into a new buffer.
    #[must_use]
    pub fn to_ber(&self, tag: u8) -> Vec<u8> {
        ber::encode_to_vec(self.encoded_size(), |buf, pos| self.encode(tag, buf, pos))
    }

    /// Decode the content of an initiate request or response.
    #[instrument(level = "debug", skip(buf))]
    pub fn decode_content(buf: &[u8]) -> Result<Self, MessageError> {
        let mut params = Self {
            local_detail: None,
            max_serv_outstanding_calling: 1,
            max_serv_outstanding_called: 1,
            data_structure_nesting_level: None,
            version: 1,
            parameter_cbb: Vec::new(),
            services_supported: Vec::new(),
        };
        for tlv in BerReader::new(buf) {
            let tlv = tlv.context(Ber)?;
            match tlv.tag {
                0x80 => params.local_detail = Some(tlv.as_u32().context(Ber)?),
                0x81 => params.max_serv_outstanding_calling = tlv.as_u32().context(Ber)?,
                0x82 => params.max_serv_outstanding_called = tlv.as_u32().context(Ber)?,
                0x83 => params.data_structure_nesting_level = Some(tlv.as_u32().context(Ber)?),
                0xa4 => {
                    for detail in tlv.children() {
                        let detail = detail.context(Ber)?;
                        match detail.tag {
                            0x80 => params.version = detail.as_u32().context(Ber)?,
                            0x81 => params.parameter_cbb = bit_string_bytes(&detail),
                            0x82 => params.services_supported = bit_string_bytes(&detail),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

/// The content octets of a bit string without the padding octet.
fn bit_string_bytes(tlv: &Tlv<'_>) -> Vec<u8> {
    tlv.value.get(1..).map(<[u8]>::to_vec).unwrap_or_default()
}

/// Encoded size of an initiate error PDU.
#[must_use]
pub const fn initiate_error_size(error: ServiceError) -> usize {
    ber::element_size(error.content_size())
}

/// Encode an initiate error PDU.
#[must_use]
pub fn encode_initiate_error(error: ServiceError) -> Vec<u8> {
    ber::encode_to_vec(initiate_error_size(error), |buf, pos| {
        let pos = ber::encode_tl(pdu::INITIATE_ERROR, error.content_size(), buf, pos);
        error.encode_content(buf, pos)
    })
}

/// Decode the content of an initiate error PDU.
pub fn decode_initiate_error(buf: &[u8]) -> Result<ServiceError, MessageError> {
    ServiceError::decode_content(buf)
}

/// Encoded size of the empty conclude request and response PDUs.
pub const CONCLUDE_SIZE: usize = ber::element_size(0);

/// Encode a conclude request.
#[must_use]
pub fn encode_conclude_request() -> Vec<u8> {
    ber::encode_to_vec(CONCLUDE_SIZE, |buf, pos| {
        ber::encode_tl(pdu::CONCLUDE_REQUEST, 0, buf, pos)
    })
}

/// Encode a conclude response.
#[must_use]
pub fn encode_conclude_response() -> Vec<u8> {
    ber::encode_to_vec(CONCLUDE_SIZE, |buf, pos| {
        ber::encode_tl(pdu::CONCLUDE_RESPONSE, 0, buf, pos)
    })
}

const fn confirmed_error_content_size(invoke_id: u32, error: ServiceError) -> usize {
    uint_size(invoke_id) + ber::element_size(error.content_size())
}

/// Encoded size of a confirmed error PDU.
#[must_use]
pub const fn confirmed_error_size(invoke_id: u32, error: ServiceError) -> usize {
    ber::element_size(confirmed_error_content_size(invoke_id, error))
}

/// Encode a confirmed error PDU at `pos`.
pub fn encode_confirmed_error_into(
    invoke_id: u32,
    error: ServiceError,
    buf: &mut [u8],
    pos: usize,
) -> usize {
    let length = confirmed_error_content_size(invoke_id, error);
    let pos = ber::encode_tl(pdu::CONFIRMED_ERROR, length, buf, pos);
    let pos = ber::encode_uint32_with_tl(0x80, invoke_id, buf, pos);
    let pos = ber::encode_tl(0xa2, error.content_size(), buf, pos);
    error.encode_content(buf, pos)
}

/// Encode a confirmed error PDU into a new buffer.
#[must_use]
pub fn encode_confirmed_error(invoke_id: u32, error: ServiceError) -> Vec<u8> {
    ber::encode_to_vec(confirmed_error_size(invoke_id, error), |buf, pos| {
        encode_confirmed_error_into(invoke_id, error, buf, pos)
    })
}

/// Decode the content of a confirmed error PDU.
pub fn decode_confirmed_error(buf: &[u8]) -> Result<(u32, ServiceError), MessageError> {
    let mut reader = BerReader::new(buf);
    let invoke_id = reader.expect(0x80).context(Ber)?.as_u32().context(Ber)?;
    // modifierPosition is skipped
    reader.read_optional(0x81).context(Ber)?;
    let error = reader.expect(0xa2).context(Ber)?;
    Ok((invoke_id, ServiceError::decode_content(error.value)?))
}

/// An unconfirmed InformationReport.
#[derive(Debug, Clone, PartialEq)]
pub struct InformationReport {
    /// What the values are.
    pub specification: VariableAccessSpecification,
    /// The values, or access errors, in order.
    pub values: Vec<MmsValue>,
}

impl InformationReport {
    /// Size of the InformationReport content.
    fn report_size(&self) -> usize {
        self.specification.encoded_size() + ber::element_size(values_size(&self.values))
    }

    /// Encoded size of the unconfirmed PDU carrying the report.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(ber::element_size(self.report_size()))
    }

    /// Encode the unconfirmed PDU carrying the report at `pos`.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let report_size = self.report_size();
        let pos = ber::encode_tl(pdu::UNCONFIRMED, ber::element_size(report_size), buf, pos);
        let pos = ber::encode_tl(0xa0, report_size, buf, pos);
        let pos = self.specification.encode(buf, pos);
        encode_values(0xa0, &self.values, buf, pos)
    }

    /// Encode the unconfirmed PDU into a new buffer.
    #[must_use]
    pub fn to_ber(&self) -> Vec<u8> {
        ber::encode_to_vec(self.encoded_size(), |buf, pos| self.encode(buf, pos))
    }

    /// Decode the content of an unconfirmed PDU.
    #[instrument(level = "debug", skip(buf))]
    pub fn decode_content(buf: &[u8]) -> Result<Self, MessageError> {
        let report = BerReader::new(buf).read().context(Ber)?;
        ensure!(report.tag == 0xa0, UnrecognizedService { tag: report.tag });
        let mut reader = report.children();
        let specification = VariableAccessSpecification::decode(&reader.read().context(Ber)?)?;
        let results = reader.expect(0xa0).context(Ber)?;
        let values = MmsValue::decode_list(results.value).context(Value)?;
        Ok(Self { specification, values })
    }
}

/// Scope of a DeleteNamedVariableList request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteScope {
    /// The lists named in the request.
    Specific,
    /// Every association specific list.
    AaSpecific,
    /// Every list of a domain.
    Domain,
    /// Every list of the VMD.
    Vmd,
}

impl DeleteScope {
    /// The scopeOfDelete code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Specific => 0,
            Self::AaSpecific => 1,
            Self::Domain => 2,
            Self::Vmd => 3,
        }
    }

    /// Map a scopeOfDelete code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Specific,
            1 => Self::AaSpecific,
            2 => Self::Domain,
            3 => Self::Vmd,
            _ => return None,
        })
    }
}

/// A confirmed service request.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedService {
    /// List object names of a class in a scope.
    GetNameList {
        /// Class of the objects.
        object_class: ObjectClass,
        /// Where to look.
        scope: ObjectScope,
        /// Only names after this one are returned.
        continue_after: Option<String>,
    },
    /// Vendor, model and revision of the server.
    Identify,
    /// Read variables.
    Read {
        /// Echo the variable access specification in the response.
        specification_with_result: bool,
        /// What to read.
        specification: VariableAccessSpecification,
    },
    /// Write variables.
    Write {
        /// What to write.
        specification: VariableAccessSpecification,
        /// The values, one per variable.
        data: Vec<MmsValue>,
    },
    /// Type of a variable.
    GetVariableAccessAttributes {
        /// The variable.
        name: ObjectName,
    },
    /// Create a named variable list.
    DefineNamedVariableList {
        /// The list name.
        name: ObjectName,
        /// The members.
        items: Vec<VariableAccessItem>,
    },
    /// Members of a named variable list.
    GetNamedVariableListAttributes {
        /// The list name.
        name: ObjectName,
    },
    /// Delete named variable lists.
    DeleteNamedVariableList {
        /// Which lists.
        scope: DeleteScope,
        /// The list names for the specific scope.
        names: Vec<ObjectName>,
        /// The domain for the domain scope.
        domain: Option<String>,
    },
}

/// A confirmed request PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedRequest {
    /// Correlates the response.
    pub invoke_id: u32,
    /// The service.
    pub service: ConfirmedService,
}

/// The service specific part of a confirmed response.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedResponse {
    /// One page of names.
    GetNameList {
        /// The names.
        names: Vec<String>,
        /// True if more names follow the last one.
        more_follows: bool,
    },
    /// Server identity.
    Identify {
        /// Vendor name.
        vendor: String,
        /// Model name.
        model: String,
        /// Revision.
        revision: String,
    },
    /// Read results.
    Read {
        /// The echoed specification, if requested.
        specification: Option<VariableAccessSpecification>,
        /// One value or access error per variable.
        results: Vec<MmsValue>,
    },
    /// Write results, one per variable.
    Write(Vec<Result<(), DataAccessError>>),
    /// Type of a variable.
    GetVariableAccessAttributes {
        /// True if the variable can be deleted.
        deletable: bool,
        /// The type. The name is left empty.
        type_spec: MmsTypeSpec,
    },
    /// The list was created.
    DefineNamedVariableList,
    /// Members of a list.
    GetNamedVariableListAttributes {
        /// True if the list can be deleted.
        deletable: bool,
        /// The members in order.
        items: Vec<VariableAccessItem>,
    },
    /// Result of a delete.
    DeleteNamedVariableList {
        /// Lists matching the request.
        matched: u32,
        /// Lists deleted.
        deleted: u32,
    },
}

/// Content size of a list of Data or AccessResult.
fn values_size(values: &[MmsValue]) -> usize {
    values.iter().map(MmsValue::encoded_size).sum()
}

/// Encode a list of Data or AccessResult under `tag`. Data access errors become the
/// failure branch.
fn encode_values(tag: u8, values: &[MmsValue], buf: &mut [u8], pos: usize) -> usize {
    let mut pos = ber::encode_tl(tag, values_size(values), buf, pos);
    for value in values {
        pos = value.encode(buf, pos);
    }
    pos
}

/// Split a PDU into its top level tag and content.
pub fn split_pdu(buf: &[u8]) -> Result<(u8, &[u8]), MessageError> {
    let (tlv, end) = ber::read_tlv(buf, 0).context(Ber)?;
    ensure!(end == buf.len(), InvalidPdu { what: "trailing bytes after PDU" });
    Ok((tlv.tag, tlv.value))
}

/// The invoke id of a confirmed request, response or error, if it can be read.
///
/// `tag` is the top level tag and `content` the PDU content as returned by
/// [`split_pdu`].
#[must_use]
pub fn peek_invoke_id(tag: u8, content: &[u8]) -> Option<u32> {
    let expected = match tag {
        pdu::CONFIRMED_REQUEST | pdu::CONFIRMED_RESPONSE => INVOKE_ID,
        pdu::CONFIRMED_ERROR | pdu::REJECT => 0x80,
        _ => return None,
    };
    let first = BerReader::new(content).read().ok()?;
    (first.tag == expected).then(|| first.as_u32().ok()).flatten()
}

/// Encode the invoke id of a confirmed request or response.
fn encode_invoke_id(invoke_id: u32, buf: &mut [u8], pos: usize) -> usize {
    ber::encode_uint32_with_tl(INVOKE_ID, invoke_id, buf, pos)
}

/// Decode a list of identifiers.
fn decode_identifiers(tlv: &Tlv<'_>) -> Result<Vec<String>, MessageError> {
    tlv.children()
        .map(|name| {
            let name = name.context(Ber)?;
            ensure!(name.tag == IDENTIFIER, UnexpectedTag { tag: name.tag, element: "Identifier" });
            name.as_identifier().context(Ber)
        })
        .collect()
}

/// Decode a GetVariableAccessAttributes type description.
fn decode_type_description(name: &str, tlv: &Tlv<'_>) -> Result<MmsTypeSpec, MessageError> {
    MmsTypeSpec::from_tlv(name, tlv).context(TypeSpec)
}

#[allow(missing_docs)]
/// Errors encoding or decoding MMS PDUs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum MessageError {
    #[snafu(display("Malformed PDU"))]
    Ber {
        source: BerError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Malformed data in PDU"))]
    Value {
        source: ValueError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Malformed type specification in PDU"))]
    TypeSpec {
        source: TypeSpecError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unexpected tag {tag:#04x} in {element}"))]
    UnexpectedTag {
        tag: u8,
        element: &'static str,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unrecognized service {tag:#04x}"))]
    UnrecognizedService {
        tag: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid PDU: {what}"))]
    InvalidPdu {
        what: &'static str,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl MessageError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Ber { context, .. }
            | Self::Value { context, .. }
            | Self::TypeSpec { context, .. }
            | Self::UnexpectedTag { context, .. }
            | Self::UnrecognizedService { context, .. }
            | Self::InvalidPdu { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_encoding() {
        let names = [
            ObjectName::domain("LD", "X"),
            ObjectName::VmdSpecific("V".to_owned()),
            ObjectName::AaSpecific("A".to_owned()),
        ];
        let mut buf = vec![0; names.iter().map(ObjectName::encoded_size).sum()];
        let end = names.iter().fold(0, |pos, name| name.encode(&mut buf, pos));
        assert_eq!(end, buf.len());
        assert_eq!(
            buf,
            [
                0xa1, 0x07, 0x1a, 0x02, b'L', b'D', 0x1a, 0x01, b'X', 0x80, 0x01, b'V', 0x82, 0x01,
                b'A'
            ]
        );

        let names: Vec<_> =
            BerReader::new(&buf).map(|tlv| ObjectName::decode(&tlv.unwrap()).unwrap()).collect();
        assert_eq!(names[0], ObjectName::domain("LD", "X"));
        assert_eq!(names[2].item_id(), "A");
    }

    #[test]
    fn test_alternate_access_encoding() {
        let item = VariableAccessItem {
            name: ObjectName::domain("D", "arr"),
            alternate_access: Some(AlternateAccess::IndexComponent {
                index: 3,
                component: "mag".to_owned(),
            }),
        };
        let buf = ber::encode_to_vec(item.encoded_size(), |buf, pos| item.encode(buf, pos));
        let tail =
            [0xa5, 0x0c, 0xa0, 0x0a, 0x81, 0x01, 0x03, 0x30, 0x05, 0x81, 0x03, b'm', b'a', b'g'];
        assert!(buf.ends_with(&tail));

        let tlv = BerReader::new(&buf).read().unwrap();
        assert_eq!(VariableAccessItem::decode(&tlv).unwrap(), item);
    }

    #[test]
    fn test_list_entry_conversion() {
        let entry = NamedVariableListEntry::new("LD", "GGIO1$MX$harm").with_array_index(2);
        let item = VariableAccessItem::from(&entry);
        assert_eq!(item.alternate_access, Some(AlternateAccess::Index(2)));
        assert_eq!(NamedVariableListEntry::try_from(&item).unwrap(), entry);

        let range = VariableAccessItem {
            name: ObjectName::domain("LD", "X"),
            alternate_access: Some(AlternateAccess::IndexRange { low: 0, count: 2 }),
        };
        assert!(NamedVariableListEntry::try_from(&range).is_err());
    }

    #[test]
    fn test_confirmed_error() {
        let buf = encode_confirmed_error(7, ServiceError::ACCESS_OBJECT_NON_EXISTENT);
        assert_eq!(buf, [0xa2, 0x0a, 0x80, 0x01, 0x07, 0xa2, 0x05, 0xa0, 0x03, 0x87, 0x01, 0x02]);

        let (tag, content) = split_pdu(&buf).unwrap();
        assert_eq!(tag, pdu::CONFIRMED_ERROR);
        assert_eq!(peek_invoke_id(tag, content), Some(7));
        assert_eq!(
            decode_confirmed_error(content).unwrap(),
            (7, ServiceError::ACCESS_OBJECT_NON_EXISTENT)
        );
    }

    #[test]
    fn test_reject() {
        let reject = Reject { invoke_id: Some(5), reason: RejectReason::UNRECOGNIZED_SERVICE };
        let buf = reject.to_ber();
        assert_eq!(reject.encoded_size(), 8);
        assert_eq!(buf, [0xa4, 0x06, 0x80, 0x01, 0x05, 0x81, 0x01, 0x01]);
        let (_, content) = split_pdu(&buf).unwrap();
        assert_eq!(Reject::decode_content(content).unwrap(), reject);

        let unknown = Reject { invoke_id: None, reason: RejectReason::UNKNOWN_PDU_TYPE };
        assert_eq!(unknown.to_ber(), [0xa4, 0x03, 0x85, 0x01, 0x00]);
    }

    #[test]
    fn test_initiate_round_trip() {
        let params = InitiateParameters {
            local_detail: Some(65000),
            max_serv_outstanding_calling: 5,
            max_serv_outstanding_called: 5,
            data_structure_nesting_level: Some(10),
            version: 1,
            parameter_cbb: PARAMETER_CBB.to_vec(),
            services_supported: vec![0x6e, 0x1c, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        };
        let buf = params.to_ber(pdu::INITIATE_REQUEST);
        assert_eq!(buf.len(), params.encoded_size());
        assert_eq!(&buf[..7], &[0xa8, 0x26, 0x80, 0x03, 0x00, 0xfd, 0xe8]);
        let (tag, content) = split_pdu(&buf).unwrap();
        assert_eq!(tag, pdu::INITIATE_REQUEST);
        assert_eq!(InitiateParameters::decode_content(content).unwrap(), params);
    }

    #[test]
    fn test_information_report_round_trip() {
        let report = InformationReport {
            specification: VariableAccessSpecification::VariableListName(ObjectName::AaSpecific(
                "RPT".to_owned(),
            )),
            values: vec![
                MmsValue::new_visible_string("LD/LLN0$RP$brcb01"),
                MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent),
            ],
        };
        let buf = report.to_ber();
        assert_eq!(buf.len(), report.encoded_size());
        let (tag, content) = split_pdu(&buf).unwrap();
        assert_eq!(tag, pdu::UNCONFIRMED);
        assert_eq!(InformationReport::decode_content(content).unwrap(), report);
    }

    #[test]
    fn test_encode_into_shared_buffer() {
        // Two PDUs back to back in one buffer sized from their encoded sizes.
        let reject = Reject { invoke_id: None, reason: RejectReason::INVALID_PDU };
        let error = ServiceError::RESOURCE_MEMORY_UNAVAILABLE;
        let mut buf = vec![0; reject.encoded_size() + confirmed_error_size(300, error)];
        let pos = reject.encode(&mut buf, 0);
        let end = encode_confirmed_error_into(300, error, &mut buf, pos);
        assert_eq!(end, buf.len());
        assert_eq!(&buf[..pos], reject.to_ber());
        assert_eq!(&buf[pos..], encode_confirmed_error(300, error));
        assert_eq!(initiate_error_size(ServiceError::INITIATE_OTHER), 7);
        assert_eq!(
            encode_initiate_error(ServiceError::INITIATE_OTHER),
            [0xaa, 0x05, 0xa0, 0x03, 0x88, 0x01, 0x00]
        );
    }

    #[test]
    fn test_split_pdu_rejects_trailing_bytes() {
        assert!(split_pdu(&[0x8b, 0x00, 0x00]).is_err());
        assert!(split_pdu(&[0xa0, 0x05, 0x02]).is_err());
        assert_eq!(
            split_pdu(&encode_conclude_request()).unwrap(),
            (pdu::CONCLUDE_REQUEST, &[][..])
        );
    }
}
