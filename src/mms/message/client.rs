//! Client side of the confirmed services: request encoders and decoders for everything
//! a server sends.

use snafu::{ResultExt as _, ensure};
use tracing::instrument;

use super::{
    Ber, ConfirmedRequest, ConfirmedResponse, ConfirmedService, InformationReport,
    InitiateParameters, InvalidPdu, MessageError, ObjectName, ObjectScope, Reject, ServiceError,
    UnexpectedTag, UnrecognizedService, Value, VariableAccessItem, VariableAccessSpecification,
    decode_confirmed_error, decode_identifiers, decode_initiate_error, decode_type_description,
    encode_invoke_id, encode_items, encode_values, items_size, pdu, service, split_pdu, uint_size,
    values_size,
};
use crate::mms::{
    ber::{self, BerReader, Tlv},
    value::{DataAccessError, MmsValue},
};

impl ConfirmedService {
    /// Tag of the service request CHOICE.
    const fn tag(&self) -> u8 {
        match self {
            Self::GetNameList { .. } => service::GET_NAME_LIST,
            Self::Identify => service::IDENTIFY,
            Self::Read { .. } => service::READ,
            Self::Write { .. } => service::WRITE,
            Self::GetVariableAccessAttributes { .. } => service::GET_VARIABLE_ACCESS_ATTRIBUTES,
            Self::DefineNamedVariableList { .. } => service::DEFINE_NAMED_VARIABLE_LIST,
            Self::GetNamedVariableListAttributes { .. } => {
                service::GET_NAMED_VARIABLE_LIST_ATTRIBUTES
            }
            Self::DeleteNamedVariableList { .. } => service::DELETE_NAMED_VARIABLE_LIST,
        }
    }

    /// Size of the content of the service request.
    fn content_size(&self) -> usize {
        match self {
            Self::GetNameList { object_class, scope, continue_after } => {
                ber::element_size(uint_size(object_class.code()))
                    + ber::element_size(scope_size(scope))
                    + continue_after.as_deref().map_or(0, ber::determine_encoded_string_size)
            }
            Self::Identify => 0,
            Self::Read { specification_with_result, specification } => {
                // specificationWithResult is DEFAULT FALSE
                let flag = if *specification_with_result {
                    ber::element_size(1)
                } else {
                    0
                };
                flag + ber::element_size(specification.encoded_size())
            }
            Self::Write { specification, data } => {
                specification.encoded_size() + ber::element_size(values_size(data))
            }
            Self::GetVariableAccessAttributes { name } => ber::element_size(name.encoded_size()),
            Self::DefineNamedVariableList { name, items } => {
                name.encoded_size() + ber::element_size(items_size(items))
            }
            Self::GetNamedVariableListAttributes { name } => name.encoded_size(),
            Self::DeleteNamedVariableList { scope, names, domain } => {
                let names_size = if names.is_empty() {
                    0
                } else {
                    ber::element_size(object_names_size(names))
                };
                uint_size(scope.code())
                    + names_size
                    + domain.as_deref().map_or(0, ber::determine_encoded_string_size)
            }
        }
    }

    /// Encoded size of the service request CHOICE.
    fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Encode the service request CHOICE.
    fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let mut pos = ber::encode_tl(self.tag(), self.content_size(), buf, pos);
        match self {
            Self::GetNameList { object_class, scope, continue_after } => {
                pos = ber::encode_tl(0xa0, uint_size(object_class.code()), buf, pos);
                pos = ber::encode_uint32_with_tl(0x80, object_class.code(), buf, pos);
                pos = ber::encode_tl(0xa1, scope_size(scope), buf, pos);
                pos = match scope {
                    ObjectScope::Vmd => ber::encode_tl(0x80, 0, buf, pos),
                    ObjectScope::Domain(domain) => {
                        ber::encode_string_with_tag(0x81, domain, buf, pos)
                    }
                    ObjectScope::Association => ber::encode_tl(0x82, 0, buf, pos),
                };
                if let Some(name) = continue_after {
                    pos = ber::encode_string_with_tag(0x82, name, buf, pos);
                }
                pos
            }
            Self::Identify => pos,
            Self::Read { specification_with_result, specification } => {
                if *specification_with_result {
                    pos = ber::encode_boolean(0x80, true, buf, pos);
                }
                pos = ber::encode_tl(0xa1, specification.encoded_size(), buf, pos);
                specification.encode(buf, pos)
            }
            Self::Write { specification, data } => {
                pos = specification.encode(buf, pos);
                encode_values(0xa0, data, buf, pos)
            }
            Self::GetVariableAccessAttributes { name } => {
                pos = ber::encode_tl(0xa0, name.encoded_size(), buf, pos);
                name.encode(buf, pos)
            }
            Self::DefineNamedVariableList { name, items } => {
                pos = name.encode(buf, pos);
                encode_items(0xa0, items, buf, pos)
            }
            Self::GetNamedVariableListAttributes { name } => name.encode(buf, pos),
            Self::DeleteNamedVariableList { scope, names, domain } => {
                pos = ber::encode_uint32_with_tl(0x80, scope.code(), buf, pos);
                if !names.is_empty() {
                    pos = ber::encode_tl(0xa1, object_names_size(names), buf, pos);
                    for name in names {
                        pos = name.encode(buf, pos);
                    }
                }
                if let Some(domain) = domain {
                    pos = ber::encode_string_with_tag(0x82, domain, buf, pos);
                }
                pos
            }
        }
    }
}

/// Size of the objectScope content.
fn scope_size(scope: &ObjectScope) -> usize {
    match scope {
        ObjectScope::Vmd | ObjectScope::Association => ber::element_size(0),
        ObjectScope::Domain(domain) => ber::determine_encoded_string_size(domain),
    }
}

/// Content size of a list of object names.
fn object_names_size(names: &[ObjectName]) -> usize {
    names.iter().map(ObjectName::encoded_size).sum()
}

impl ConfirmedRequest {
    fn content_size(&self) -> usize {
        uint_size(self.invoke_id) + self.service.encoded_size()
    }

    /// Encoded size of the confirmed request PDU.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ber::element_size(self.content_size())
    }

    /// Encode the confirmed request PDU at `pos`.
    pub fn encode(&self, buf: &mut [u8], pos: usize) -> usize {
        let pos = ber::encode_tl(pdu::CONFIRMED_REQUEST, self.content_size(), buf, pos);
        let pos = encode_invoke_id(self.invoke_id, buf, pos);
        self.service.encode(buf, pos)
    }

    /// Encode the confirmed request PDU into a new buffer.
    #[must_use]
    pub fn to_ber(&self) -> Vec<u8> {
        ber::encode_to_vec(self.encoded_size(), |buf, pos| self.encode(buf, pos))
    }
}

impl ConfirmedResponse {
    /// Decode the service response CHOICE of a confirmed response.
    #[instrument(level = "debug", skip(tlv), fields(tag = tlv.tag))]
    pub fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        match tlv.tag {
            service::GET_NAME_LIST => {
                let mut reader = tlv.children();
                let names = decode_identifiers(&reader.expect(0xa0).context(Ber)?)?;
                // moreFollows is DEFAULT TRUE
                let more_follows = match reader.read_optional(0x81).context(Ber)? {
                    Some(flag) => flag.as_bool().context(Ber)?,
                    None => true,
                };
                Ok(Self::GetNameList { names, more_follows })
            }
            service::IDENTIFY_RESPONSE => {
                let mut reader = tlv.children();
                let vendor = reader.expect(0x80).context(Ber)?.as_identifier().context(Ber)?;
                let model = reader.expect(0x81).context(Ber)?.as_identifier().context(Ber)?;
                let revision = reader.expect(0x82).context(Ber)?.as_identifier().context(Ber)?;
                Ok(Self::Identify { vendor, model, revision })
            }
            service::READ => {
                let mut reader = tlv.children();
                let specification = match reader.read_optional(0xa0).context(Ber)? {
                    Some(spec) => Some(VariableAccessSpecification::decode(
                        &spec.children().read().context(Ber)?,
                    )?),
                    None => None,
                };
                let results = reader.expect(0xa1).context(Ber)?;
                Ok(Self::Read {
                    specification,
                    results: MmsValue::decode_list(results.value).context(Value)?,
                })
            }
            service::WRITE => {
                let results = tlv
                    .children()
                    .map(|result| {
                        let result = result.context(Ber)?;
                        match result.tag {
                            0x80 => {
                                let code = result.as_u32().context(Ber)?;
                                Ok(Err(DataAccessError::from_code(code)))
                            }
                            0x81 => Ok(Ok(())),
                            tag => UnexpectedTag { tag, element: "WriteResponse" }.fail(),
                        }
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Self::Write(results))
            }
            service::GET_VARIABLE_ACCESS_ATTRIBUTES => {
                let mut reader = tlv.children();
                let deletable = reader.expect(0x80).context(Ber)?.as_bool().context(Ber)?;
                // address is not used by IEC 61850 servers
                reader.read_optional(0xa1).context(Ber)?;
                let description = reader.expect(0xa2).context(Ber)?;
                let type_tlv = description.children().read().context(Ber)?;
                Ok(Self::GetVariableAccessAttributes {
                    deletable,
                    type_spec: decode_type_description("", &type_tlv)?,
                })
            }
            service::DEFINE_NAMED_VARIABLE_LIST_RESPONSE => Ok(Self::DefineNamedVariableList),
            service::GET_NAMED_VARIABLE_LIST_ATTRIBUTES => {
                let mut reader = tlv.children();
                let deletable = reader.expect(0x80).context(Ber)?.as_bool().context(Ber)?;
                let list = reader.expect(0xa1).context(Ber)?;
                let items = list
                    .children()
                    .map(|item| VariableAccessItem::decode(&item.context(Ber)?))
                    .collect::<Result<_, _>>()?;
                Ok(Self::GetNamedVariableListAttributes { deletable, items })
            }
            service::DELETE_NAMED_VARIABLE_LIST => {
                let mut reader = tlv.children();
                let matched = reader.expect(0x80).context(Ber)?.as_u32().context(Ber)?;
                let deleted = reader.expect(0x81).context(Ber)?.as_u32().context(Ber)?;
                Ok(Self::DeleteNamedVariableList { matched, deleted })
            }
            tag => UnrecognizedService { tag }.fail(),
        }
    }
}

/// A PDU received by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A confirmed response.
    Response {
        /// The invoke id of the request.
        invoke_id: u32,
        /// The response.
        response: ConfirmedResponse,
    },
    /// A confirmed error.
    Error {
        /// The invoke id of the request.
        invoke_id: u32,
        /// The error.
        error: ServiceError,
    },
    /// The server rejected a PDU.
    Reject(Reject),
    /// An unconfirmed report.
    InformationReport(InformationReport),
    /// The association was accepted.
    InitiateResponse(InitiateParameters),
    /// The association was refused.
    InitiateError(ServiceError),
    /// The association was concluded.
    ConcludeResponse,
}

/// Decode a PDU received from a server.
#[instrument(level = "debug", skip(buf), fields(len = buf.len()))]
pub fn decode_server_message(buf: &[u8]) -> Result<ServerMessage, MessageError> {
    let (tag, content) = split_pdu(buf)?;
    match tag {
        pdu::CONFIRMED_RESPONSE => {
            let mut reader = BerReader::new(content);
            let invoke_id = reader.expect(0x02).context(Ber)?.as_u32().context(Ber)?;
            let body = reader.read().context(Ber)?;
            ensure!(reader.is_empty(), InvalidPdu { what: "trailing data in confirmed response" });
            Ok(ServerMessage::Response { invoke_id, response: ConfirmedResponse::decode(&body)? })
        }
        pdu::CONFIRMED_ERROR => {
            let (invoke_id, error) = decode_confirmed_error(content)?;
            Ok(ServerMessage::Error { invoke_id, error })
        }
        pdu::REJECT => Ok(ServerMessage::Reject(Reject::decode_content(content)?)),
        pdu::UNCONFIRMED => {
            Ok(ServerMessage::InformationReport(InformationReport::decode_content(content)?))
        }
        pdu::INITIATE_RESPONSE => {
            Ok(ServerMessage::InitiateResponse(InitiateParameters::decode_content(content)?))
        }
        pdu::INITIATE_ERROR => Ok(ServerMessage::InitiateError(decode_initiate_error(content)?)),
        pdu::CONCLUDE_RESPONSE => Ok(ServerMessage::ConcludeResponse),
        tag => UnexpectedTag { tag, element: "MMS PDU" }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mms::message::{AlternateAccess, DeleteScope, ObjectClass};

    #[test]
    fn test_read_request_encoding() {
        let request = ConfirmedRequest {
            invoke_id: 1,
            service: ConfirmedService::Read {
                specification_with_result: false,
                specification: VariableAccessSpecification::ListOfVariable(vec![
                    VariableAccessItem::new(ObjectName::domain("ied1Inverter", "LLN0$ST$stVal")),
                ]),
            },
        };
        let mut expected = vec![
            0xa0, 0x2c, 0x02, 0x01, 0x01, // confirmed request, invoke id 1
            0xa4, 0x27, 0xa1, 0x25, 0xa0, 0x23, 0x30, 0x21, 0xa0, 0x1f, // read, list of variable
            0xa1, 0x1d, 0x1a, 0x0c,
        ];
        expected.extend_from_slice(b"ied1Inverter");
        expected.extend_from_slice(&[0x1a, 0x0d]);
        expected.extend_from_slice(b"LLN0$ST$stVal");
        assert_eq!(request.encoded_size(), expected.len());
        assert_eq!(request.to_ber(), expected);
    }

    #[test]
    fn test_get_name_list_request_encoding() {
        let request = ConfirmedRequest {
            invoke_id: 0x1234,
            service: ConfirmedService::GetNameList {
                object_class: ObjectClass::NamedVariable,
                scope: ObjectScope::Domain("LD".to_owned()),
                continue_after: Some("X".to_owned()),
            },
        };
        assert_eq!(
            request.to_ber(),
            [
                0xa0, 0x14, 0x02, 0x02, 0x12, 0x34, 0xa1, 0x0e, 0xa0, 0x03, 0x80, 0x01, 0x00, 0xa1,
                0x04, 0x81, 0x02, b'L', b'D', 0x82, 0x01, b'X'
            ]
        );
    }

    #[test]
    fn test_decode_name_list_more_follows_default() {
        let buf = [
            0xa1, 0x0c, 0x02, 0x01, 0x03, 0xa1, 0x07, 0xa0, 0x05, 0x1a, 0x03, b'L', b'D', b'1',
        ];
        let ServerMessage::Response { invoke_id, response } = decode_server_message(&buf).unwrap()
        else {
            panic!("not a response");
        };
        assert_eq!(invoke_id, 3);
        assert_eq!(
            response,
            ConfirmedResponse::GetNameList { names: vec!["LD1".to_owned()], more_follows: true }
        );
    }

    #[test]
    fn test_decode_write_response() {
        let buf = [0xa1, 0x0a, 0x02, 0x01, 0x09, 0xa5, 0x05, 0x81, 0x00, 0x80, 0x01, 0x03];
        let message = decode_server_message(&buf).unwrap();
        assert_eq!(
            message,
            ServerMessage::Response {
                invoke_id: 9,
                response: ConfirmedResponse::Write(vec![
                    Ok(()),
                    Err(DataAccessError::ObjectAccessDenied)
                ]),
            }
        );
    }

    #[test]
    fn test_delete_request_encoding() {
        let request = ConfirmedRequest {
            invoke_id: 2,
            service: ConfirmedService::DeleteNamedVariableList {
                scope: DeleteScope::Specific,
                names: vec![ObjectName::AaSpecific("ds".to_owned())],
                domain: None,
            },
        };
        assert_eq!(
            request.to_ber(),
            [
                0xa0, 0x0e, 0x02, 0x01, 0x02, 0xad, 0x09, 0x80, 0x01, 0x00, 0xa1, 0x04, 0x82, 0x02,
                b'd', b's'
            ]
        );
    }

    #[test]
    fn test_read_request_with_index_range() {
        let request = ConfirmedRequest {
            invoke_id: 4,
            service: ConfirmedService::Read {
                specification_with_result: true,
                specification: VariableAccessSpecification::ListOfVariable(vec![VariableAccessItem {
                    name: ObjectName::VmdSpecific("arr".to_owned()),
                    alternate_access: Some(AlternateAccess::IndexRange { low: 1, count: 2 }),
                }]),
            },
        };
        let buf = request.to_ber();
        assert_eq!(buf.len(), request.encoded_size());
        let tail = [0xa5, 0x08, 0xa3, 0x06, 0x80, 0x01, 0x01, 0x81, 0x01, 0x02];
        assert!(buf.ends_with(&tail));
        assert_eq!(&buf[5..10], &[0xa4, 0x1a, 0x80, 0x01, 0xff]);
    }

    #[test]
    fn test_unexpected_pdu() {
        assert!(decode_server_message(&[0xa0, 0x03, 0x02, 0x01, 0x01]).is_err());
        assert!(matches!(
            decode_server_message(&[0xa1, 0x05, 0x02, 0x01, 0x01, 0x9f, 0x00]),
            Err(MessageError::Ber { .. })
        ));
        assert!(matches!(
            decode_server_message(&[0xa1, 0x05, 0x02, 0x01, 0x01, 0x87, 0x00]),
            Err(MessageError::UnrecognizedService { tag: 0x87, .. })
        ));
    }
}
