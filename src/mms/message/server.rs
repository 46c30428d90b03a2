//! Server side of the confirmed services: request decoders and response encoders.

use snafu::{ResultExt as _, ensure};
use tracing::{debug, instrument};

use super::{
    Ber, ConfirmedRequest, ConfirmedResponse, ConfirmedService, DeleteScope, InitiateParameters,
    InvalidPdu, MessageError, ObjectClass, ObjectName, ObjectScope, Reject, RejectReason,
    UnexpectedTag, UnrecognizedService, Value, VariableAccessItem, VariableAccessSpecification,
    encode_invoke_id, encode_items, encode_values, items_size, pdu, peek_invoke_id, service,
    split_pdu, uint_size, values_size,
};
use crate::mms::{
    ber::{self, BerReader, Tlv},
    value::{DataAccessError, MmsValue},
};

/// Bytes of a GetNameList response besides the names, used to fill a page.
pub const NAME_LIST_OVERHEAD: usize = 27;

/// Bytes one name adds to a GetNameList response.
#[must_use]
pub const fn name_list_entry_size(name: &str) -> usize {
    ber::determine_encoded_string_size(name)
}

/// A PDU received by a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Association request.
    InitiateRequest(InitiateParameters),
    /// A confirmed service request.
    ConfirmedRequest(ConfirmedRequest),
    /// A confirmed request that could not be decoded and must be rejected.
    InvalidRequest {
        /// Invoke id, if it could be read.
        invoke_id: Option<u32>,
        /// What to answer.
        reason: RejectReason,
    },
    /// Release of the association.
    ConcludeRequest,
    /// The client rejected one of our PDUs.
    Reject(Reject),
    /// A PDU type the server does not handle.
    Unknown {
        /// The top level tag.
        tag: u8,
    },
}

/// Decode a PDU received from a client.
///
/// Fails only when the PDU can not be split into tag and content, or when an initiate
/// request is malformed.
#[instrument(level = "debug", skip(buf), fields(len = buf.len()))]
pub fn decode_client_message(buf: &[u8]) -> Result<ClientMessage, MessageError> {
    let (tag, content) = split_pdu(buf)?;
    Ok(match tag {
        pdu::INITIATE_REQUEST => {
            ClientMessage::InitiateRequest(InitiateParameters::decode_content(content)?)
        }
        pdu::CONFIRMED_REQUEST => match ConfirmedRequest::decode_content(content) {
            Ok(request) => ClientMessage::ConfirmedRequest(request),
            Err(error) => {
                debug!("Invalid confirmed request: {error}");
                let reason = if matches!(error, MessageError::UnrecognizedService { .. }) {
                    RejectReason::UNRECOGNIZED_SERVICE
                } else {
                    RejectReason::INVALID_ARGUMENT
                };
                ClientMessage::InvalidRequest { invoke_id: peek_invoke_id(tag, content), reason }
            }
        },
        pdu::CONCLUDE_REQUEST => ClientMessage::ConcludeRequest,
        pdu::REJECT => ClientMessage::Reject(Reject::decode_content(content)?),
        tag => ClientMessage::Unknown { tag },
    })
}

impl ConfirmedRequest {
    /// Decode the content of a confirmed request PDU.
    pub fn decode_content(buf: &[u8]) -> Result<Self, MessageError> {
        let mut reader = BerReader::new(buf);
        let invoke_id = reader.expect(0x02).context(Ber)?.as_u32().context(Ber)?;
        let body = reader.read().context(Ber)?;
        let service = ConfirmedService::decode(&body)?;
        ensure!(reader.is_empty(), InvalidPdu { what: "trailing data in confirmed request" });
        Ok(Self { invoke_id, service })
    }
}

impl ConfirmedService {
    /// Decode the service request CHOICE.
    #[instrument(level = "debug", skip(tlv), fields(tag = tlv.tag))]
    pub fn decode(tlv: &Tlv<'_>) -> Result<Self, MessageError> {
        match tlv.tag {
            service::GET_NAME_LIST => decode_get_name_list(tlv),
            service::IDENTIFY => Ok(Self::Identify),
            service::READ => {
                let mut reader = tlv.children();
                let specification_with_result = match reader.read_optional(0x80).context(Ber)? {
                    Some(flag) => flag.as_bool().context(Ber)?,
                    None => false,
                };
                let spec = reader.expect(0xa1).context(Ber)?;
                let specification =
                    VariableAccessSpecification::decode(&spec.children().read().context(Ber)?)?;
                Ok(Self::Read { specification_with_result, specification })
            }
            service::WRITE => {
                let mut reader = tlv.children();
                let specification =
                    VariableAccessSpecification::decode(&reader.read().context(Ber)?)?;
                let data = reader.expect(0xa0).context(Ber)?;
                Ok(Self::Write {
                    specification,
                    data: MmsValue::decode_list(data.value).context(Value)?,
                })
            }
            service::GET_VARIABLE_ACCESS_ATTRIBUTES => {
                let choice = tlv.children().read().context(Ber)?;
                ensure!(
                    choice.tag == 0xa0,
                    UnexpectedTag { tag: choice.tag, element: "GetVariableAccessAttributes" }
                );
                let name = ObjectName::decode(&choice.children().read().context(Ber)?)?;
                Ok(Self::GetVariableAccessAttributes { name })
            }
            service::DEFINE_NAMED_VARIABLE_LIST => {
                let mut reader = tlv.children();
                let name = ObjectName::decode(&reader.read().context(Ber)?)?;
                let list = reader.expect(0xa0).context(Ber)?;
                let items = list
                    .children()
                    .map(|item| VariableAccessItem::decode(&item.context(Ber)?))
                    .collect::<Result<_, _>>()?;
                Ok(Self::DefineNamedVariableList { name, items })
            }
            service::GET_NAMED_VARIABLE_LIST_ATTRIBUTES => {
                let name = ObjectName::decode(&tlv.children().read().context(Ber)?)?;
                Ok(Self::GetNamedVariableListAttributes { name })
            }
            service::DELETE_NAMED_VARIABLE_LIST => {
                let mut reader = tlv.children();
                let scope = match reader.read_optional(0x80).context(Ber)? {
                    Some(scope) => {
                        let code = scope.as_u32().context(Ber)?;
                        let Some(scope) = DeleteScope::from_code(code) else {
                            return InvalidPdu { what: "unknown scope of delete" }.fail();
                        };
                        scope
                    }
                    None => DeleteScope::Specific,
                };
                let names = match reader.read_optional(0xa1).context(Ber)? {
                    Some(list) => list
                        .children()
                        .map(|name| ObjectName::decode(&name.context(Ber)?))
                        .collect::<Result<_, _>>()?,
                    None => Vec::new(),
                };
                let domain = match reader.read_optional(0x82).context(Ber)? {
                    Some(domain) => Some(domain.as_identifier().context(Ber)?),
                    None => None,
                };
                Ok(Self::DeleteNamedVariableList { scope, names, domain })
            }
            tag => UnrecognizedService { tag }.fail(),
        }
    }
}

fn decode_get_name_list(tlv: &Tlv<'_>) -> Result<ConfirmedService, MessageError> {
    let mut reader = tlv.children();
    let class = reader.expect(0xa0).context(Ber)?;
    let basic = class.children().expect(0x80).context(Ber)?;
    let code = basic.as_u32().context(Ber)?;
    let Some(object_class) = ObjectClass::from_code(code) else {
        return InvalidPdu { what: "unsupported object class" }.fail();
    };
    let scope = reader.expect(0xa1).context(Ber)?;
    let scope = scope.children().read().context(Ber)?;
    let scope = match scope.tag {
        0x80 => ObjectScope::Vmd,
        0x81 => ObjectScope::Domain(scope.as_identifier().context(Ber)?),
        0x82 => ObjectScope::Association,
        tag => return UnexpectedTag { tag, element: "objectScope" }.fail(),
    };
    let continue_after = match reader.read_optional(0x82).context(Ber)? {
        Some(name) => Some(name.as_identifier().context(Ber)?),
        None => None,
    };
    Ok(ConfirmedService::GetNameList { object_class, scope, continue_after })
}

impl ConfirmedResponse {
    /// Tag of the service response CHOICE.
    const fn tag(&self) -> u8 {
        match self {
            Self::GetNameList { .. } => service::GET_NAME_LIST,
            Self::Identify { .. } => service::IDENTIFY_RESPONSE,
            Self::Read { .. } => service::READ,
            Self::Write(_) => service::WRITE,
            Self::GetVariableAccessAttributes { .. } => service::GET_VARIABLE_ACCESS_ATTRIBUTES,
            Self::DefineNamedVariableList => service::DEFINE_NAMED_VARIABLE_LIST_RESPONSE,
            Self::GetNamedVariableListAttributes { .. } => {
                service::GET_NAMED_VARIABLE_LIST_ATTRIBUTES
            }
            Self::DeleteNamedVariableList { .. } => service::DELETE_NAMED_VARIABLE_LIST,
        }
    }

    /// Size of the content of the service response.
    fn content_size(&self) -> usize {
        match self {
            Self::GetNameList { names, more_follows } => {
                // moreFollows is DEFAULT TRUE
                let flag = if *more_follows {
                    0
                } else {
                    ber::element_size(1)
                };
                ber::element_size(names_size(names)) + flag
            }
            Self::Identify { vendor, model, revision } => [vendor, model, revision]
                .into_iter()
                .map(|value| ber::determine_encoded_string_size(value))
                .sum(),
            Self::Read { specification, results } => {
                let specification = specification
                    .as_ref()
                    .map_or(0, |specification| ber::element_size(specification.encoded_size()));
                specification + ber::element_size(values_size(results))
            }
            Self::Write(results) => results.iter().map(write_result_size).sum(),
            Self::GetVariableAccessAttributes { type_spec, .. } => {
                ber::element_size(1) + ber::element_size(type_spec.encoded_size())
            }
            Self::DefineNamedVariableList => 0,
            Self::GetNamedVariableListAttributes { items, .. } => {
                ber::element_size(1) + ber::element_size(items_size(items))
            }
            Self::DeleteNamedVariableList { matched, deleted } => {
                uint_size(*matched) + uint_size(*deleted)
            }
        }
    }

    /// Encode the service response CHOICE.
    fn encode_service(&self, buf: &mut [u8], pos: usize) -> usize {
        let mut pos = ber::encode_tl(self.tag(), self.content_size(), buf, pos);
        match self {
            Self::GetNameList { names, more_follows } => {
                pos = ber::encode_tl(0xa0, names_size(names), buf, pos);
                for name in names {
                    pos = ber::encode_string_with_tag(0x1a, name, buf, pos);
                }
                if !more_follows {
                    pos = ber::encode_boolean(0x81, false, buf, pos);
                }
                pos
            }
            Self::Identify { vendor, model, revision } => {
                pos = ber::encode_string_with_tag(0x80, vendor, buf, pos);
                pos = ber::encode_string_with_tag(0x81, model, buf, pos);
                ber::encode_string_with_tag(0x82, revision, buf, pos)
            }
            Self::Read { specification, results } => {
                if let Some(specification) = specification {
                    pos = ber::encode_tl(0xa0, specification.encoded_size(), buf, pos);
                    pos = specification.encode(buf, pos);
                }
                encode_values(0xa1, results, buf, pos)
            }
            Self::Write(results) => {
                for result in results {
                    pos = match result {
                        Ok(()) => ber::encode_tl(0x81, 0, buf, pos),
                        Err(error) => ber::encode_uint32_with_tl(0x80, error.code(), buf, pos),
                    };
                }
                pos
            }
            Self::GetVariableAccessAttributes { deletable, type_spec } => {
                pos = ber::encode_boolean(0x80, *deletable, buf, pos);
                pos = ber::encode_tl(0xa2, type_spec.encoded_size(), buf, pos);
                type_spec.encode(buf, pos)
            }
            Self::DefineNamedVariableList => pos,
            Self::GetNamedVariableListAttributes { deletable, items } => {
                pos = ber::encode_boolean(0x80, *deletable, buf, pos);
                encode_items(0xa1, items, buf, pos)
            }
            Self::DeleteNamedVariableList { matched, deleted } => {
                pos = ber::encode_uint32_with_tl(0x80, *matched, buf, pos);
                ber::encode_uint32_with_tl(0x81, *deleted, buf, pos)
            }
        }
    }

    fn pdu_content_size(&self, invoke_id: u32) -> usize {
        uint_size(invoke_id) + ber::element_size(self.content_size())
    }

    /// Encoded size of the confirmed response PDU answering `invoke_id`.
    #[must_use]
    pub fn encoded_size(&self, invoke_id: u32) -> usize {
        ber::element_size(self.pdu_content_size(invoke_id))
    }

    /// Encode the confirmed response PDU answering `invoke_id` at `pos`.
    pub fn encode(&self, invoke_id: u32, buf: &mut [u8], pos: usize) -> usize {
        let content_size = self.pdu_content_size(invoke_id);
        let pos = ber::encode_tl(pdu::CONFIRMED_RESPONSE, content_size, buf, pos);
        let pos = encode_invoke_id(invoke_id, buf, pos);
        self.encode_service(buf, pos)
    }

    /// Encode the confirmed response PDU answering `invoke_id` into a new buffer.
    #[must_use]
    pub fn to_ber(&self, invoke_id: u32) -> Vec<u8> {
        ber::encode_to_vec(self.encoded_size(invoke_id), |buf, pos| {
            self.encode(invoke_id, buf, pos)
        })
    }
}

/// Content size of a list of identifiers.
fn names_size(names: &[String]) -> usize {
    names.iter().map(|name| ber::determine_encoded_string_size(name)).sum()
}

/// Encoded size of one write result.
fn write_result_size(result: &Result<(), DataAccessError>) -> usize {
    match result {
        Ok(()) => ber::element_size(0),
        Err(error) => uint_size(error.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mms::{
        message::{
            AlternateAccess, ServiceError,
            client::{ServerMessage, decode_server_message},
        },
        type_spec::MmsTypeSpec,
    };

    /// Decode what a client sends.
    fn round_trip_request(service: ConfirmedService) -> ConfirmedRequest {
        let request = ConfirmedRequest { invoke_id: 77, service };
        let ClientMessage::ConfirmedRequest(decoded) =
            decode_client_message(&request.to_ber()).unwrap()
        else {
            panic!("not a confirmed request");
        };
        assert_eq!(decoded, request);
        decoded
    }

    /// Decode what a server sends.
    fn round_trip_response(response: ConfirmedResponse) {
        let buf = response.to_ber(5);
        assert_eq!(buf.len(), response.encoded_size(5));
        let message = decode_server_message(&buf).unwrap();
        assert_eq!(message, ServerMessage::Response { invoke_id: 5, response });
    }

    #[test]
    fn test_read_request_scenario() {
        let request = round_trip_request(ConfirmedService::Read {
            specification_with_result: false,
            specification: VariableAccessSpecification::ListOfVariable(vec![VariableAccessItem::new(
                ObjectName::domain("ied1Inverter", "LLN0$ST$stVal"),
            )]),
        });
        let ConfirmedService::Read { specification, .. } = request.service else {
            panic!("not a read");
        };
        let VariableAccessSpecification::ListOfVariable(items) = specification else {
            panic!("not a list of variable");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].name,
            ObjectName::DomainSpecific {
                domain_id: "ied1Inverter".to_owned(),
                item_id: "LLN0$ST$stVal".to_owned()
            }
        );
    }

    #[test]
    fn test_request_round_trips() {
        round_trip_request(ConfirmedService::GetNameList {
            object_class: ObjectClass::Domain,
            scope: ObjectScope::Vmd,
            continue_after: None,
        });
        round_trip_request(ConfirmedService::Identify);
        round_trip_request(ConfirmedService::Write {
            specification: VariableAccessSpecification::ListOfVariable(vec![
                VariableAccessItem::new(ObjectName::domain("LD", "GGIO1$CO$SPCSO1$Oper")),
                VariableAccessItem {
                    name: ObjectName::domain("LD", "GGIO1$SP$arr"),
                    alternate_access: Some(AlternateAccess::Index(4)),
                },
            ]),
            data: vec![MmsValue::new_boolean(true), MmsValue::new_i32(-3)],
        });
        round_trip_request(ConfirmedService::DefineNamedVariableList {
            name: ObjectName::AaSpecific("ds".to_owned()),
            items: vec![VariableAccessItem::new(ObjectName::domain("LD", "LLN0$ST"))],
        });
        round_trip_request(ConfirmedService::GetVariableAccessAttributes {
            name: ObjectName::domain("LD", "LLN0"),
        });
        round_trip_request(ConfirmedService::DeleteNamedVariableList {
            scope: DeleteScope::Specific,
            names: vec![ObjectName::domain("LD", "LLN0$ds")],
            domain: None,
        });
    }

    #[test]
    fn test_unrecognized_service_keeps_invoke_id() {
        // context specific tag 3 is not a confirmed service
        let buf = [0xa0, 0x05, 0x02, 0x01, 0x2a, 0x83, 0x00];
        assert_eq!(
            decode_client_message(&buf).unwrap(),
            ClientMessage::InvalidRequest {
                invoke_id: Some(42),
                reason: RejectReason::UNRECOGNIZED_SERVICE
            }
        );
    }

    #[test]
    fn test_invalid_request_argument() {
        // read request without a variable access specification
        let buf = [0xa0, 0x07, 0x02, 0x01, 0x01, 0xa4, 0x02, 0x80, 0x00];
        assert_eq!(
            decode_client_message(&buf).unwrap(),
            ClientMessage::InvalidRequest {
                invoke_id: Some(1),
                reason: RejectReason::INVALID_ARGUMENT
            }
        );
    }

    #[test]
    fn test_unknown_pdu() {
        assert_eq!(
            decode_client_message(&[0xa6, 0x00]).unwrap(),
            ClientMessage::Unknown { tag: 0xa6 }
        );
        assert!(decode_client_message(&[0xa0]).is_err());
    }

    #[test]
    fn test_name_list_response_encoding() {
        let last_page =
            ConfirmedResponse::GetNameList { names: vec!["a".to_owned()], more_follows: false };
        assert_eq!(
            last_page.to_ber(1),
            [
                0xa1, 0x0d, 0x02, 0x01, 0x01, 0xa1, 0x08, 0xa0, 0x03, 0x1a, 0x01, b'a', 0x81, 0x01,
                0x00
            ]
        );
        let first_page =
            ConfirmedResponse::GetNameList { names: vec!["a".to_owned()], more_follows: true };
        assert_eq!(first_page.encoded_size(1), 12);
        round_trip_response(last_page);
        round_trip_response(first_page);
    }

    #[test]
    fn test_response_round_trips() {
        round_trip_response(ConfirmedResponse::Identify {
            vendor: "vendor".to_owned(),
            model: "model".to_owned(),
            revision: "1.0".to_owned(),
        });
        round_trip_response(ConfirmedResponse::Read {
            specification: Some(VariableAccessSpecification::VariableListName(ObjectName::domain(
                "LD", "LLN0$ds",
            ))),
            results: vec![
                MmsValue::new_float(1.5),
                MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent),
            ],
        });
        round_trip_response(ConfirmedResponse::Write(vec![
            Ok(()),
            Err(DataAccessError::ObjectAccessDenied),
        ]));
        round_trip_response(ConfirmedResponse::GetVariableAccessAttributes {
            deletable: false,
            type_spec: MmsTypeSpec::structure(
                "",
                vec![MmsTypeSpec::integer("stVal", 32), MmsTypeSpec::bit_string("q", 13)],
            ),
        });
        round_trip_response(ConfirmedResponse::DefineNamedVariableList);
        round_trip_response(ConfirmedResponse::GetNamedVariableListAttributes {
            deletable: true,
            items: vec![VariableAccessItem::new(ObjectName::domain("LD", "LLN0$ST"))],
        });
        round_trip_response(ConfirmedResponse::DeleteNamedVariableList { matched: 1, deleted: 0 });
    }

    #[test]
    fn test_write_response_encoding() {
        let response =
            ConfirmedResponse::Write(vec![Ok(()), Err(DataAccessError::ObjectAccessDenied)]);
        assert_eq!(
            response.to_ber(9),
            [0xa1, 0x0a, 0x02, 0x01, 0x09, 0xa5, 0x05, 0x81, 0x00, 0x80, 0x01, 0x03]
        );
    }

    #[test]
    fn test_confirmed_error_from_server() {
        let buf =
            crate::mms::message::encode_confirmed_error(3, ServiceError::DEFINITION_OBJECT_EXISTS);
        assert_eq!(
            decode_server_message(&buf).unwrap(),
            ServerMessage::Error { invoke_id: 3, error: ServiceError::DEFINITION_OBJECT_EXISTS }
        );
    }
}
