//! One server side association: PDU dispatch and the per association state.

use std::{fmt, sync::Arc};

use tracing::{debug, info, instrument, warn};

use super::MmsServer;
use crate::mms::{
    device::NamedVariableLists,
    message::{
        ConfirmedRequest, ConfirmedResponse, ConfirmedService, InitiateParameters, PARAMETER_CBB,
        Reject, RejectReason, ServiceError, encode_conclude_response, encode_confirmed_error, pdu,
        server::{ClientMessage, decode_client_message},
    },
};

/// The only MMS version spoken.
const VERSION_NUMBER: u32 = 1;
/// Services offered: GetNameList, Identify, Read, Write, GetVariableAccessAttributes,
/// DefineNamedVariableList, GetNamedVariableListAttributes and DeleteNamedVariableList.
const SERVICES_SUPPORTED_CALLED: [u8; 11] = [0x6e, 0x1c, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Parameters agreed with the client during the initiate exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Largest PDU either side may send.
    pub max_pdu_size: u32,
    /// Outstanding requests of the client.
    pub max_serv_outstanding_calling: u32,
    /// Outstanding requests of the server.
    pub max_serv_outstanding_called: u32,
    /// Nesting of structured data.
    pub data_structure_nesting_level: u32,
}

/// Why a confirmed service produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ServiceFailure {
    /// Answer with a confirmed error.
    Error(ServiceError),
    /// Answer with a reject.
    Reject(RejectReason),
}

impl From<ServiceError> for ServiceFailure {
    fn from(error: ServiceError) -> Self {
        Self::Error(error)
    }
}

/// Result of a confirmed service. `Ok(None)` sends nothing back.
pub(super) type ServiceResult = Result<Option<ConfirmedResponse>, ServiceFailure>;

/// Server side state of one association.
pub struct MmsServerConnection {
    /// Identifies the connection towards the handlers.
    id: u64,
    /// The served model.
    pub(super) server: Arc<MmsServer>,
    /// Set by the initiate exchange.
    parameters: Option<ConnectionParameters>,
    /// Lists defined with association scope. They die with the connection.
    pub(super) association_lists: NamedVariableLists,
    /// Invoke id of the last confirmed request.
    last_invoke_id: Option<u32>,
    /// Set once a conclude was answered.
    concluded: bool,
}

impl fmt::Debug for MmsServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmsServerConnection")
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .field("association_lists", &self.association_lists.len())
            .field("last_invoke_id", &self.last_invoke_id)
            .field("concluded", &self.concluded)
            .finish_non_exhaustive()
    }
}

impl MmsServerConnection {
    pub(super) fn new(id: u64, server: Arc<MmsServer>) -> Self {
        Self {
            id,
            server,
            parameters: None,
            association_lists: NamedVariableLists::default(),
            last_invoke_id: None,
            concluded: false,
        }
    }

    /// The connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The negotiated parameters, once associated.
    #[must_use]
    pub const fn parameters(&self) -> Option<&ConnectionParameters> {
        self.parameters.as_ref()
    }

    /// Invoke id of the last confirmed request.
    #[must_use]
    pub const fn last_invoke_id(&self) -> Option<u32> {
        self.last_invoke_id
    }

    /// True once the client concluded the association.
    #[must_use]
    pub const fn is_concluded(&self) -> bool {
        self.concluded
    }

    /// Negotiated maximum PDU size, or the configured one before the initiate.
    pub(super) fn max_pdu_size(&self) -> usize {
        let size = self.parameters.map_or(self.server.config.max_pdu_size, |p| p.max_pdu_size);
        usize::try_from(size).unwrap_or(usize::MAX)
    }

    /// Handle one PDU from the client and build the PDU to send back, if any.
    ///
    /// Malformed requests are answered with a reject and never end the association.
    #[instrument(skip(self, buf), fields(connection = self.id, len = buf.len()))]
    pub async fn handle_message(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        let message = match decode_client_message(buf) {
            Ok(message) => message,
            Err(error) => {
                warn!("Rejecting malformed PDU: {error}");
                return Some(Reject { invoke_id: None, reason: RejectReason::INVALID_PDU }.to_ber());
            }
        };
        match message {
            ClientMessage::InitiateRequest(request) => Some(self.initiate(&request)),
            ClientMessage::ConfirmedRequest(request) => self.confirmed_request(request).await,
            ClientMessage::InvalidRequest { invoke_id, reason } => {
                warn!("Rejecting request {invoke_id:?}: {reason:?}");
                Some(Reject { invoke_id, reason }.to_ber())
            }
            ClientMessage::ConcludeRequest => {
                info!("Conclude requested");
                self.concluded = true;
                Some(encode_conclude_response())
            }
            ClientMessage::Reject(reject) => {
                warn!("Client rejected invoke id {:?}: {:?}", reject.invoke_id, reject.reason);
                None
            }
            ClientMessage::Unknown { tag } => {
                warn!("Rejecting unknown PDU type {tag:#04x}");
                Some(Reject { invoke_id: None, reason: RejectReason::UNKNOWN_PDU_TYPE }.to_ber())
            }
        }
    }

    /// Answer an initiate request with the proposed parameters clamped to the
    /// configuration.
    fn initiate(&mut self, request: &InitiateParameters) -> Vec<u8> {
        let config = &self.server.config;
        let parameters = ConnectionParameters {
            max_pdu_size: request
                .local_detail
                .map_or(config.max_pdu_size, |size| size.min(config.max_pdu_size)),
            max_serv_outstanding_calling: request
                .max_serv_outstanding_calling
                .clamp(1, u32::from(config.max_serv_outstanding_calling)),
            max_serv_outstanding_called: request
                .max_serv_outstanding_called
                .clamp(1, u32::from(config.max_serv_outstanding_called)),
            data_structure_nesting_level: request.data_structure_nesting_level.map_or(
                u32::from(config.data_structure_nesting_level),
                |level| level.min(u32::from(config.data_structure_nesting_level)),
            ),
        };
        info!("Associated: {parameters:?}");
        self.parameters = Some(parameters);

        InitiateParameters {
            local_detail: Some(parameters.max_pdu_size),
            max_serv_outstanding_calling: parameters.max_serv_outstanding_calling,
            max_serv_outstanding_called: parameters.max_serv_outstanding_called,
            data_structure_nesting_level: Some(parameters.data_structure_nesting_level),
            version: VERSION_NUMBER,
            parameter_cbb: PARAMETER_CBB.to_vec(),
            services_supported: SERVICES_SUPPORTED_CALLED.to_vec(),
        }
        .to_ber(pdu::INITIATE_RESPONSE)
    }

    /// Run one confirmed service and encode its answer.
    async fn confirmed_request(&mut self, request: ConfirmedRequest) -> Option<Vec<u8>> {
        let invoke_id = request.invoke_id;
        if self.parameters.is_none() {
            warn!("Confirmed request {invoke_id} before initiate");
            let reject = Reject { invoke_id: Some(invoke_id), reason: RejectReason::INVALID_PDU };
            return Some(reject.to_ber());
        }
        self.last_invoke_id = Some(invoke_id);

        let result = match request.service {
            ConfirmedService::GetNameList { object_class, scope, continue_after } => {
                self.get_name_list(object_class, &scope, continue_after.as_deref()).await
            }
            ConfirmedService::Identify => Ok(Some(self.identify())),
            ConfirmedService::Read { specification_with_result, specification } => {
                self.read(specification_with_result, specification).await
            }
            ConfirmedService::Write { specification, data } => {
                self.write(&specification, &data).await
            }
            ConfirmedService::GetVariableAccessAttributes { name } => {
                self.get_variable_access_attributes(&name)
            }
            ConfirmedService::DefineNamedVariableList { name, items } => {
                self.define_named_variable_list(&name, &items).await
            }
            ConfirmedService::GetNamedVariableListAttributes { name } => {
                self.get_named_variable_list_attributes(&name).await
            }
            ConfirmedService::DeleteNamedVariableList { scope, names, .. } => {
                self.delete_named_variable_list(scope, &names).await
            }
        };

        match result {
            Ok(Some(response)) => {
                let size = response.encoded_size(invoke_id);
                if size > self.max_pdu_size() {
                    debug!("Response of {size} bytes exceeds the PDU size");
                    return Some(encode_confirmed_error(
                        invoke_id,
                        ServiceError::RESOURCE_MEMORY_UNAVAILABLE,
                    ));
                }
                Some(response.to_ber(invoke_id))
            }
            Ok(None) => {
                debug!("No response for invoke id {invoke_id}");
                None
            }
            Err(ServiceFailure::Error(error)) => {
                debug!("Service failed: {error}");
                Some(encode_confirmed_error(invoke_id, error))
            }
            Err(ServiceFailure::Reject(reason)) => {
                warn!("Rejecting invoke id {invoke_id}: {reason:?}");
                Some(Reject { invoke_id: Some(invoke_id), reason }.to_ber())
            }
        }
    }

    /// Identification of the server.
    fn identify(&self) -> ConfirmedResponse {
        let config = &self.server.config;
        ConfirmedResponse::Identify {
            vendor: config.vendor_name.clone(),
            model: config.model_name.clone(),
            revision: config.revision.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mms::{
        ServerConfig,
        message::{
            ObjectName, VariableAccessItem, VariableAccessSpecification, client::ServerMessage,
            client::decode_server_message, encode_conclude_request,
        },
        server::tests::test_device,
    };

    pub(crate) fn initiate_request(max_pdu_size: u32) -> Vec<u8> {
        InitiateParameters {
            local_detail: Some(max_pdu_size),
            max_serv_outstanding_calling: 20,
            max_serv_outstanding_called: 20,
            data_structure_nesting_level: Some(20),
            version: 1,
            parameter_cbb: PARAMETER_CBB.to_vec(),
            services_supported: vec![0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        }
        .to_ber(pdu::INITIATE_REQUEST)
    }

    /// A connection of a fresh server, associated with `max_pdu_size`.
    pub(crate) async fn associated(
        config: ServerConfig,
        max_pdu_size: u32,
    ) -> MmsServerConnection {
        let server = Arc::new(MmsServer::new(config, test_device()));
        let mut connection = server.new_connection();
        connection.handle_message(&initiate_request(max_pdu_size)).await.unwrap();
        connection
    }

    /// Send a confirmed request and decode the answer.
    pub(crate) async fn call(
        connection: &mut MmsServerConnection,
        invoke_id: u32,
        service: ConfirmedService,
    ) -> ServerMessage {
        let request = ConfirmedRequest { invoke_id, service }.to_ber();
        let response = connection.handle_message(&request).await.unwrap();
        decode_server_message(&response).unwrap()
    }

    #[tokio::test]
    async fn test_initiate_clamps_to_config() {
        let server = Arc::new(MmsServer::new(ServerConfig::default(), test_device()));
        let mut connection = server.new_connection();
        let response = connection.handle_message(&initiate_request(100_000)).await.unwrap();
        let ServerMessage::InitiateResponse(response) = decode_server_message(&response).unwrap()
        else {
            panic!("not an initiate response");
        };
        assert_eq!(response.local_detail, Some(65000));
        assert_eq!(response.max_serv_outstanding_calling, 5);
        assert_eq!(response.max_serv_outstanding_called, 5);
        assert_eq!(response.data_structure_nesting_level, Some(10));
        assert_eq!(response.services_supported[..2], [0x6e, 0x1c]);
        assert_eq!(response.parameter_cbb, PARAMETER_CBB);
        assert_eq!(connection.parameters().map(|p| p.max_pdu_size), Some(65000));
    }

    async fn rejected(connection: &mut MmsServerConnection, request: &[u8]) -> Reject {
        let response = connection.handle_message(request).await.unwrap();
        let ServerMessage::Reject(reject) = decode_server_message(&response).unwrap() else {
            panic!("not a reject");
        };
        reject
    }

    #[tokio::test]
    async fn test_reject_paths() {
        let server = Arc::new(MmsServer::new(ServerConfig::default(), test_device()));
        let mut connection = server.new_connection();

        // Before the initiate.
        let early = ConfirmedRequest { invoke_id: 3, service: ConfirmedService::Identify }.to_ber();
        let reject = rejected(&mut connection, &early).await;
        assert_eq!(reject.invoke_id, Some(3));
        assert_eq!(reject.reason, RejectReason::INVALID_PDU);

        connection.handle_message(&initiate_request(1000)).await.unwrap();

        // Unknown confirmed service, the invoke id is kept.
        let reject = rejected(&mut connection, &[0xa0, 0x05, 0x02, 0x01, 0x2a, 0x83, 0x00]).await;
        assert_eq!(reject.invoke_id, Some(42));
        assert_eq!(reject.reason, RejectReason::UNRECOGNIZED_SERVICE);

        // Read with a broken variable access specification.
        let broken_read = [0xa0, 0x07, 0x02, 0x01, 0x01, 0xa4, 0x02, 0x80, 0x00];
        let reject = rejected(&mut connection, &broken_read).await;
        assert_eq!(reject.reason, RejectReason::INVALID_ARGUMENT);

        // Unknown PDU type.
        let reject = rejected(&mut connection, &[0xa6, 0x00]).await;
        assert_eq!(reject.invoke_id, None);
        assert_eq!(reject.reason, RejectReason::UNKNOWN_PDU_TYPE);

        // Garbage.
        let reject = rejected(&mut connection, &[0xa0, 0x7f]).await;
        assert_eq!(reject.reason, RejectReason::INVALID_PDU);

        // A reject from the client is not answered.
        let reject = Reject { invoke_id: Some(1), reason: RejectReason::REQUEST_OTHER }.to_ber();
        assert_eq!(connection.handle_message(&reject).await, None);

        // The association survived every reject.
        assert!(matches!(
            call(&mut connection, 7, ConfirmedService::Identify).await,
            ServerMessage::Response { invoke_id: 7, .. }
        ));
        assert_eq!(connection.last_invoke_id(), Some(7));
        assert!(!connection.is_concluded());
    }

    #[tokio::test]
    async fn test_identify_and_conclude() {
        let config = ServerConfig {
            vendor_name: "acme".to_owned(),
            model_name: "relay".to_owned(),
            revision: "2.1".to_owned(),
            ..ServerConfig::default()
        };
        let mut connection = associated(config, 1000).await;
        let ServerMessage::Response { response, .. } =
            call(&mut connection, 1, ConfirmedService::Identify).await
        else {
            panic!("not a response");
        };
        assert_eq!(
            response,
            ConfirmedResponse::Identify {
                vendor: "acme".to_owned(),
                model: "relay".to_owned(),
                revision: "2.1".to_owned(),
            }
        );

        let response = connection.handle_message(&encode_conclude_request()).await.unwrap();
        assert_eq!(response, encode_conclude_response());
        assert!(connection.is_concluded());
    }

    #[tokio::test]
    async fn test_oversized_response() {
        let mut connection = associated(ServerConfig::default(), 64).await;
        let items = (0..8)
            .map(|_| VariableAccessItem::new(ObjectName::domain("ied1Inverter", "LLN0")))
            .collect();
        let response = call(
            &mut connection,
            5,
            ConfirmedService::Read {
                specification_with_result: false,
                specification: VariableAccessSpecification::ListOfVariable(items),
            },
        )
        .await;
        assert!(matches!(
            response,
            ServerMessage::Error { invoke_id: 5, error: ServiceError::RESOURCE_MEMORY_UNAVAILABLE }
        ));
    }
}
