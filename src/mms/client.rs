//! MMS client: association set up, confirmed services and information reports.
//!
//! Requests are correlated with their responses by invoke id. A background task reads
//! every PDU sent by the server and hands it to the waiting call, to the installed
//! [`InformationReportHandler`] or to a pending conclude.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tokio::{
    sync::{Mutex, Semaphore, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::mms::{
    ClientConfig, ReadHalfConnection, SpanTraceWrapper, WriteHalfConnection,
    device::{NamedVariableList, NamedVariableListEntry},
    message::{
        AlternateAccess, ConfirmedRequest, ConfirmedResponse, ConfirmedService, DeleteScope,
        InformationReport, InitiateParameters, MessageError, ObjectClass, ObjectName, ObjectScope,
        PARAMETER_CBB, RejectReason, ServiceError, VariableAccessItem, VariableAccessSpecification,
        client::{ServerMessage, decode_server_message},
        encode_conclude_request, pdu, peek_invoke_id, split_pdu,
    },
    transport::{TransportError, tpkt},
    type_spec::MmsTypeSpec,
    value::{DataAccessError, MmsValue},
};

/// The only MMS version spoken.
const VERSION_NUMBER: u32 = 1;
/// Smallest PDU size accepted from a server.
const MIN_PDU_SIZE: u32 = 64;
/// Services the client announces: GetNameList.
const SERVICES_SUPPORTED_CALLING: [u8; 11] = [0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Association state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// No association.
    Closed,
    /// Initiate request sent.
    Connecting,
    /// Initiate response accepted.
    Connected,
}

/// Parameters agreed with the server during the initiate exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedParameters {
    /// Largest PDU either side may send.
    pub max_pdu_size: u32,
    /// Requests the client may have outstanding.
    pub max_serv_outstanding_calling: u32,
    /// Requests the server may have outstanding.
    pub max_serv_outstanding_called: u32,
    /// Nesting level of structured data.
    pub data_structure_nesting_level: u32,
    /// Services supported by the server.
    pub services_supported: Vec<u8>,
}

/// Identity reported by the Identify service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    /// Vendor name.
    pub vendor: String,
    /// Model name.
    pub model: String,
    /// Revision.
    pub revision: String,
}

/// Receives the unconfirmed information reports of an association.
#[async_trait]
pub trait InformationReportHandler: Send + Sync {
    /// Called by the reader task for every report. The handler owns the decoded values.
    async fn on_report(&self, report: InformationReport);
}

#[async_trait]
impl<F> InformationReportHandler for F
where
    F: Fn(InformationReport) + Send + Sync,
{
    async fn on_report(&self, report: InformationReport) {
        (self)(report);
    }
}

/// What the reader task hands to a waiting request.
#[derive(Debug)]
enum Reply {
    /// A confirmed response.
    Response(ConfirmedResponse),
    /// A confirmed error.
    Error(ServiceError),
    /// The request was rejected.
    Rejected(RejectReason),
    /// A response carrying the request's invoke id could not be decoded.
    Malformed(MessageError),
}

/// State shared with the reader task.
struct Shared {
    /// Requests waiting for a reply, by invoke id.
    pending: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    /// A conclude waiting for its response.
    conclude: Mutex<Option<oneshot::Sender<()>>>,
    /// Association state.
    state: watch::Sender<AssociationState>,
    /// Receiver of information reports.
    report_handler: Option<Arc<dyn InformationReportHandler>>,
}

impl Shared {
    /// Route one PDU received from the server.
    async fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response { invoke_id, response } => {
                self.reply(invoke_id, Reply::Response(response)).await;
            }
            ServerMessage::Error { invoke_id, error } => {
                self.reply(invoke_id, Reply::Error(error)).await;
            }
            ServerMessage::Reject(reject) => {
                warn!("Server rejected a PDU: {reject:?}");
                if let Some(invoke_id) = reject.invoke_id {
                    self.reply(invoke_id, Reply::Rejected(reject.reason)).await;
                }
            }
            ServerMessage::InformationReport(report) => match &self.report_handler {
                Some(handler) => handler.on_report(report).await,
                None => debug!("Information report dropped, no handler installed"),
            },
            ServerMessage::ConcludeResponse => {
                if let Some(waiter) = self.conclude.lock().await.take() {
                    // The conclude call may have timed out already.
                    let _ = waiter.send(());
                }
            }
            ServerMessage::InitiateResponse(_) | ServerMessage::InitiateError(_) => {
                warn!("Unexpected initiate PDU on an established association");
            }
        }
    }

    /// Hand a reply to the request waiting for `invoke_id`.
    async fn reply(&self, invoke_id: u32, reply: Reply) {
        match self.pending.lock().await.remove(&invoke_id) {
            Some(waiter) => {
                // The caller may have given up already.
                let _ = waiter.send(reply);
            }
            None => warn!("No outstanding request with invoke id {invoke_id}"),
        }
    }

    /// Mark the association closed and wake every waiter.
    async fn close(&self) {
        self.state.send_replace(AssociationState::Closed);
        self.pending.lock().await.clear();
        self.conclude.lock().await.take();
    }
}

/// Read PDUs until the transport fails, then close the association.
async fn receive_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: ReadHalfConnection<Error = TransportError>,
{
    loop {
        let data = match reader.receive_data().await {
            Ok(data) => data,
            Err(error) if error.is_closed() => {
                info!("Connection closed by the server");
                break;
            }
            Err(error) => {
                warn!("Error receiving PDU: {error}");
                break;
            }
        };
        match decode_server_message(&data) {
            Ok(message) => shared.dispatch(message).await,
            Err(error) => {
                debug!("Malformed PDU from server: {error}");
                let invoke_id = split_pdu(&data)
                    .ok()
                    .and_then(|(tag, content)| peek_invoke_id(tag, content));
                if let Some(invoke_id) = invoke_id {
                    shared.reply(invoke_id, Reply::Malformed(error)).await;
                }
            }
        }
    }
    shared.close().await;
}

/// An MMS association with a server.
pub struct MmsClient {
    /// State shared with the reader task.
    shared: Arc<Shared>,
    /// The sending half of the transport.
    writer: Mutex<Box<dyn WriteHalfConnection<Error = TransportError>>>,
    /// Bounds the outstanding requests.
    outstanding: Semaphore,
    /// Next invoke id. Wraps around.
    next_invoke_id: AtomicU32,
    /// How long a request may wait for its reply.
    request_timeout: Duration,
    /// Agreed parameters.
    parameters: NegotiatedParameters,
    /// The reader task.
    reader_task: JoinHandle<()>,
}

impl fmt::Debug for MmsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmsClient")
            .field("state", &self.state())
            .field("parameters", &self.parameters)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for MmsClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl MmsClient {
    /// Open a TCP connection to the configured server and associate.
    #[instrument(skip(report_handler))]
    pub async fn connect_tcp(
        config: &ClientConfig,
        report_handler: Option<Arc<dyn InformationReportHandler>>,
    ) -> Result<Self, MmsClientError> {
        let (reader, writer) = tpkt::connect(&config.address, config.port, config.connect_timeout())
            .await
            .context(Transport)?;
        info!("Connected to {}:{}", config.address, config.port);
        Self::connect(config, reader, writer, report_handler).await
    }

    /// Associate over an established transport.
    ///
    /// Sends the initiate request, validates the response and starts the reader task.
    #[instrument(skip_all)]
    pub async fn connect<R, W>(
        config: &ClientConfig,
        mut reader: R,
        mut writer: W,
        report_handler: Option<Arc<dyn InformationReportHandler>>,
    ) -> Result<Self, MmsClientError>
    where
        R: ReadHalfConnection<Error = TransportError> + 'static,
        W: WriteHalfConnection<Error = TransportError> + 'static,
    {
        let (state, _) = watch::channel(AssociationState::Connecting);

        let request = InitiateParameters {
            local_detail: Some(config.max_pdu_size),
            max_serv_outstanding_calling: u32::from(config.max_serv_outstanding_calling),
            max_serv_outstanding_called: u32::from(config.max_serv_outstanding_called),
            data_structure_nesting_level: Some(u32::from(config.data_structure_nesting_level)),
            version: VERSION_NUMBER,
            parameter_cbb: PARAMETER_CBB.to_vec(),
            services_supported: SERVICES_SUPPORTED_CALLING.to_vec(),
        };
        writer.send_data(request.to_ber(pdu::INITIATE_REQUEST)).await.context(Transport)?;

        let response = tokio::time::timeout(config.connect_timeout(), reader.receive_data())
            .await
            .ok()
            .context(Timeout)?
            .context(Transport)?;
        let parameters = match decode_server_message(&response).context(Message)? {
            ServerMessage::InitiateResponse(response) => Self::negotiate(config, &response)?,
            ServerMessage::InitiateError(error) => return InitiateRefused { error }.fail(),
            _ => return UnexpectedResponse.fail(),
        };
        debug!("Negotiated {parameters:?}");

        state.send_replace(AssociationState::Connected);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            conclude: Mutex::new(None),
            state,
            report_handler,
        });
        let reader_task = tokio::spawn(receive_loop(reader, Arc::clone(&shared)));
        let permits = usize::try_from(parameters.max_serv_outstanding_calling.max(1)).unwrap_or(1);

        Ok(Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            outstanding: Semaphore::new(permits),
            next_invoke_id: AtomicU32::new(0),
            request_timeout: config.request_timeout(),
            parameters,
            reader_task,
        })
    }

    /// Check an initiate response against what was proposed.
    fn negotiate(
        config: &ClientConfig,
        response: &InitiateParameters,
    ) -> Result<NegotiatedParameters, MmsClientError> {
        ensure!(response.version == VERSION_NUMBER, VersionMismatch { version: response.version });
        let max_pdu_size = response.local_detail.unwrap_or(config.max_pdu_size);
        ensure!(max_pdu_size >= MIN_PDU_SIZE, MinPduSizeExceeded { size: max_pdu_size });
        ensure!(
            response.max_serv_outstanding_calling <= u32::from(config.max_serv_outstanding_calling),
            MaxServOutstandingCallingExceeded
        );
        ensure!(
            response.max_serv_outstanding_called <= u32::from(config.max_serv_outstanding_called),
            MaxServOutstandingCalledExceeded
        );
        let nesting = u32::from(config.data_structure_nesting_level);
        let data_structure_nesting_level = response.data_structure_nesting_level.unwrap_or(nesting);
        ensure!(data_structure_nesting_level <= nesting, DataStructureNestingLevelExceeded);

        Ok(NegotiatedParameters {
            max_pdu_size,
            max_serv_outstanding_calling: response.max_serv_outstanding_calling,
            max_serv_outstanding_called: response.max_serv_outstanding_called,
            data_structure_nesting_level,
            services_supported: response.services_supported.clone(),
        })
    }

    /// The association state.
    #[must_use]
    pub fn state(&self) -> AssociationState {
        *self.shared.state.borrow()
    }

    /// The parameters agreed with the server.
    #[must_use]
    pub const fn parameters(&self) -> &NegotiatedParameters {
        &self.parameters
    }

    /// Send a confirmed request and wait for its reply.
    #[instrument(level = "debug", skip(self))]
    async fn request(
        &self,
        service: ConfirmedService,
    ) -> Result<ConfirmedResponse, MmsClientError> {
        ensure!(self.state() == AssociationState::Connected, NotConnected);
        let _permit = self.outstanding.acquire().await.ok().context(ConnectionLost)?;

        let invoke_id = self.next_invoke_id.fetch_add(1, Ordering::Relaxed);
        let request = ConfirmedRequest { invoke_id, service };
        let size = request.encoded_size();
        ensure!(
            size <= usize::try_from(self.parameters.max_pdu_size).unwrap_or(usize::MAX),
            RequestTooLarge { size }
        );
        let pdu = request.to_ber();

        let (sender, receiver) = oneshot::channel();
        self.shared.pending.lock().await.insert(invoke_id, sender);
        if self.state() != AssociationState::Connected {
            self.shared.pending.lock().await.remove(&invoke_id);
            return ConnectionLost.fail();
        }
        if let Err(error) = self.writer.lock().await.send_data(pdu).await {
            self.shared.pending.lock().await.remove(&invoke_id);
            return Err(error).context(Transport);
        }

        let reply = match tokio::time::timeout(self.request_timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return ConnectionLost.fail(),
            Err(_) => {
                self.shared.pending.lock().await.remove(&invoke_id);
                return Timeout.fail();
            }
        };
        match reply {
            Reply::Response(response) => Ok(response),
            Reply::Error(error) => ServiceFailed { error }.fail(),
            Reply::Rejected(reason) => Rejected { reason }.fail(),
            Reply::Malformed(error) => Err(error).context(Message),
        }
    }

    /// List every name of `object_class` in `scope`, following continueAfter until the
    /// server has no more.
    #[instrument(skip(self))]
    pub async fn get_name_list(
        &self,
        object_class: ObjectClass,
        scope: ObjectScope,
    ) -> Result<Vec<String>, MmsClientError> {
        let mut names = Vec::new();
        let mut continue_after = None;
        loop {
            let response = self
                .request(ConfirmedService::GetNameList {
                    object_class,
                    scope: scope.clone(),
                    continue_after: continue_after.take(),
                })
                .await?;
            let ConfirmedResponse::GetNameList { names: page, more_follows } = response else {
                return UnexpectedResponse.fail();
            };
            let last = page.last().cloned();
            names.extend(page);
            match last {
                Some(last) if more_follows => continue_after = Some(last),
                _ => break,
            }
        }
        Ok(names)
    }

    /// Names of the domains (logical devices) of the server.
    pub async fn get_domain_names(&self) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::Domain, ObjectScope::Vmd).await
    }

    /// Names of the variables of a domain, including every `$` sub path.
    pub async fn get_domain_variable_names(
        &self,
        domain: &str,
    ) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::NamedVariable, ObjectScope::Domain(domain.to_owned()))
            .await
    }

    /// Names of the named variable lists of a domain.
    pub async fn get_domain_variable_list_names(
        &self,
        domain: &str,
    ) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::NamedVariableList, ObjectScope::Domain(domain.to_owned()))
            .await
    }

    /// Names of the journals of a domain.
    pub async fn get_domain_journal_names(
        &self,
        domain: &str,
    ) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::Journal, ObjectScope::Domain(domain.to_owned())).await
    }

    /// Names of the VMD scope variables.
    pub async fn get_vmd_variable_names(&self) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::NamedVariable, ObjectScope::Vmd).await
    }

    /// Names of the lists defined by this association.
    pub async fn get_association_variable_list_names(&self) -> Result<Vec<String>, MmsClientError> {
        self.get_name_list(ObjectClass::NamedVariableList, ObjectScope::Association).await
    }

    /// Vendor, model and revision of the server.
    #[instrument(skip(self))]
    pub async fn identify(&self) -> Result<ServerIdentity, MmsClientError> {
        let ConfirmedResponse::Identify { vendor, model, revision } =
            self.request(ConfirmedService::Identify).await?
        else {
            return UnexpectedResponse.fail();
        };
        Ok(ServerIdentity { vendor, model, revision })
    }

    /// Read values and return one result per requested variable.
    async fn read(
        &self,
        specification: VariableAccessSpecification,
        specification_with_result: bool,
    ) -> Result<Vec<MmsValue>, MmsClientError> {
        let response = self
            .request(ConfirmedService::Read { specification_with_result, specification })
            .await?;
        let ConfirmedResponse::Read { results, .. } = response else {
            return UnexpectedResponse.fail();
        };
        Ok(results)
    }

    /// Read one variable, failing with its access error.
    async fn read_single(&self, item: VariableAccessItem) -> Result<MmsValue, MmsClientError> {
        let results =
            self.read(VariableAccessSpecification::ListOfVariable(vec![item]), false).await?;
        let mut results = results.into_iter();
        let (Some(value), None) = (results.next(), results.next()) else {
            return UnexpectedResponse.fail();
        };
        match value {
            MmsValue::DataAccessError(error) => AccessFailed { error }.fail(),
            value => Ok(value),
        }
    }

    /// Read a variable. An empty `domain` names a VMD scope variable.
    #[instrument(skip(self))]
    pub async fn read_variable(
        &self,
        domain: &str,
        item: &str,
    ) -> Result<MmsValue, MmsClientError> {
        self.read_single(VariableAccessItem::new(object_name(domain, item))).await
    }

    /// Read `count` elements of an array starting at `start`.
    #[instrument(skip(self))]
    pub async fn read_array_elements(
        &self,
        domain: &str,
        item: &str,
        start: u32,
        count: u32,
    ) -> Result<MmsValue, MmsClientError> {
        self.read_single(VariableAccessItem {
            name: object_name(domain, item),
            alternate_access: Some(AlternateAccess::IndexRange { low: start, count }),
        })
        .await
    }

    /// Read one component of an array element.
    #[instrument(skip(self))]
    pub async fn read_array_element_component(
        &self,
        domain: &str,
        item: &str,
        index: u32,
        component: &str,
    ) -> Result<MmsValue, MmsClientError> {
        self.read_single(VariableAccessItem {
            name: object_name(domain, item),
            alternate_access: Some(AlternateAccess::IndexComponent {
                index,
                component: component.to_owned(),
            }),
        })
        .await
    }

    /// Read several variables of a domain with one request. Access errors are returned
    /// as [`MmsValue::DataAccessError`] in place of the value.
    #[instrument(skip(self))]
    pub async fn read_multiple_variables(
        &self,
        domain: &str,
        items: &[&str],
    ) -> Result<Vec<MmsValue>, MmsClientError> {
        let items = items
            .iter()
            .map(|item| VariableAccessItem::new(object_name(domain, item)))
            .collect();
        self.read(VariableAccessSpecification::ListOfVariable(items), false).await
    }

    /// Read the values of a domain named variable list.
    #[instrument(skip(self))]
    pub async fn read_named_variable_list_values(
        &self,
        domain: &str,
        list: &str,
        specification_with_result: bool,
    ) -> Result<Vec<MmsValue>, MmsClientError> {
        self.read(
            VariableAccessSpecification::VariableListName(ObjectName::domain(domain, list)),
            specification_with_result,
        )
        .await
    }

    /// Read the values of a list defined by this association.
    #[instrument(skip(self))]
    pub async fn read_association_named_variable_list_values(
        &self,
        list: &str,
        specification_with_result: bool,
    ) -> Result<Vec<MmsValue>, MmsClientError> {
        self.read(
            VariableAccessSpecification::VariableListName(ObjectName::AaSpecific(list.to_owned())),
            specification_with_result,
        )
        .await
    }

    /// Write values and return one result per variable.
    async fn write(
        &self,
        items: Vec<VariableAccessItem>,
        data: Vec<MmsValue>,
    ) -> Result<Vec<Result<(), DataAccessError>>, MmsClientError> {
        let expected = items.len();
        let response = self
            .request(ConfirmedService::Write {
                specification: VariableAccessSpecification::ListOfVariable(items),
                data,
            })
            .await?;
        let ConfirmedResponse::Write(results) = response else {
            return UnexpectedResponse.fail();
        };
        ensure!(results.len() == expected, UnexpectedResponse);
        Ok(results)
    }

    /// Write one variable, failing with its access error.
    async fn write_single(
        &self,
        item: VariableAccessItem,
        value: MmsValue,
    ) -> Result<(), MmsClientError> {
        let results = self.write(vec![item], vec![value]).await?;
        match results.first() {
            Some(Ok(())) => Ok(()),
            Some(Err(error)) => AccessFailed { error: *error }.fail(),
            None => UnexpectedResponse.fail(),
        }
    }

    /// Write a variable. An empty `domain` names a VMD scope variable.
    #[instrument(skip(self, value))]
    pub async fn write_variable(
        &self,
        domain: &str,
        item: &str,
        value: &MmsValue,
    ) -> Result<(), MmsClientError> {
        self.write_single(VariableAccessItem::new(object_name(domain, item)), value.clone()).await
    }

    /// Write several variables of a domain with one request.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn write_multiple_variables(
        &self,
        domain: &str,
        items: &[(&str, MmsValue)],
    ) -> Result<Vec<Result<(), DataAccessError>>, MmsClientError> {
        let (names, values): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|(item, value)| {
                (VariableAccessItem::new(object_name(domain, item)), value.clone())
            })
            .unzip();
        self.write(names, values).await
    }

    /// Write consecutive array elements starting at `start`.
    #[instrument(skip(self, values), fields(count = values.len()))]
    pub async fn write_array_elements(
        &self,
        domain: &str,
        item: &str,
        start: u32,
        values: Vec<MmsValue>,
    ) -> Result<(), MmsClientError> {
        let count = u32::try_from(values.len())
            .ok()
            .context(InvalidArgument { what: "too many elements" })?;
        self.write_single(
            VariableAccessItem {
                name: object_name(domain, item),
                alternate_access: Some(AlternateAccess::IndexRange { low: start, count }),
            },
            MmsValue::Array(values),
        )
        .await
    }

    /// Type of a variable or of one of its `$` sub paths.
    #[instrument(skip(self))]
    pub async fn get_variable_access_attributes(
        &self,
        domain: &str,
        item: &str,
    ) -> Result<MmsTypeSpec, MmsClientError> {
        let name = object_name(domain, item);
        let response = self.request(ConfirmedService::GetVariableAccessAttributes { name }).await?;
        let ConfirmedResponse::GetVariableAccessAttributes { mut type_spec, .. } = response else {
            return UnexpectedResponse.fail();
        };
        item.rsplit('$').next().unwrap_or(item).clone_into(&mut type_spec.name);
        Ok(type_spec)
    }

    /// Create a named variable list.
    async fn define(
        &self,
        name: ObjectName,
        entries: &[NamedVariableListEntry],
    ) -> Result<(), MmsClientError> {
        let items = entries.iter().map(VariableAccessItem::from).collect();
        let response =
            self.request(ConfirmedService::DefineNamedVariableList { name, items }).await?;
        ensure!(matches!(response, ConfirmedResponse::DefineNamedVariableList), UnexpectedResponse);
        Ok(())
    }

    /// Create a list in a domain. It lives until deleted.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn define_named_variable_list(
        &self,
        domain: &str,
        list: &str,
        entries: &[NamedVariableListEntry],
    ) -> Result<(), MmsClientError> {
        self.define(ObjectName::domain(domain, list), entries).await
    }

    /// Create a list that lives as long as this association.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn define_association_named_variable_list(
        &self,
        list: &str,
        entries: &[NamedVariableListEntry],
    ) -> Result<(), MmsClientError> {
        self.define(ObjectName::AaSpecific(list.to_owned()), entries).await
    }

    /// Members of a named variable list.
    async fn list_attributes(&self, name: ObjectName) -> Result<NamedVariableList, MmsClientError> {
        let list = name.item_id().to_owned();
        let response =
            self.request(ConfirmedService::GetNamedVariableListAttributes { name }).await?;
        let ConfirmedResponse::GetNamedVariableListAttributes { deletable, items } = response else {
            return UnexpectedResponse.fail();
        };
        let entries = items
            .iter()
            .map(NamedVariableListEntry::try_from)
            .collect::<Result<_, _>>()
            .context(Message)?;
        Ok(NamedVariableList::new(list, deletable, entries))
    }

    /// Members of a domain list, in order, and whether it can be deleted.
    #[instrument(skip(self))]
    pub async fn get_named_variable_list_attributes(
        &self,
        domain: &str,
        list: &str,
    ) -> Result<NamedVariableList, MmsClientError> {
        self.list_attributes(ObjectName::domain(domain, list)).await
    }

    /// Members of an association list, in order.
    #[instrument(skip(self))]
    pub async fn get_association_named_variable_list_attributes(
        &self,
        list: &str,
    ) -> Result<NamedVariableList, MmsClientError> {
        self.list_attributes(ObjectName::AaSpecific(list.to_owned())).await
    }

    /// Delete one list. True if the server deleted it.
    async fn delete(&self, name: ObjectName) -> Result<bool, MmsClientError> {
        let response = self
            .request(ConfirmedService::DeleteNamedVariableList {
                scope: DeleteScope::Specific,
                names: vec![name],
                domain: None,
            })
            .await?;
        let ConfirmedResponse::DeleteNamedVariableList { deleted, .. } = response else {
            return UnexpectedResponse.fail();
        };
        Ok(deleted == 1)
    }

    /// Delete a domain list. True if the server deleted it.
    #[instrument(skip(self))]
    pub async fn delete_named_variable_list(
        &self,
        domain: &str,
        list: &str,
    ) -> Result<bool, MmsClientError> {
        self.delete(ObjectName::domain(domain, list)).await
    }

    /// Delete an association list. True if the server deleted it.
    #[instrument(skip(self))]
    pub async fn delete_association_named_variable_list(
        &self,
        list: &str,
    ) -> Result<bool, MmsClientError> {
        self.delete(ObjectName::AaSpecific(list.to_owned())).await
    }

    /// Release the association.
    #[instrument(skip(self))]
    pub async fn conclude(&self) -> Result<(), MmsClientError> {
        ensure!(self.state() == AssociationState::Connected, NotConnected);
        let (sender, receiver) = oneshot::channel();
        *self.shared.conclude.lock().await = Some(sender);
        self.writer.lock().await.send_data(encode_conclude_request()).await.context(Transport)?;
        match tokio::time::timeout(self.request_timeout, receiver).await {
            Ok(Ok(())) => {
                self.shared.state.send_replace(AssociationState::Closed);
                info!("Association concluded");
                Ok(())
            }
            Ok(Err(_)) => ConnectionLost.fail(),
            Err(_) => {
                self.shared.conclude.lock().await.take();
                Timeout.fail()
            }
        }
    }
}

/// Name of a variable. An empty domain selects the VMD scope.
fn object_name(domain: &str, item: &str) -> ObjectName {
    if domain.is_empty() {
        ObjectName::VmdSpecific(item.to_owned())
    } else {
        ObjectName::domain(domain, item)
    }
}

#[allow(missing_docs)]
/// MMS client errors
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum MmsClientError {
    #[snafu(display("Error in transport layer"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Error decoding response"))]
    Message {
        source: MessageError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Association refused: {error}"))]
    InitiateRefused {
        error: ServiceError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Version mismatch, server answered {version}"))]
    VersionMismatch {
        version: u32,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Min PDU size exceeded: {size}"))]
    MinPduSizeExceeded {
        size: u32,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Max serv outstanding called exceeded"))]
    MaxServOutstandingCalledExceeded {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Max serv outstanding calling exceeded"))]
    MaxServOutstandingCallingExceeded {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Data structure nesting level exceeded"))]
    DataStructureNestingLevelExceeded {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Not connected"))]
    NotConnected {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Connection lost"))]
    ConnectionLost {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Timeout waiting for the server"))]
    Timeout {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Service failed: {error}"))]
    ServiceFailed {
        error: ServiceError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Request rejected: {reason:?}"))]
    Rejected {
        reason: RejectReason,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Access failed: {error}"))]
    AccessFailed {
        error: DataAccessError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Unexpected service response"))]
    UnexpectedResponse {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Request of {size} bytes exceeds the negotiated PDU size"))]
    RequestTooLarge {
        size: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid argument: {what}"))]
    InvalidArgument {
        what: &'static str,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl MmsClientError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Transport { context, .. }
            | Self::Message { context, .. }
            | Self::InitiateRefused { context, .. }
            | Self::VersionMismatch { context, .. }
            | Self::MinPduSizeExceeded { context, .. }
            | Self::MaxServOutstandingCalledExceeded { context }
            | Self::MaxServOutstandingCallingExceeded { context }
            | Self::DataStructureNestingLevelExceeded { context }
            | Self::NotConnected { context }
            | Self::ConnectionLost { context }
            | Self::Timeout { context }
            | Self::ServiceFailed { context, .. }
            | Self::Rejected { context, .. }
            | Self::AccessFailed { context, .. }
            | Self::UnexpectedResponse { context }
            | Self::RequestTooLarge { context, .. }
            | Self::InvalidArgument { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_telemetry::config::OtelConfig;

    use super::*;
    use crate::mms::{
        message::{
            encode_conclude_response, encode_confirmed_error, encode_initiate_error,
            server::{ClientMessage, decode_client_message},
        },
        transport::channel::{self, ChannelReadHalf, ChannelWriteHalf},
    };

    /// The server side of a scripted association.
    struct FakeServer {
        reader: ChannelReadHalf,
        writer: ChannelWriteHalf,
    }

    impl FakeServer {
        async fn receive(&mut self) -> ClientMessage {
            decode_client_message(&self.reader.receive_data().await.unwrap()).unwrap()
        }

        async fn receive_request(&mut self) -> ConfirmedRequest {
            let ClientMessage::ConfirmedRequest(request) = self.receive().await else {
                panic!("not a confirmed request");
            };
            request
        }

        async fn send(&mut self, data: Vec<u8>) {
            self.writer.send_data(data).await.unwrap();
        }
    }

    fn accepted(calling: u32) -> Vec<u8> {
        InitiateParameters {
            local_detail: Some(1000),
            max_serv_outstanding_calling: calling,
            max_serv_outstanding_called: 1,
            data_structure_nesting_level: Some(5),
            version: 1,
            parameter_cbb: PARAMETER_CBB.to_vec(),
            services_supported: vec![0x6e, 0x1c, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        }
        .to_ber(pdu::INITIATE_RESPONSE)
    }

    fn test_config() -> ClientConfig {
        ClientConfig { request_timeout_ms: 200, connect_timeout_ms: 200, ..ClientConfig::default() }
    }

    /// Start a client against a scripted server that accepts the association.
    async fn associate(
        handler: Option<Arc<dyn InformationReportHandler>>,
    ) -> (MmsClient, FakeServer) {
        let ((client_read, client_write), (server_read, server_write)) = channel::pair(8);
        let mut server = FakeServer { reader: server_read, writer: server_write };
        let (client, ()) = tokio::join!(
            async {
                MmsClient::connect(&test_config(), client_read, client_write, handler)
                    .await
                    .unwrap()
            },
            async {
                let ClientMessage::InitiateRequest(request) = server.receive().await else {
                    panic!("not an initiate request");
                };
                assert_eq!(request.local_detail, Some(65000));
                assert_eq!(request.services_supported, SERVICES_SUPPORTED_CALLING);
                server.send(accepted(2)).await;
            }
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_initiate_negotiation() {
        let _g = rust_telemetry::init_otel!(&OtelConfig::for_tests());
        let (client, _server) = associate(None).await;
        assert_eq!(client.state(), AssociationState::Connected);
        assert_eq!(client.parameters().max_pdu_size, 1000);
        assert_eq!(client.parameters().max_serv_outstanding_calling, 2);
        assert_eq!(client.parameters().data_structure_nesting_level, 5);
    }

    #[tokio::test]
    async fn test_initiate_rejected() {
        let ((client_read, client_write), (mut server_read, mut server_write)) = channel::pair(8);
        server_write.send_data(encode_initiate_error(ServiceError::INITIATE_OTHER)).await.unwrap();
        let result = MmsClient::connect(&test_config(), client_read, client_write, None).await;
        assert!(matches!(result, Err(MmsClientError::InitiateRefused { .. })));
        assert!(server_read.receive_data().await.is_ok());

        let ((client_read, client_write), (_server_read, mut server_write)) = channel::pair(8);
        server_write.send_data(accepted(50)).await.unwrap();
        let result = MmsClient::connect(&test_config(), client_read, client_write, None).await;
        assert!(matches!(result, Err(MmsClientError::MaxServOutstandingCallingExceeded { .. })));
    }

    #[tokio::test]
    async fn test_responses_are_routed_by_invoke_id() {
        let (client, mut server) = associate(None).await;
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.read_variable("LD", "A").await }
        });
        let second = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.read_variable("LD", "B").await }
        });

        let mut requests = vec![server.receive_request().await, server.receive_request().await];
        // answer in reverse order
        requests.reverse();
        for request in requests {
            let ConfirmedService::Read { specification, .. } = &request.service else {
                panic!("not a read");
            };
            let VariableAccessSpecification::ListOfVariable(items) = specification else {
                panic!("not a list of variable");
            };
            let value = MmsValue::new_visible_string(items[0].name.item_id());
            let response = ConfirmedResponse::Read { specification: None, results: vec![value] };
            server.send(response.to_ber(request.invoke_id)).await;
        }

        assert_eq!(first.await.unwrap().unwrap().as_str(), Some("A"));
        assert_eq!(second.await.unwrap().unwrap().as_str(), Some("B"));
    }

    #[tokio::test]
    async fn test_errors_map_to_client_errors() {
        let (client, mut server) = associate(None).await;
        let (result, ()) = tokio::join!(client.read_variable("LD", "missing"), async {
            let request = server.receive_request().await;
            let response = ConfirmedResponse::Read {
                specification: None,
                results: vec![MmsValue::new_data_access_error(DataAccessError::ObjectNonExistent)],
            };
            server.send(response.to_ber(request.invoke_id)).await;
        });
        assert!(matches!(
            result,
            Err(MmsClientError::AccessFailed { error: DataAccessError::ObjectNonExistent, .. })
        ));

        let (result, ()) = tokio::join!(client.identify(), async {
            let request = server.receive_request().await;
            let error = ServiceError::ACCESS_OBJECT_ACCESS_DENIED;
            server.send(encode_confirmed_error(request.invoke_id, error)).await;
        });
        assert!(matches!(
            result,
            Err(MmsClientError::ServiceFailed {
                error: ServiceError::ACCESS_OBJECT_ACCESS_DENIED,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_request() {
        let (client, mut server) = associate(None).await;
        let (result, request) = tokio::join!(client.identify(), server.receive_request());
        assert!(matches!(result, Err(MmsClientError::Timeout { .. })));
        assert!(client.shared.pending.lock().await.is_empty());

        // a late answer is dropped and the association keeps working
        let late = ConfirmedResponse::Identify {
            vendor: "v".to_owned(),
            model: "m".to_owned(),
            revision: "r".to_owned(),
        };
        server.send(late.to_ber(request.invoke_id)).await;
        let (result, ()) = tokio::join!(client.identify(), async {
            let request = server.receive_request().await;
            server.send(late.to_ber(request.invoke_id)).await;
        });
        assert_eq!(result.unwrap().vendor, "v");
    }

    #[tokio::test]
    async fn test_connection_loss_wakes_waiters() {
        let (client, mut server) = associate(None).await;
        let (result, ()) = tokio::join!(client.identify(), async {
            server.receive_request().await;
            drop(server);
        });
        assert!(matches!(result, Err(MmsClientError::ConnectionLost { .. })));
        assert_eq!(client.state(), AssociationState::Closed);
        assert!(matches!(client.identify().await, Err(MmsClientError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_information_reports_reach_handler() {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let handler: Arc<dyn InformationReportHandler> = Arc::new(move |report: InformationReport| {
            let _ = sender.send(report);
        });
        let (_client, mut server) = associate(Some(handler)).await;

        let report = InformationReport {
            specification: VariableAccessSpecification::VariableListName(ObjectName::VmdSpecific(
                "RPT".to_owned(),
            )),
            values: vec![
                MmsValue::new_visible_string("LD/LLN0$RP$brcb01"),
                MmsValue::new_boolean(true),
            ],
        };
        server.send(report.to_ber()).await;
        assert_eq!(receiver.recv().await, Some(report));
    }

    #[tokio::test]
    async fn test_name_list_follows_continue_after() {
        let (client, mut server) = associate(None).await;
        let (names, ()) = tokio::join!(client.get_domain_variable_names("LD"), async {
            let request = server.receive_request().await;
            let ConfirmedService::GetNameList { continue_after: None, .. } = &request.service else {
                panic!("unexpected first request");
            };
            let page = ConfirmedResponse::GetNameList {
                names: vec!["A".to_owned(), "B".to_owned()],
                more_follows: true,
            };
            server.send(page.to_ber(request.invoke_id)).await;

            let request = server.receive_request().await;
            let ConfirmedService::GetNameList { continue_after: Some(after), .. } = &request.service
            else {
                panic!("continueAfter missing");
            };
            assert_eq!(after, "B");
            let page = ConfirmedResponse::GetNameList {
                names: vec!["C".to_owned()],
                more_follows: false,
            };
            server.send(page.to_ber(request.invoke_id)).await;
        });
        assert_eq!(names.unwrap(), ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_conclude() {
        let (client, mut server) = associate(None).await;
        let (result, ()) = tokio::join!(client.conclude(), async {
            assert_eq!(server.receive().await, ClientMessage::ConcludeRequest);
            server.send(encode_conclude_response()).await;
        });
        result.unwrap();
        assert_eq!(client.state(), AssociationState::Closed);
    }
}
