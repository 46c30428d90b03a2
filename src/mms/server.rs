//! MMS server: the shared data model, user handlers and the connection tasks.
//!
//! The device tree is immutable and shared through an [`Arc`]. Values live in a cache
//! keyed by domain and top level variable name, guarded by a [`RwLock`]. Every
//! association is served by its own task, see [`MmsServerConnection`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{Instrument as _, debug, info, info_span, instrument, warn};

use crate::mms::{
    ReadHalfConnection, ServerConfig, SpanTraceWrapper, WriteHalfConnection,
    device::{MmsDevice, NamedVariableLists, split_item_name},
    message::{InformationReport, ObjectName, VariableAccessSpecification},
    transport::{TransportError, tpkt},
    type_spec::MmsTypeSpec,
    value::{DataAccessError, MmsValue},
};

pub mod connection;
mod name_list;
mod variable_access;
mod variable_list;

pub use connection::{ConnectionParameters, MmsServerConnection};

/// PDUs queued for one connection before senders wait.
const OUTGOING_QUEUE_SIZE: usize = 32;

/// Outcome of a [`WriteHandler`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIndication {
    /// Accept the write and update the cached value.
    Ok,
    /// Accept the write but send no Write-Response at all.
    NoResponse,
    /// Refuse the write with an access error.
    Failed(DataAccessError),
}

/// Supplies values for reads instead of the server cache.
pub trait ReadHandler: Send + Sync {
    /// The value of `item` in `domain` (empty for the VMD). `None` falls back to the
    /// cached value.
    fn read(&self, domain: &str, item: &str, connection_id: u64) -> Option<MmsValue>;
}

impl<F> ReadHandler for F
where
    F: Fn(&str, &str, u64) -> Option<MmsValue> + Send + Sync,
{
    fn read(&self, domain: &str, item: &str, connection_id: u64) -> Option<MmsValue> {
        (self)(domain, item, connection_id)
    }
}

/// Decides whether a client write is applied.
pub trait WriteHandler: Send + Sync {
    /// Called for every type checked write, before the cache is updated.
    fn write(
        &self,
        domain: &str,
        item: &str,
        value: &MmsValue,
        connection_id: u64,
    ) -> WriteIndication;
}

impl<F> WriteHandler for F
where
    F: Fn(&str, &str, &MmsValue, u64) -> WriteIndication + Send + Sync,
{
    fn write(
        &self,
        domain: &str,
        item: &str,
        value: &MmsValue,
        connection_id: u64,
    ) -> WriteIndication {
        (self)(domain, item, value, connection_id)
    }
}

/// Mutable part of the server model.
#[derive(Debug)]
struct ModelState {
    /// Values of the top level variables, keyed by domain (empty for the VMD) and name.
    values: HashMap<(String, String), MmsValue>,
    /// Named variable lists of every domain.
    domain_lists: HashMap<String, NamedVariableLists>,
    /// Named variable lists of the VMD.
    vmd_lists: NamedVariableLists,
}

impl ModelState {
    fn new(device: &MmsDevice) -> Self {
        Self {
            values: device.create_values(),
            domain_lists: device
                .domains()
                .iter()
                .map(|domain| (domain.name.clone(), domain.named_variable_lists.clone()))
                .collect(),
            vmd_lists: device.named_variable_lists.clone(),
        }
    }

    /// The cached value at `path` below the top level variable `top`.
    fn value(&self, domain: &str, top: &MmsTypeSpec, path: &str) -> Option<&MmsValue> {
        let value = self.values.get(&(domain.to_owned(), top.name.clone()))?;
        top.get_child_value(value, path)
    }

    /// Replace the cached value at `path` below `top` with `value`.
    ///
    /// The value must be of the type found at `path`.
    fn apply(
        &mut self,
        domain: &str,
        top: &MmsTypeSpec,
        path: &str,
        value: &MmsValue,
    ) -> Result<(), DataAccessError> {
        let spec = top.get_named_sub(path).ok_or(DataAccessError::ObjectNonExistent)?;
        let value = spec.conform(value).ok_or(DataAccessError::TypeInconsistent)?;
        let cached = self
            .values
            .get_mut(&(domain.to_owned(), top.name.clone()))
            .and_then(|cached| top.get_child_value_mut(cached, path))
            .ok_or(DataAccessError::ObjectNonExistent)?;
        if cached.update(&value) {
            Ok(())
        } else {
            Err(DataAccessError::TypeInconsistent)
        }
    }
}

/// An MMS server serving one device to any number of associations.
pub struct MmsServer {
    /// Limits and identity.
    config: ServerConfig,
    /// The object model.
    device: Arc<MmsDevice>,
    /// Values and named variable lists, the write guard is the model lock.
    model: RwLock<ModelState>,
    /// Optional source of read values.
    read_handler: Option<Arc<dyn ReadHandler>>,
    /// Optional write arbiter.
    write_handler: Option<Arc<dyn WriteHandler>>,
    /// Outgoing queues of the running connections.
    connections: std::sync::Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    /// Id of the next connection.
    next_connection_id: AtomicU64,
}

impl fmt::Debug for MmsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmsServer")
            .field("config", &self.config)
            .field("device", &self.device.name)
            .field("read_handler", &self.read_handler.is_some())
            .field("write_handler", &self.write_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl MmsServer {
    /// Create a server for `device`. Every value starts at the default of its type.
    #[must_use]
    pub fn new(config: ServerConfig, device: MmsDevice) -> Self {
        let model = RwLock::new(ModelState::new(&device));
        Self {
            config,
            device: Arc::new(device),
            model,
            read_handler: None,
            write_handler: None,
            connections: std::sync::Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Serve reads through `handler`.
    #[must_use]
    pub fn with_read_handler(mut self, handler: impl ReadHandler + 'static) -> Self {
        self.read_handler = Some(Arc::new(handler));
        self
    }

    /// Arbitrate writes through `handler`.
    #[must_use]
    pub fn with_write_handler(mut self, handler: impl WriteHandler + 'static) -> Self {
        self.write_handler = Some(Arc::new(handler));
        self
    }

    /// The server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The served device.
    #[must_use]
    pub const fn device(&self) -> &Arc<MmsDevice> {
        &self.device
    }

    /// Bind the configured address and serve until the listener fails.
    #[instrument(skip(self), fields(address = %self.config.address, port = self.config.port))]
    pub async fn listen(self: Arc<Self>) -> Result<(), MmsServerError> {
        let listener = TcpListener::bind((self.config.address.as_str(), self.config.port))
            .await
            .context(Io)?;
        info!("Listening on {}:{}", self.config.address, self.config.port);
        self.serve(listener).await
    }

    /// Accept TCP connections and serve each one on its own task.
    #[instrument(skip_all)]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), MmsServerError> {
        loop {
            let (stream, peer) = listener.accept().await.context(Io)?;
            if let Err(error) = stream.set_nodelay(true) {
                warn!("Could not disable Nagle for {peer}: {error}");
            }
            let (reader, writer) = tpkt::split(stream);
            let id = self.spawn_connection(reader, writer);
            info!("Accepted connection {id} from {peer}");
        }
    }

    /// Create the state of a new association without any transport attached.
    ///
    /// [`MmsServerConnection::handle_message`] turns request PDUs into response PDUs.
    #[must_use]
    pub fn new_connection(self: &Arc<Self>) -> MmsServerConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        MmsServerConnection::new(id, Arc::clone(self))
    }

    /// Serve one association over an established transport. Returns the connection id.
    ///
    /// The connection ends when the peer goes away or after a conclude.
    pub fn spawn_connection<R, W>(self: &Arc<Self>, mut reader: R, mut writer: W) -> u64
    where
        R: ReadHalfConnection<Error = TransportError> + 'static,
        W: WriteHalfConnection<Error = TransportError> + 'static,
    {
        let mut connection = self.new_connection();
        let id = connection.id();
        let (sender, mut outgoing) = mpsc::channel::<Vec<u8>>(OUTGOING_QUEUE_SIZE);
        self.connections().insert(id, sender.clone());

        tokio::spawn(
            async move {
                while let Some(data) = outgoing.recv().await {
                    if let Err(error) = writer.send_data(data).await {
                        debug!("Stopped sending: {error}");
                        break;
                    }
                }
            }
            .instrument(info_span!("mms_writer", connection = id)),
        );

        let server = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    let data = match reader.receive_data().await {
                        Ok(data) => data,
                        Err(error) if error.is_closed() => {
                            info!("Connection closed by peer");
                            break;
                        }
                        Err(error) => {
                            warn!("Dropping connection: {error}");
                            break;
                        }
                    };
                    if let Some(response) = connection.handle_message(&data).await
                        && sender.send(response).await.is_err()
                    {
                        break;
                    }
                    if connection.is_concluded() {
                        info!("Association concluded");
                        break;
                    }
                }
                server.connections().remove(&id);
            }
            .instrument(info_span!("mms_connection", connection = id)),
        );
        id
    }

    /// Ids of the running connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Vec<u8>>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an InformationReport for the VMD scope list `name` to one connection.
    #[instrument(skip(self, values), fields(count = values.len()))]
    pub async fn send_information_report(
        &self,
        connection_id: u64,
        name: &str,
        values: Vec<MmsValue>,
    ) -> Result<(), MmsServerError> {
        let report = InformationReport {
            specification: VariableAccessSpecification::VariableListName(ObjectName::VmdSpecific(
                name.to_owned(),
            )),
            values,
        };
        let sender = self
            .connections()
            .get(&connection_id)
            .cloned()
            .context(UnknownConnection { id: connection_id })?;
        ensure!(sender.send(report.to_ber()).await.is_ok(), ConnectionClosed { id: connection_id });
        Ok(())
    }

    /// Set a value in the cache. `item` may address a component with a `$` path.
    #[instrument(skip(self, value))]
    pub async fn set_value(
        &self,
        domain: &str,
        item: &str,
        value: &MmsValue,
    ) -> Result<(), MmsServerError> {
        let top = self
            .device
            .top_level_variable(domain, item)
            .context(UnknownVariable { domain, item })?;
        let (_, path) = split_item_name(item);
        match self.model.write().await.apply(domain, top, path, value) {
            Ok(()) => Ok(()),
            Err(DataAccessError::TypeInconsistent) => TypeMismatch { domain, item }.fail(),
            Err(_) => UnknownVariable { domain, item }.fail(),
        }
    }

    /// A copy of a cached value. `item` may address a component with a `$` path.
    #[instrument(skip(self))]
    pub async fn get_value(&self, domain: &str, item: &str) -> Option<MmsValue> {
        let top = self.device.top_level_variable(domain, item)?;
        let (_, path) = split_item_name(item);
        self.model.read().await.value(domain, top, path).cloned()
    }
}

#[allow(missing_docs)]
/// MMS server errors
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum MmsServerError {
    #[snafu(display("I/O error on the listener"))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Error in transport layer"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("No connection with id {id}"))]
    UnknownConnection {
        id: u64,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Connection {id} is closed"))]
    ConnectionClosed {
        id: u64,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("No variable {item} in domain '{domain}'"))]
    UnknownVariable {
        domain: String,
        item: String,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Value does not match the type of {item} in domain '{domain}'"))]
    TypeMismatch {
        domain: String,
        item: String,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl MmsServerError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Io { context, .. }
            | Self::Transport { context, .. }
            | Self::UnknownConnection { context, .. }
            | Self::ConnectionClosed { context, .. }
            | Self::UnknownVariable { context, .. }
            | Self::TypeMismatch { context, .. } => context,
        }
    }
}
