//! MMS (ISO 9506) protocol core: BER codec, data model, PDUs, client and server.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing_error::SpanTrace;

pub mod ber;
pub mod device;
pub mod message;
pub mod type_spec;
pub mod value;

pub mod client;
pub mod server;
pub mod transport;

pub use client::{InformationReportHandler, MmsClient, MmsClientError};
pub use device::{MmsDevice, MmsDomain, NamedVariableList, NamedVariableListEntry};
pub use server::{MmsServer, MmsServerError, ReadHandler, WriteHandler, WriteIndication};
pub use type_spec::MmsTypeSpec;
pub use value::{DataAccessError, MmsValue};

/// Port assigned to ISO transport over TCP.
pub const DEFAULT_PORT: u16 = 102;

/// Client side association parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// The address of the server.
    pub address: String,
    /// The port of the server.
    pub port: u16,
    /// Outstanding requests the client proposes to send.
    pub max_serv_outstanding_calling: u16,
    /// Outstanding requests the client proposes to accept.
    pub max_serv_outstanding_called: u16,
    /// Proposed nesting level of structured data.
    pub data_structure_nesting_level: u8,
    /// Proposed maximum PDU size (localDetailCalling).
    pub max_pdu_size: u32,
    /// How long to wait for the response of a confirmed request.
    pub request_timeout_ms: u64,
    /// How long to wait for the TCP connection and the initiate exchange.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_owned(),
            port: DEFAULT_PORT,
            max_serv_outstanding_calling: 5,
            max_serv_outstanding_called: 5,
            data_structure_nesting_level: 10,
            max_pdu_size: 65000,
            request_timeout_ms: 5000,
            connect_timeout_ms: 10000,
        }
    }
}

impl ClientConfig {
    /// The request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Server side limits and identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to listen on.
    pub address: String,
    /// The port to listen on.
    pub port: u16,
    /// Upper bound for the negotiated PDU size.
    pub max_pdu_size: u32,
    /// Upper bound for the outstanding requests of a client.
    pub max_serv_outstanding_calling: u16,
    /// Upper bound for the outstanding requests of the server.
    pub max_serv_outstanding_called: u16,
    /// Upper bound for the nesting level of structured data.
    pub data_structure_nesting_level: u8,
    /// Vendor name returned by Identify.
    pub vendor_name: String,
    /// Model name returned by Identify.
    pub model_name: String,
    /// Revision returned by Identify.
    pub revision: String,
    /// Maximum number of entries in a client defined named variable list.
    pub max_data_set_entries: usize,
    /// Maximum number of named variable lists one association may define.
    pub max_association_data_sets: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            max_pdu_size: 65000,
            max_serv_outstanding_calling: 5,
            max_serv_outstanding_called: 5,
            data_structure_nesting_level: 10,
            vendor_name: "iec61850-mms".to_owned(),
            model_name: "rust".to_owned(),
            revision: env!("CARGO_PKG_VERSION").to_owned(),
            max_data_set_entries: 100,
            max_association_data_sets: 10,
        }
    }
}

/// A [`SpanTrace`] captured when an error is created.
#[derive(Debug, Clone)]
pub struct SpanTraceWrapper(SpanTrace);

impl snafu::GenerateImplicitData for Box<SpanTraceWrapper> {
    fn generate() -> Self {
        Box::new(SpanTraceWrapper(SpanTrace::capture()))
    }
}

impl fmt::Display for SpanTraceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.status() == tracing_error::SpanTraceStatus::CAPTURED {
            write!(f, "\nAt:\n")?;
            self.0.fmt(f)?;
        }
        Ok(())
    }
}

/// Receiving half of a connection. Every call yields one whole PDU.
#[async_trait]
pub trait ReadHalfConnection: Send {
    /// Transport error.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Wait for the next PDU.
    async fn receive_data(&mut self) -> Result<Vec<u8>, Self::Error>;
}

/// Sending half of a connection. Every call carries one whole PDU.
#[async_trait]
pub trait WriteHalfConnection: Send {
    /// Transport error.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Send a PDU.
    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"address": "10.0.0.1", "request_timeout_ms": 100}"#).unwrap();
        assert_eq!(config.address, "10.0.0.1");
        assert_eq!(config.port, 102);
        assert_eq!(config.request_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_pdu_size, 65000);

        let config: ServerConfig = serde_json::from_str(r#"{"max_data_set_entries": 3}"#).unwrap();
        assert_eq!(config.max_data_set_entries, 3);
        assert_eq!(config.max_association_data_sets, 10);
    }
}
