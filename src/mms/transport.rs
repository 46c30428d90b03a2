//! Transports moving whole MMS PDUs between two peers.
//!
//! The protocol core only needs the [`ReadHalfConnection`](crate::mms::ReadHalfConnection)
//! and [`WriteHalfConnection`](crate::mms::WriteHalfConnection) traits. [`tpkt`] frames
//! PDUs with RFC 1006 headers over TCP, [`channel`] connects a client and a server in
//! memory.

use snafu::Snafu;

use crate::mms::SpanTraceWrapper;

pub mod channel;
pub mod tpkt;

#[allow(missing_docs)]
/// Errors of the transport layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum TransportError {
    #[snafu(display("I/O error on the connection"))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Timeout connecting to {address}"))]
    ConnectTimeout {
        address: String,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid TPKT version {version:#04x}"))]
    InvalidTpktVersion {
        version: u8,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid TPKT length {length}"))]
    InvalidTpktLength {
        length: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Connection closed by peer"))]
    Closed {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl TransportError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::Io { context, .. }
            | Self::ConnectTimeout { context, .. }
            | Self::InvalidTpktVersion { context, .. }
            | Self::InvalidTpktLength { context, .. }
            | Self::Closed { context } => context,
        }
    }

    /// Whether the peer went away, as opposed to a protocol violation.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
