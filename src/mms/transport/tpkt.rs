//! RFC 1006 TPKT framing over TCP.
//!
//! Every PDU is prefixed by a 4 byte header: version 3, a reserved zero byte and the big
//! endian length of the whole packet, header included.

use std::time::Duration;

use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _, ensure};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::instrument;

use super::{ConnectTimeout, InvalidTpktLength, InvalidTpktVersion, Io, TransportError};
use crate::mms::{ReadHalfConnection, WriteHalfConnection};

/// TPKT version byte.
pub const TPKT_VERSION: u8 = 0x03;
/// Size of the TPKT header.
pub const TPKT_HEADER_SIZE: usize = 4;
/// Largest PDU a single TPKT can carry.
pub const TPKT_MAX_PAYLOAD: usize = u16::MAX as usize - TPKT_HEADER_SIZE;

/// Open a TCP connection and split it into TPKT halves.
#[instrument(level = "debug")]
pub async fn connect(
    address: &str,
    port: u16,
    timeout: Duration,
) -> Result<(TpktReadHalf<OwnedReadHalf>, TpktWriteHalf<OwnedWriteHalf>), TransportError> {
    let address = format!("{address}:{port}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
        .await
        .ok()
        .context(ConnectTimeout { address: address.clone() })?
        .context(Io)?;
    stream.set_nodelay(true).context(Io)?;
    Ok(split(stream))
}

/// Split an established TCP stream into TPKT halves.
#[must_use]
pub fn split(stream: TcpStream) -> (TpktReadHalf<OwnedReadHalf>, TpktWriteHalf<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (TpktReadHalf::new(read), TpktWriteHalf::new(write))
}

/// Prefix a PDU with its TPKT header.
pub fn encode_tpkt(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    ensure!(data.len() <= TPKT_MAX_PAYLOAD, InvalidTpktLength { length: data.len() });
    let length = u16::try_from(data.len() + TPKT_HEADER_SIZE)
        .ok()
        .context(InvalidTpktLength { length: data.len() })?;
    let mut packet = Vec::with_capacity(data.len() + TPKT_HEADER_SIZE);
    packet.push(TPKT_VERSION);
    packet.push(0x00);
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(data);
    Ok(packet)
}

/// Read one TPKT and return its payload.
#[instrument(level = "debug", skip(reader))]
pub async fn read_tpkt<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0; TPKT_HEADER_SIZE];
    reader.read_exact(&mut header).await.context(Io)?;
    ensure!(header[0] == TPKT_VERSION, InvalidTpktVersion { version: header[0] });
    ensure!(header[1] == 0, InvalidTpktVersion { version: header[1] });

    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
    ensure!(length > TPKT_HEADER_SIZE, InvalidTpktLength { length });

    let mut payload = vec![0; length - TPKT_HEADER_SIZE];
    reader.read_exact(&mut payload).await.context(Io)?;
    Ok(payload)
}

/// Receiving side of a TPKT connection.
#[derive(Debug)]
pub struct TpktReadHalf<R> {
    /// The underlying byte stream.
    reader: R,
}

impl<R> TpktReadHalf<R> {
    /// Wrap a byte stream.
    pub const fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ReadHalfConnection for TpktReadHalf<R> {
    type Error = TransportError;

    async fn receive_data(&mut self) -> Result<Vec<u8>, Self::Error> {
        read_tpkt(&mut self.reader).await
    }
}

/// Sending side of a TPKT connection.
#[derive(Debug)]
pub struct TpktWriteHalf<W> {
    /// The underlying byte stream.
    writer: W,
}

impl<W> TpktWriteHalf<W> {
    /// Wrap a byte stream.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> WriteHalfConnection for TpktWriteHalf<W> {
    type Error = TransportError;

    #[instrument(level = "debug", skip_all, fields(len = data.len()))]
    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Self::Error> {
        let packet = encode_tpkt(&data)?;
        self.writer.write_all(&packet).await.context(Io)?;
        self.writer.flush().await.context(Io)
    }
}
