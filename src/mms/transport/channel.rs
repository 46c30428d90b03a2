//! In-memory transport backed by tokio mpsc channels.

use async_trait::async_trait;
use snafu::{OptionExt as _, ensure};
use tokio::sync::mpsc;

use super::{Closed, TransportError};
use crate::mms::{ReadHalfConnection, WriteHalfConnection};

/// One end of an in-memory connection.
pub type ChannelEnd = (ChannelReadHalf, ChannelWriteHalf);

/// Create two connected ends. Each direction buffers up to `capacity` PDUs.
#[must_use]
pub fn pair(capacity: usize) -> (ChannelEnd, ChannelEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        (ChannelReadHalf { receiver: b_rx }, ChannelWriteHalf { sender: a_tx }),
        (ChannelReadHalf { receiver: a_rx }, ChannelWriteHalf { sender: b_tx }),
    )
}

/// Receiving side of an in-memory connection.
#[derive(Debug)]
pub struct ChannelReadHalf {
    /// PDUs sent by the peer.
    receiver: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ReadHalfConnection for ChannelReadHalf {
    type Error = TransportError;

    async fn receive_data(&mut self) -> Result<Vec<u8>, Self::Error> {
        self.receiver.recv().await.context(Closed)
    }
}

/// Sending side of an in-memory connection.
#[derive(Debug, Clone)]
pub struct ChannelWriteHalf {
    /// PDUs for the peer.
    sender: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl WriteHalfConnection for ChannelWriteHalf {
    type Error = TransportError;

    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Self::Error> {
        ensure!(self.sender.send(data).await.is_ok(), Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let ((mut a_read, mut a_write), (mut b_read, mut b_write)) = pair(4);
        a_write.send_data(vec![1]).await.unwrap();
        b_write.send_data(vec![2]).await.unwrap();
        assert_eq!(b_read.receive_data().await.unwrap(), [1]);
        assert_eq!(a_read.receive_data().await.unwrap(), [2]);
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let ((a_read, a_write), (mut b_read, mut b_write)) = pair(1);
        drop(a_write);
        assert!(b_read.receive_data().await.unwrap_err().is_closed());
        drop(a_read);
        assert!(b_write.send_data(vec![1]).await.unwrap_err().is_closed());
    }
}
