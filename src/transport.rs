//! Byte-stream and datagram seams between the sessions and the network.
//!
//! The control session reads exact-length messages from a [`ControlTransport`];
//! test sessions exchange 128-byte packets over a [`DatagramTransport`]. Tokio
//! sockets implement both, tests substitute in-memory pipes.

use std::{io, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    time::{timeout_at, Instant},
};

use crate::error::{Result, TwampError};

/// Reliable ordered byte stream carrying control messages.
#[async_trait]
pub trait ControlTransport: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Reads exactly `n` bytes.
    ///
    /// Fails with `Timeout` when `deadline` passes first and with
    /// `Io(UnexpectedEof)` when the peer closes the stream.
    async fn receive_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>>;
}

#[async_trait]
impl<S> ControlTransport for S
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data).await?;
        self.flush().await?;
        Ok(())
    }

    async fn receive_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        match timeout_at(deadline, self.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(TwampError::Io(e)),
            Err(_) => Err(TwampError::Timeout("control message")),
        }
    }
}

/// Unreliable datagram endpoint carrying test packets.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_datagram(&self, data: &[u8]) -> io::Result<usize>;

    /// Waits for one datagram until `deadline`; `None` when it passes.
    async fn receive_datagram(&self, buf: &mut [u8], deadline: Instant)
        -> io::Result<Option<usize>>;
}

/// A connected socket: datagrams go to and come from the reflector only.
#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
        self.send(data).await
    }

    async fn receive_datagram(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<usize>> {
        match timeout_at(deadline, self.recv(buf)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl<T: DatagramTransport + ?Sized> DatagramTransport for Arc<T> {
    async fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
        (**self).send_datagram(data).await
    }

    async fn receive_datagram(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<usize>> {
        (**self).receive_datagram(buf, deadline).await
    }
}
