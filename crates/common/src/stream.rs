// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper_util::client::legacy::connect::{Connected, Connection};
use socket2::Socket;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::address::EndpointAddress;
use crate::error::Error;
use crate::sys::AsyncSocket;

/// One connected Hyper-V socket as a duplex byte stream.
///
/// Owns the socket handle; it is closed exactly once, when the stream is dropped.
#[derive(Debug)]
pub struct HvSocketStream {
    io: AsyncSocket,
}

impl HvSocketStream {
    /// Adopt a connected socket. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Fails if the socket can't be switched to non-blocking mode or registered with the
    /// reactor.
    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        Ok(Self::from_async(AsyncSocket::new(socket)?))
    }

    pub(crate) fn from_async(io: AsyncSocket) -> Self {
        Self { io }
    }

    /// # Errors
    /// `InvalidAddress` if the socket is not a Hyper-V socket.
    pub fn local_addr(&self) -> Result<EndpointAddress, Error> {
        EndpointAddress::from_sock_addr(&self.io.sock_ref().local_addr()?)
    }

    /// # Errors
    /// `InvalidAddress` if the socket is not a Hyper-V socket.
    pub fn peer_addr(&self) -> Result<EndpointAddress, Error> {
        EndpointAddress::from_sock_addr(&self.io.sock_ref().peer_addr()?)
    }
}

impl AsyncRead for HvSocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().io.poll_read(cx, buf)
    }
}

impl AsyncWrite for HvSocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().io.poll_shutdown(cx)
    }
}

// Lets a connector hand the stream to hyper-util's pooled client.
impl Connection for HvSocketStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use socket2::{Domain, Type};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_duplex_over_socketpair() -> anyhow::Result<()> {
        let (left, right) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        let mut left = HvSocketStream::from_socket(left)?;
        let mut right = HvSocketStream::from_socket(right)?;

        left.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await?;
        left.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");

        left.shutdown().await?;
        let mut rest = Vec::new();
        right.read_to_end(&mut rest).await?;
        assert!(rest.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_addresses_of_foreign_family_are_rejected() -> anyhow::Result<()> {
        let (left, _right) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        let left = HvSocketStream::from_socket(left)?;
        assert!(matches!(left.local_addr(), Err(Error::InvalidAddress(_))));
        Ok(())
    }
}
