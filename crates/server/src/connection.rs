// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::server::Connected;

use hvsock_common::HvSocketStream;

use crate::address::{ListenAddress, PeerAddress};

#[derive(Debug)]
pub enum ConnectionStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    HyperV(HvSocketStream),
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub local: ListenAddress,
    pub peer: PeerAddress,
}

/// One accepted connection, whatever listener produced it. One connection carries
/// exactly one HTTP connection.
#[derive(Debug)]
pub struct Connection {
    stream: ConnectionStream,
    info: ConnectionInfo,
}

impl Connection {
    #[must_use]
    pub fn new(stream: ConnectionStream, local: ListenAddress, peer: PeerAddress) -> Self {
        Self {
            stream,
            info: ConnectionInfo { local, peer },
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> &ListenAddress {
        &self.info.local
    }

    #[must_use]
    pub fn peer_addr(&self) -> &PeerAddress {
        &self.info.peer
    }

    #[must_use]
    pub fn stream(&self) -> &ConnectionStream {
        &self.stream
    }

    #[must_use]
    pub fn into_stream(self) -> ConnectionStream {
        self.stream
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ConnectionStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ConnectionStream::HyperV(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ConnectionStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            ConnectionStream::HyperV(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ConnectionStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ConnectionStream::HyperV(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ConnectionStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ConnectionStream::HyperV(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// Allows `Incoming` to be fed to `tonic::transport::Server::serve_with_incoming`.
impl Connected for Connection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}
