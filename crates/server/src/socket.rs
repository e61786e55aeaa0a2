// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Default socket binder (TCP, Unix) and the listener type shared by all families.

use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, info};

use hvsock_common::socket::DEFAULT_BACKLOG;
use hvsock_common::{CancellationToken, Error, HvSocketListener};

use crate::address::{ListenAddress, PeerAddress};
use crate::connection::{Connection, ConnectionStream};
use crate::listener::{BoxFuture, ConnectionListener, ListenerFactory};

/// Creates a socket bound to the given address. Listening is started by the caller.
pub type CreateBoundListenSocket = Arc<dyn Fn(&ListenAddress) -> io::Result<Socket> + Send + Sync>;

#[derive(Clone)]
pub struct SocketTransportOptions {
    pub backlog: i32,
    /// Socket creation hook of [`SocketListenerFactory`]. Wrap the previous value to
    /// override creation for one family and leave the others untouched.
    pub create_bound_listen_socket: CreateBoundListenSocket,
}

impl Default for SocketTransportOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            create_bound_listen_socket: Arc::new(default_create_bound_listen_socket),
        }
    }
}

impl fmt::Debug for SocketTransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransportOptions")
            .field("backlog", &self.backlog)
            .finish_non_exhaustive()
    }
}

/// TCP and Unix sockets. Hyper-V endpoints need an override installed on top of it.
///
/// # Errors
/// Socket creation or `bind` failure; `Unsupported` for Hyper-V endpoints.
pub fn default_create_bound_listen_socket(addr: &ListenAddress) -> io::Result<Socket> {
    match addr {
        ListenAddress::Tcp(sa) => {
            let socket = Socket::new(Domain::for_address(*sa), Type::STREAM, Some(Protocol::TCP))?;
            #[cfg(not(windows))]
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::from(*sa))?;
            Ok(socket)
        }
        #[cfg(unix)]
        ListenAddress::Unix(path) => {
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.bind(&SockAddr::unix(path)?)?;
            Ok(socket)
        }
        ListenAddress::HyperV(endpoint) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no socket creation override for Hyper-V endpoint {endpoint}"),
        )),
    }
}

/// The default listener factory: claims TCP and Unix addresses.
#[derive(Debug, Clone, Default)]
pub struct SocketListenerFactory {
    options: SocketTransportOptions,
}

impl SocketListenerFactory {
    #[must_use]
    pub fn new(options: SocketTransportOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &SocketTransportOptions {
        &self.options
    }

    /// Bind through the socket creation hook, without consulting `can_bind`.
    ///
    /// # Errors
    /// Whatever the hook, `listen` or reactor registration report.
    pub fn listen(&self, addr: &ListenAddress) -> Result<SocketListener, Error> {
        let socket = (self.options.create_bound_listen_socket)(addr)?;
        SocketListener::from_bound_socket(addr.clone(), socket, self.options.backlog)
    }
}

impl ListenerFactory for SocketListenerFactory {
    fn can_bind(&self, addr: &ListenAddress) -> bool {
        match addr {
            ListenAddress::Tcp(_) => true,
            #[cfg(unix)]
            ListenAddress::Unix(_) => true,
            ListenAddress::HyperV(_) => false,
        }
    }

    fn bind<'a>(
        &'a self,
        addr: &'a ListenAddress,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn ConnectionListener>, Error>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let listener: Box<dyn ConnectionListener> = Box::new(self.listen(addr)?);
            Ok(listener)
        })
    }
}

#[derive(Debug)]
enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
    HyperV(HvSocketListener),
}

#[derive(Debug)]
pub struct SocketListener {
    local: ListenAddress,
    inner: Mutex<Option<Arc<Inner>>>,
    closed: CancellationToken,
}

impl SocketListener {
    /// Start listening on `socket`, already bound to `local`. Must be called from within a
    /// tokio runtime. A TCP port 0 is replaced by the port the kernel picked.
    ///
    /// # Errors
    /// `listen` or reactor registration failure.
    pub fn from_bound_socket(
        local: ListenAddress,
        socket: Socket,
        backlog: i32,
    ) -> Result<Self, Error> {
        let (local, inner) = match local {
            ListenAddress::Tcp(_) => {
                socket.listen(backlog)?;
                socket.set_nonblocking(true)?;
                let listener = TcpListener::from_std(socket.into())?;
                (ListenAddress::Tcp(listener.local_addr()?), Inner::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                socket.listen(backlog)?;
                socket.set_nonblocking(true)?;
                let listener = UnixListener::from_std(socket.into())?;
                (ListenAddress::Unix(path), Inner::Unix(listener))
            }
            ListenAddress::HyperV(endpoint) => {
                let listener = HvSocketListener::from_bound_socket(socket, backlog)?;
                (ListenAddress::HyperV(endpoint), Inner::HyperV(listener))
            }
        };
        info!("Listening on {local}");
        Ok(Self::new(local, inner))
    }

    fn new(local: ListenAddress, inner: Inner) -> Self {
        Self {
            local,
            inner: Mutex::new(Some(Arc::new(inner))),
            closed: CancellationToken::new(),
        }
    }

    async fn accept_inner(
        &self,
        inner: &Inner,
        cancel: &CancellationToken,
    ) -> Result<Connection, Error> {
        let (stream, peer) = match inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                (ConnectionStream::Tcp(stream), PeerAddress::Tcp(peer))
            }
            #[cfg(unix)]
            Inner::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer.as_pathname().map(Path::to_path_buf);
                (ConnectionStream::Unix(stream), PeerAddress::Unix(peer))
            }
            Inner::HyperV(listener) => {
                let stream = listener.accept(cancel).await?;
                let peer = stream.peer_addr().ok();
                (ConnectionStream::HyperV(stream), PeerAddress::HyperV(peer))
            }
        };
        debug!("Accepted {peer} on {}", self.local);
        Ok(Connection::new(stream, self.local.clone(), peer))
    }
}

impl ConnectionListener for SocketListener {
    fn local_addr(&self) -> &ListenAddress {
        &self.local
    }

    fn accept<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Connection, Error>> {
        Box::pin(async move {
            let inner = self
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or(Error::ListenerClosed)?;
            tokio::select! {
                biased;
                () = self.closed.cancelled() => Err(Error::ListenerClosed),
                () = cancel.cancelled() => Err(Error::Cancelled),
                accepted = self.accept_inner(&inner, cancel) => accepted,
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inner) = inner {
            if let Inner::HyperV(listener) = &*inner {
                listener.close();
            }
            debug!("Closed listener on {}", self.local);
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.close();
    }
}
