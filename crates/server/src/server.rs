// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Server listen configuration, the listener factory registry and the merged
//! stream of accepted connections.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use tokio_stream::{Stream, StreamMap};
use tracing::{debug, info, warn};

use hvsock_common::{CancellationToken, Error};

use crate::address::ListenAddress;
use crate::connection::Connection;
use crate::listener::{ConnectionListener, ListenerFactory};
use crate::socket::{SocketListenerFactory, SocketTransportOptions};

pub const SOCKET_LISTENER_FACTORY: &str = "socket";

// Pause after a connection died in the accept queue, before accepting again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

type FactoryBuilder = Box<dyn FnOnce(&SocketTransportOptions) -> Arc<dyn ListenerFactory> + Send>;

/// Mutable server transport configuration. Turned into an immutable [`Transport`] by
/// [`build`](Self::build); factories are constructed then, with the final socket options.
pub struct ServerOptions {
    socket: SocketTransportOptions,
    factories: Vec<(&'static str, FactoryBuilder)>,
    listen: Vec<ListenAddress>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let default_factory: FactoryBuilder =
            Box::new(|options: &SocketTransportOptions| -> Arc<dyn ListenerFactory> {
                Arc::new(SocketListenerFactory::new(options.clone()))
            });
        Self {
            socket: SocketTransportOptions::default(),
            factories: vec![(SOCKET_LISTENER_FACTORY, default_factory)],
            listen: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("socket", &self.socket)
            .field("factories", &self.listener_factory_names())
            .field("listen", &self.listen)
            .finish()
    }
}

impl ServerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, addr: impl Into<ListenAddress>) -> &mut Self {
        self.listen.push(addr.into());
        self
    }

    pub fn configure_socket_transport(
        &mut self,
        configure: impl FnOnce(&mut SocketTransportOptions),
    ) -> &mut Self {
        configure(&mut self.socket);
        self
    }

    #[must_use]
    pub fn socket_transport(&self) -> &SocketTransportOptions {
        &self.socket
    }

    /// Register a factory candidate. Candidates are asked in registration order, the
    /// default socket factory first.
    pub fn add_listener_factory<F>(&mut self, name: &'static str, build: F) -> &mut Self
    where
        F: FnOnce(&SocketTransportOptions) -> Arc<dyn ListenerFactory> + Send + 'static,
    {
        self.factories.push((name, Box::new(build)));
        self
    }

    /// Like [`add_listener_factory`](Self::add_listener_factory), unless `name` is
    /// already registered. Returns whether the factory was added.
    pub fn add_listener_factory_once<F>(&mut self, name: &'static str, build: F) -> bool
    where
        F: FnOnce(&SocketTransportOptions) -> Arc<dyn ListenerFactory> + Send + 'static,
    {
        if self.has_listener_factory(name) {
            return false;
        }
        self.add_listener_factory(name, build);
        true
    }

    #[must_use]
    pub fn has_listener_factory(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| *n == name)
    }

    #[must_use]
    pub fn listener_factory_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    #[must_use]
    pub fn listen_addresses(&self) -> &[ListenAddress] {
        &self.listen
    }

    #[must_use]
    pub fn build(self) -> Transport {
        let socket = self.socket;
        let factories = self
            .factories
            .into_iter()
            .map(|(name, build)| {
                debug!("Registering listener factory {name}");
                build(&socket)
            })
            .collect();
        Transport {
            factories,
            listen: self.listen.into(),
        }
    }
}

/// Frozen listener factory registry plus the addresses to listen on.
#[derive(Clone, Debug)]
pub struct Transport {
    factories: Arc<[Arc<dyn ListenerFactory>]>,
    listen: Arc<[ListenAddress]>,
}

impl Transport {
    #[must_use]
    pub fn listen_addresses(&self) -> &[ListenAddress] {
        &self.listen
    }

    /// First registered factory that claims `addr`.
    ///
    /// # Errors
    /// `NoListenerForAddress` when no factory claims it.
    pub fn listener_factory_for(
        &self,
        addr: &ListenAddress,
    ) -> Result<&Arc<dyn ListenerFactory>, Error> {
        self.factories
            .iter()
            .find(|factory| factory.can_bind(addr))
            .ok_or_else(|| Error::NoListenerForAddress(addr.to_string()))
    }

    /// # Errors
    /// `NoListenerForAddress`, `Cancelled`, or the selected factory's bind failure.
    pub async fn bind(
        &self,
        addr: &ListenAddress,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ConnectionListener>, Error> {
        let factory = self.listener_factory_for(addr)?;
        factory.bind(addr, cancel).await
    }

    /// Bind every configured address. Nothing stays bound if one of them fails.
    ///
    /// # Errors
    /// The first bind failure.
    pub async fn bind_all(&self, cancel: &CancellationToken) -> Result<Incoming, Error> {
        let mut listeners: Vec<Arc<dyn ConnectionListener>> =
            Vec::with_capacity(self.listen.len());
        for addr in self.listen.iter() {
            match self.bind(addr, cancel).await {
                Ok(listener) => listeners.push(Arc::from(listener)),
                Err(err) => {
                    listeners.iter().for_each(|listener| listener.close());
                    return Err(err);
                }
            }
        }
        Ok(Incoming::new(listeners, cancel.child_token()))
    }
}

type AcceptStream = Pin<Box<dyn Stream<Item = Result<Connection, Error>> + Send>>;

/// Accepted connections of several listeners, merged. Ends once every listener is closed
/// or the token given to [`Transport::bind_all`] is cancelled. Dropping it closes the
/// listeners.
pub struct Incoming {
    listeners: Vec<Arc<dyn ConnectionListener>>,
    streams: StreamMap<usize, AcceptStream>,
    cancel: CancellationToken,
}

impl Incoming {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn ConnectionListener>>, cancel: CancellationToken) -> Self {
        let mut streams = StreamMap::with_capacity(listeners.len());
        for (idx, listener) in listeners.iter().enumerate() {
            streams.insert(idx, accept_loop(Arc::clone(listener), cancel.clone()));
        }
        Self {
            listeners,
            streams,
            cancel,
        }
    }

    #[must_use]
    pub fn local_addrs(&self) -> Vec<ListenAddress> {
        self.listeners
            .iter()
            .map(|listener| listener.local_addr().clone())
            .collect()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        for listener in &self.listeners {
            listener.close();
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl Stream for Incoming {
    type Item = Result<Connection, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.streams)
            .poll_next(cx)
            .map(|next| next.map(|(_, item)| item))
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

fn accept_loop(listener: Arc<dyn ConnectionListener>, cancel: CancellationToken) -> AcceptStream {
    Box::pin(stream! {
        info!("Accepting connections on {}", listener.local_addr());
        loop {
            match listener.accept(&cancel).await {
                Ok(conn) => yield Ok(conn),
                Err(Error::Cancelled | Error::ListenerClosed) => break,
                Err(Error::Io(err)) if is_transient(&err) => {
                    warn!("Dropped connection on {}: {err}", listener.local_addr());
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
        debug!("Stopped accepting on {}", listener.local_addr());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStream;
    use crate::hvsock::{HVSOCK_LISTENER_FACTORY, HvSocketListenerFactory, HvSocketServerExt};
    use hvsock_common::EndpointAddress;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn loopback() -> ListenAddress {
        ListenAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn hyperv() -> ListenAddress {
        ListenAddress::HyperV(EndpointAddress::wildcard(Uuid::from_u128(7)))
    }

    fn tcp_port(addr: &ListenAddress) -> anyhow::Result<SocketAddr> {
        match addr {
            ListenAddress::Tcp(addr) => Ok(*addr),
            other => anyhow::bail!("not a TCP address: {other}"),
        }
    }

    #[test]
    fn test_no_factory_for_hyperv_by_default() {
        let transport = ServerOptions::default().build();
        assert!(transport.listener_factory_for(&loopback()).is_ok());
        let err = transport.listener_factory_for(&hyperv()).unwrap_err();
        assert!(matches!(err, Error::NoListenerForAddress(_)));
    }

    #[tokio::test]
    async fn test_hyperv_bind_without_factory_fails() {
        let transport = ServerOptions::default().build();
        let result = transport.bind(&hyperv(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::NoListenerForAddress(_))));
    }

    #[test]
    fn test_selection_with_mixed_addresses() {
        let mut options = ServerOptions::new();
        options.listen(loopback()).add_hvsock_service_listener(Uuid::from_u128(7));
        let transport = options.build();

        let addrs = transport.listen_addresses().to_vec();
        assert_eq!(addrs, [loopback(), hyperv()]);

        let socket = transport.listener_factory_for(&addrs[0]).unwrap();
        assert!(socket.can_bind(&addrs[0]));
        assert!(!socket.can_bind(&addrs[1]));
        let hvsock = transport.listener_factory_for(&addrs[1]).unwrap();
        assert!(hvsock.can_bind(&addrs[1]));
        assert!(!hvsock.can_bind(&addrs[0]));
    }

    #[test]
    fn test_add_listener_factory_once() {
        let mut options = ServerOptions::new();
        let build = |_: &SocketTransportOptions| -> Arc<dyn ListenerFactory> {
            Arc::new(HvSocketListenerFactory::default())
        };
        assert!(options.add_listener_factory_once(HVSOCK_LISTENER_FACTORY, build));
        assert!(!options.add_listener_factory_once(HVSOCK_LISTENER_FACTORY, build));
        assert_eq!(
            options.listener_factory_names(),
            [SOCKET_LISTENER_FACTORY, HVSOCK_LISTENER_FACTORY]
        );
    }

    #[tokio::test]
    async fn test_incoming_echo_over_tcp() -> anyhow::Result<()> {
        let mut options = ServerOptions::new();
        options.listen(loopback());
        let cancel = CancellationToken::new();
        let mut incoming = options.build().bind_all(&cancel).await?;
        let bound = tcp_port(&incoming.local_addrs()[0])?;

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(bound).await?;
            stream.write_all(b"ping").await?;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            anyhow::Ok(buf)
        });

        let mut conn = incoming.next().await.expect("one connection")?;
        assert!(matches!(conn.stream(), ConnectionStream::Tcp(_)));
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await?;
        conn.write_all(&buf).await?;

        assert_eq!(&client.await??, b"ping");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_incoming_merges_listeners() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("merged.sock");
        let mut options = ServerOptions::new();
        options.listen(loopback()).listen(ListenAddress::Unix(path.clone()));
        let mut incoming = options.build().bind_all(&CancellationToken::new()).await?;
        let bound = tcp_port(&incoming.local_addrs()[0])?;

        let _tcp = tokio::net::TcpStream::connect(bound).await?;
        let _unix = tokio::net::UnixStream::connect(&path).await?;

        let mut locals = Vec::new();
        for _ in 0..2 {
            let conn = incoming.next().await.expect("connection")?;
            locals.push(conn.local_addr().clone());
        }
        assert!(locals.contains(&ListenAddress::Tcp(bound)));
        assert!(locals.contains(&ListenAddress::Unix(path)));
        Ok(())
    }

    #[tokio::test]
    async fn test_incoming_ends_on_cancel() -> anyhow::Result<()> {
        let mut options = ServerOptions::new();
        options.listen(loopback());
        let cancel = CancellationToken::new();
        let mut incoming = options.build().bind_all(&cancel).await?;

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(5), incoming.next()).await?;
        assert!(next.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_bind_all_fails_on_unclaimed_address() {
        let mut options = ServerOptions::new();
        options.listen(loopback()).listen(hyperv());
        let result = options.build().bind_all(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::NoListenerForAddress(_))));
    }

    // Needs a Hyper-V host (or a Windows guest with the service GUID registered).
    #[cfg(windows)]
    #[ignore]
    #[tokio::test]
    async fn test_hyperv_echo() -> anyhow::Result<()> {
        let service_id = Uuid::new_v4();
        let mut options = ServerOptions::new();
        options.add_hvsock_service_listener(service_id);
        let mut incoming = options.build().bind_all(&CancellationToken::new()).await?;

        let client = tokio::spawn(async move {
            let endpoint =
                EndpointAddress::new(hvsock_common::address::HV_GUID_LOOPBACK, service_id);
            let mut stream = hvsock_common::connect(&endpoint, &CancellationToken::new()).await?;
            stream.write_all(b"hello").await?;
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await?;
            anyhow::Ok(buf)
        });

        let mut conn = incoming.next().await.expect("one connection")?;
        assert!(matches!(conn.stream(), ConnectionStream::HyperV(_)));
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await?;
        conn.write_all(&buf).await?;

        assert_eq!(&client.await??, b"hello");
        Ok(())
    }
}
